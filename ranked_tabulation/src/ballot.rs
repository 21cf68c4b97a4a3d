use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::arithmetic::VoteArithmetic;

/// The candidates marked at a single rank on one ballot. More than one
/// entry means the rank is overvoted; duplicates cannot occur by
/// construction in the reader layer.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CandidatesAtRanking(Vec<String>);

impl CandidatesAtRanking {
    pub fn new(candidates: Vec<String>) -> CandidatesAtRanking {
        CandidatesAtRanking(candidates)
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, candidate: &str) -> bool {
        self.0.iter().any(|c| c == candidate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }
}

/// Immutable, sparse, ascending-rank view of one ballot's choices.
///
/// Ranks are positive and may have gaps; each rank carries the full set of
/// candidates marked there.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CandidateRankings {
    ranks: Vec<(u32, CandidatesAtRanking)>,
}

impl CandidateRankings {
    /// Builds the ranking structure from (rank, candidates) pairs. Pairs
    /// are sorted by rank; ranks must be unique and positive.
    pub fn new(mut pairs: Vec<(u32, CandidatesAtRanking)>) -> CandidateRankings {
        pairs.sort_by_key(|(rank, _)| *rank);
        debug_assert!(pairs.iter().all(|(rank, _)| *rank > 0));
        debug_assert!(pairs.windows(2).all(|w| w[0].0 < w[1].0));
        CandidateRankings { ranks: pairs }
    }

    pub fn empty() -> CandidateRankings {
        CandidateRankings { ranks: Vec::new() }
    }

    pub fn num_rankings(&self) -> usize {
        self.ranks.len()
    }

    /// Highest rank carrying a mark, or 0 for an empty ballot.
    pub fn max_ranking_number(&self) -> u32 {
        self.ranks.last().map(|(rank, _)| *rank).unwrap_or(0)
    }

    pub fn has_rank(&self, rank: u32) -> bool {
        self.ranks.iter().any(|(r, _)| *r == rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, CandidatesAtRanking)> {
        self.ranks.iter()
    }
}

/// Where a ballot stands during tabulation. Once a ballot leaves `Active`
/// it never changes status again.
#[derive(Eq, PartialEq, Ord, PartialOrd, Debug, Clone, Copy, Hash)]
pub enum BallotStatus {
    Active,
    InactiveByUndervote,
    InactiveByOvervote,
    InactiveBySkippedRanking,
    InactiveByRepeatedRanking,
    InactiveByExhaustedChoices,
}

impl BallotStatus {
    pub const ALL_INACTIVE: [BallotStatus; 5] = [
        BallotStatus::InactiveByUndervote,
        BallotStatus::InactiveByOvervote,
        BallotStatus::InactiveBySkippedRanking,
        BallotStatus::InactiveByRepeatedRanking,
        BallotStatus::InactiveByExhaustedChoices,
    ];

    pub fn is_active(&self) -> bool {
        *self == BallotStatus::Active
    }

    /// Short phrase used in audit logs and outcome descriptions.
    pub fn description(&self) -> &'static str {
        match self {
            BallotStatus::Active => "active",
            BallotStatus::InactiveByUndervote => "undervote",
            BallotStatus::InactiveByOvervote => "overvote",
            BallotStatus::InactiveBySkippedRanking => "exhausted by skipped ranking",
            BallotStatus::InactiveByRepeatedRanking => "duplicate candidate",
            BallotStatus::InactiveByExhaustedChoices => "no continuing candidate",
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum VoteOutcomeType {
    Counted,
    Exhausted,
}

/// One entry in a ballot's append-only per-round audit trail.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct VoteOutcome {
    pub round: u32,
    pub outcome_type: VoteOutcomeType,
    pub description: String,
    pub value: Decimal,
}

/// A cast vote record: one voter's ballot plus its mutable tabulation
/// state.
///
/// The rankings never change; everything else evolves as rounds progress.
/// The invariant `fractional_transfer_value + sum(winner credits) <= 1`
/// holds at all times, with equality once the ballot is exhausted or fully
/// credited to winners.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CastVoteRecord {
    pub id: String,
    pub precinct: Option<String>,
    pub precinct_portion: Option<String>,
    pub tabulator_id: Option<String>,
    pub batch_id: Option<String>,
    pub rankings: CandidateRankings,

    current_recipient: Option<String>,
    ballot_status: BallotStatus,
    fractional_transfer_value: Decimal,
    winner_to_fractional_value: BTreeMap<String, Decimal>,
    round_outcomes: Vec<VoteOutcome>,
    cdf_snapshots: BTreeMap<u32, Vec<(String, Decimal)>>,
}

impl CastVoteRecord {
    pub fn new(id: &str, rankings: CandidateRankings) -> CastVoteRecord {
        CastVoteRecord {
            id: id.to_string(),
            precinct: None,
            precinct_portion: None,
            tabulator_id: None,
            batch_id: None,
            rankings,
            current_recipient: None,
            ballot_status: BallotStatus::Active,
            fractional_transfer_value: Decimal::ONE,
            winner_to_fractional_value: BTreeMap::new(),
            round_outcomes: Vec::new(),
            cdf_snapshots: BTreeMap::new(),
        }
    }

    pub fn with_precinct(mut self, precinct: &str) -> CastVoteRecord {
        self.precinct = Some(precinct.to_string());
        self
    }

    pub fn is_exhausted(&self) -> bool {
        !self.ballot_status.is_active()
    }

    pub fn ballot_status(&self) -> BallotStatus {
        self.ballot_status
    }

    pub fn current_recipient(&self) -> Option<&str> {
        self.current_recipient.as_deref()
    }

    pub fn set_current_recipient(&mut self, candidate: Option<String>) {
        self.current_recipient = candidate;
    }

    pub fn fractional_transfer_value(&self) -> Decimal {
        self.fractional_transfer_value
    }

    pub fn winner_to_fractional_value(&self) -> &BTreeMap<String, Decimal> {
        &self.winner_to_fractional_value
    }

    pub fn round_outcomes(&self) -> &[VoteOutcome] {
        &self.round_outcomes
    }

    pub fn cdf_snapshot(&self, round: u32) -> Option<&[(String, Decimal)]> {
        self.cdf_snapshots.get(&round).map(|v| v.as_slice())
    }

    /// Marks the ballot inactive. The status is final: a ballot never
    /// re-activates, and its recipient is cleared.
    pub fn exhaust_by(&mut self, status: BallotStatus) {
        debug_assert!(!status.is_active());
        debug_assert!(self.ballot_status.is_active());
        self.ballot_status = status;
        self.current_recipient = None;
    }

    /// Splits the ballot's value after its current recipient won a seat.
    ///
    /// The winner keeps `ftv - ftv * surplus_fraction` (credited
    /// permanently in `winner_to_fractional_value`); the remainder
    /// `ftv * surplus_fraction` stays on the ballot and flows onward when
    /// the walk re-routes it in the next round.
    pub fn record_current_recipient_as_winner(
        &mut self,
        surplus_fraction: Decimal,
        arithmetic: &VoteArithmetic,
    ) {
        let winner = self
            .current_recipient
            .clone()
            .expect("recording a winner on a ballot with no recipient");
        let new_transfer_value =
            arithmetic.multiply(self.fractional_transfer_value, surplus_fraction);
        let allocated = self.fractional_transfer_value - new_transfer_value;
        *self
            .winner_to_fractional_value
            .entry(winner)
            .or_insert(Decimal::ZERO) += allocated;
        self.fractional_transfer_value = new_transfer_value;
    }

    pub fn log_round_outcome(
        &mut self,
        round: u32,
        outcome_type: VoteOutcomeType,
        description: &str,
        value: Decimal,
    ) {
        self.round_outcomes.push(VoteOutcome {
            round,
            outcome_type,
            description: description.to_string(),
            value,
        });
    }

    /// Records the ballot's current allocations for the NIST CDF export:
    /// all permanent winner credits plus the live remainder, if any.
    pub fn log_cdf_snapshot(&mut self, round: u32) {
        let mut allocations: Vec<(String, Decimal)> = self
            .winner_to_fractional_value
            .iter()
            .map(|(winner, value)| (winner.clone(), *value))
            .collect();
        if let Some(recipient) = &self.current_recipient {
            allocations.push((recipient.clone(), self.fractional_transfer_value));
        }
        self.cdf_snapshots.insert(round, allocations);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ranking(pairs: &[(u32, &[&str])]) -> CandidateRankings {
        CandidateRankings::new(
            pairs
                .iter()
                .map(|(rank, names)| {
                    (
                        *rank,
                        CandidatesAtRanking::new(names.iter().map(|s| s.to_string()).collect()),
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn rankings_are_sorted_and_sparse() {
        let r = ranking(&[(3, &["C"]), (1, &["A"])]);
        assert_eq!(r.num_rankings(), 2);
        assert_eq!(r.max_ranking_number(), 3);
        assert!(r.has_rank(1));
        assert!(!r.has_rank(2));
        let ranks: Vec<u32> = r.iter().map(|(rank, _)| *rank).collect();
        assert_eq!(ranks, vec![1, 3]);
    }

    #[test]
    fn empty_ballot() {
        let r = CandidateRankings::empty();
        assert_eq!(r.num_rankings(), 0);
        assert_eq!(r.max_ranking_number(), 0);
    }

    #[test]
    fn exhaustion_clears_recipient_and_is_final() {
        let mut cvr = CastVoteRecord::new("b-1", ranking(&[(1, &["A"])]));
        cvr.set_current_recipient(Some("A".to_string()));
        cvr.exhaust_by(BallotStatus::InactiveByOvervote);
        assert!(cvr.is_exhausted());
        assert_eq!(cvr.current_recipient(), None);
        assert_eq!(cvr.ballot_status(), BallotStatus::InactiveByOvervote);
    }

    #[test]
    fn winner_credit_splits_the_transfer_value() {
        let arithmetic = VoteArithmetic::new(4, false);
        let mut cvr = CastVoteRecord::new("b-1", ranking(&[(1, &["A"]), (2, &["B"])]));
        cvr.set_current_recipient(Some("A".to_string()));

        // surplus fraction 26/60 truncated to 4 places
        cvr.record_current_recipient_as_winner(dec!(0.4333), &arithmetic);
        assert_eq!(cvr.fractional_transfer_value(), dec!(0.4333));
        assert_eq!(cvr.winner_to_fractional_value()["A"], dec!(0.5667));
        // the ballot still sums to one
        assert_eq!(
            cvr.fractional_transfer_value() + cvr.winner_to_fractional_value()["A"],
            Decimal::ONE
        );
        // the recipient of record stays put until the next round's walk
        assert_eq!(cvr.current_recipient(), Some("A"));
    }

    #[test]
    fn winner_credit_accumulates() {
        let arithmetic = VoteArithmetic::new(4, false);
        let mut cvr = CastVoteRecord::new("b-1", ranking(&[(1, &["A"])]));
        cvr.set_current_recipient(Some("A".to_string()));
        cvr.record_current_recipient_as_winner(dec!(0.5), &arithmetic);
        cvr.set_current_recipient(Some("A".to_string()));
        cvr.record_current_recipient_as_winner(dec!(0.5), &arithmetic);
        assert_eq!(cvr.winner_to_fractional_value()["A"], dec!(0.75));
        assert_eq!(cvr.fractional_transfer_value(), dec!(0.25));
    }

    #[test]
    fn cdf_snapshot_captures_credits_and_remainder() {
        let arithmetic = VoteArithmetic::new(4, false);
        let mut cvr = CastVoteRecord::new("b-1", ranking(&[(1, &["A"]), (2, &["B"])]));
        cvr.set_current_recipient(Some("A".to_string()));
        cvr.record_current_recipient_as_winner(dec!(0.4000), &arithmetic);
        cvr.log_cdf_snapshot(2);
        let snapshot = cvr.cdf_snapshot(2).unwrap();
        assert_eq!(
            snapshot,
            &[
                ("A".to_string(), dec!(0.6000)),
                ("A".to_string(), dec!(0.4000))
            ]
        );
    }
}
