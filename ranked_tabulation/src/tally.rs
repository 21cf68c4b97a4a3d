use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::ballot::BallotStatus;

/// Lifecycle of a [`RoundTally`]: open while ballots are being walked,
/// locked once the round is computed, and re-opened exactly once per round
/// for the past-winner surplus adjustment.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
enum LockState {
    Open,
    Locked,
    SurplusAdjustment,
}

/// Per-round, per-candidate vote totals plus the inactive-ballot tallies
/// and the winning threshold.
///
/// The candidate set is fixed at construction to the candidates continuing
/// at the start of the round. After `lock_in_round` the tally is immutable
/// except through the explicit, single-use
/// `unlock_for_surplus_calculation` / `relock_after_surplus_calculation`
/// window. Misusing the lock protocol is a programming error and panics.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RoundTally {
    round: u32,
    tallies: BTreeMap<String, Decimal>,
    inactive: BTreeMap<BallotStatus, Decimal>,
    winning_threshold: Decimal,
    lock: LockState,
    surplus_window_used: bool,
}

impl RoundTally {
    pub fn new<I: IntoIterator<Item = String>>(round: u32, candidates: I) -> RoundTally {
        let tallies = candidates
            .into_iter()
            .map(|c| (c, Decimal::ZERO))
            .collect();
        RoundTally {
            round,
            tallies,
            inactive: BTreeMap::new(),
            winning_threshold: Decimal::ZERO,
            lock: LockState::Open,
            surplus_window_used: false,
        }
    }

    pub fn round_number(&self) -> u32 {
        self.round
    }

    pub fn add_to_candidate_tally(&mut self, candidate: &str, value: Decimal) {
        assert_eq!(self.lock, LockState::Open, "tally for round {} is locked", self.round);
        let tally = self
            .tallies
            .get_mut(candidate)
            .unwrap_or_else(|| panic!("candidate {} is not in the round {} tally", candidate, self.round));
        *tally += value;
    }

    pub fn candidate_tally(&self, candidate: &str) -> Option<Decimal> {
        self.tallies.get(candidate).copied()
    }

    /// Candidates in this round's tally, in sorted order.
    pub fn candidates(&self) -> Vec<String> {
        self.tallies.keys().cloned().collect()
    }

    pub fn contains_candidate(&self, candidate: &str) -> bool {
        self.tallies.contains_key(candidate)
    }

    pub fn tallies(&self) -> &BTreeMap<String, Decimal> {
        &self.tallies
    }

    pub fn num_active_candidates(&self) -> usize {
        self.tallies.len()
    }

    /// Sum of all candidate tallies, i.e. the weight of ballots still in
    /// play this round.
    pub fn num_active_ballots(&self) -> Decimal {
        self.tallies.values().sum()
    }

    pub fn num_inactive_ballots(&self) -> Decimal {
        self.inactive.values().sum()
    }

    pub fn add_inactive_ballot(&mut self, status: BallotStatus, value: Decimal) {
        assert_eq!(self.lock, LockState::Open, "tally for round {} is locked", self.round);
        debug_assert!(!status.is_active());
        *self.inactive.entry(status).or_insert(Decimal::ZERO) += value;
    }

    pub fn inactive_tally(&self, status: BallotStatus) -> Decimal {
        self.inactive.get(&status).copied().unwrap_or(Decimal::ZERO)
    }

    /// Number of candidates whose tally meets or exceeds `votes`.
    pub fn num_candidates_meeting(&self, votes: Decimal) -> usize {
        self.tallies.values().filter(|t| **t >= votes).count()
    }

    pub fn set_winning_threshold(&mut self, threshold: Decimal) {
        self.winning_threshold = threshold;
    }

    pub fn winning_threshold(&self) -> Decimal {
        self.winning_threshold
    }

    pub fn lock_in_round(&mut self) {
        assert_eq!(self.lock, LockState::Open, "round {} already locked", self.round);
        self.lock = LockState::Locked;
    }

    /// Opens the single surplus-adjustment window for this round, used to
    /// credit past-round winners whose votes the regular walk skips.
    pub fn unlock_for_surplus_calculation(&mut self) {
        assert_eq!(self.lock, LockState::Locked, "round {} is not locked", self.round);
        assert!(
            !self.surplus_window_used,
            "surplus adjustment already performed for round {}",
            self.round
        );
        self.lock = LockState::SurplusAdjustment;
        self.surplus_window_used = true;
    }

    pub fn relock_after_surplus_calculation(&mut self) {
        assert_eq!(
            self.lock,
            LockState::SurplusAdjustment,
            "round {} is not in surplus adjustment",
            self.round
        );
        self.lock = LockState::Locked;
    }

    pub fn set_candidate_tally_via_surplus_adjustment(&mut self, candidate: &str, value: Decimal) {
        assert_eq!(
            self.lock,
            LockState::SurplusAdjustment,
            "round {} is not in surplus adjustment",
            self.round
        );
        self.tallies.insert(candidate.to_string(), value);
    }

    pub fn add_to_candidate_tally_via_surplus_adjustment(
        &mut self,
        candidate: &str,
        value: Decimal,
    ) {
        assert_eq!(
            self.lock,
            LockState::SurplusAdjustment,
            "round {} is not in surplus adjustment",
            self.round
        );
        *self
            .tallies
            .entry(candidate.to_string())
            .or_insert(Decimal::ZERO) += value;
    }
}

/// Ledger of vote movements between candidates, by round.
///
/// Sources and targets are candidate identifiers or one of the reserved
/// strings: `uncounted` (a ballot's first allocation), `exhausted` (value
/// leaving the active pool) and `residual` (fractional surplus lost to
/// rounding).
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct TallyTransfers {
    transfers: BTreeMap<u32, BTreeMap<String, BTreeMap<String, Decimal>>>,
}

impl TallyTransfers {
    pub const RESIDUAL_TARGET: &'static str = "residual";
    pub const EXHAUSTED_TARGET: &'static str = "exhausted";
    pub const UNCOUNTED_SOURCE: &'static str = "uncounted";

    pub fn new() -> TallyTransfers {
        TallyTransfers::default()
    }

    /// Appends a transfer. `None` stands for the initial count on the
    /// source side and for exhaustion on the target side.
    pub fn add_transfer(
        &mut self,
        round: u32,
        source: Option<&str>,
        target: Option<&str>,
        value: Decimal,
    ) {
        let source = source.unwrap_or(Self::UNCOUNTED_SOURCE).to_string();
        let target = target.unwrap_or(Self::EXHAUSTED_TARGET).to_string();
        *self
            .transfers
            .entry(round)
            .or_default()
            .entry(source)
            .or_default()
            .entry(target)
            .or_insert(Decimal::ZERO) += value;
    }

    pub fn transfers_for_round(
        &self,
        round: u32,
    ) -> Option<&BTreeMap<String, BTreeMap<String, Decimal>>> {
        self.transfers.get(&round)
    }

    pub fn transfers_from(&self, round: u32, source: &str) -> Option<&BTreeMap<String, Decimal>> {
        self.transfers.get(&round).and_then(|m| m.get(source))
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tally_with(candidates: &[&str]) -> RoundTally {
        RoundTally::new(1, candidates.iter().map(|s| s.to_string()))
    }

    #[test]
    fn active_and_inactive_sums() {
        let mut tally = tally_with(&["A", "B"]);
        tally.add_to_candidate_tally("A", dec!(2));
        tally.add_to_candidate_tally("B", dec!(0.5));
        tally.add_inactive_ballot(BallotStatus::InactiveByOvervote, dec!(1));
        tally.add_inactive_ballot(BallotStatus::InactiveByOvervote, dec!(1));
        assert_eq!(tally.num_active_ballots(), dec!(2.5));
        assert_eq!(tally.num_inactive_ballots(), dec!(2));
        assert_eq!(tally.inactive_tally(BallotStatus::InactiveByOvervote), dec!(2));
        assert_eq!(tally.inactive_tally(BallotStatus::InactiveByUndervote), dec!(0));
        assert_eq!(tally.num_candidates_meeting(dec!(0.5)), 2);
        assert_eq!(tally.num_candidates_meeting(dec!(2)), 1);
    }

    #[test]
    #[should_panic(expected = "locked")]
    fn locked_tally_rejects_mutation() {
        let mut tally = tally_with(&["A"]);
        tally.lock_in_round();
        tally.add_to_candidate_tally("A", dec!(1));
    }

    #[test]
    #[should_panic(expected = "not in the round")]
    fn unknown_candidate_rejected() {
        let mut tally = tally_with(&["A"]);
        tally.add_to_candidate_tally("B", dec!(1));
    }

    #[test]
    fn surplus_window_allows_one_adjustment_pass() {
        let mut tally = tally_with(&["A"]);
        tally.lock_in_round();
        tally.unlock_for_surplus_calculation();
        tally.set_candidate_tally_via_surplus_adjustment("W", dec!(0));
        tally.add_to_candidate_tally_via_surplus_adjustment("W", dec!(3));
        tally.relock_after_surplus_calculation();
        assert_eq!(tally.candidate_tally("W"), Some(dec!(3)));
    }

    #[test]
    #[should_panic(expected = "already performed")]
    fn surplus_window_is_single_use() {
        let mut tally = tally_with(&["A"]);
        tally.lock_in_round();
        tally.unlock_for_surplus_calculation();
        tally.relock_after_surplus_calculation();
        tally.unlock_for_surplus_calculation();
    }

    #[test]
    fn transfers_accumulate_per_edge() {
        let mut transfers = TallyTransfers::new();
        transfers.add_transfer(1, None, Some("A"), dec!(2));
        transfers.add_transfer(1, None, Some("A"), dec!(1));
        transfers.add_transfer(2, Some("A"), None, dec!(0.5));
        transfers.add_transfer(2, Some("A"), Some(TallyTransfers::RESIDUAL_TARGET), dec!(0.1));

        let round1 = transfers.transfers_for_round(1).unwrap();
        assert_eq!(round1[TallyTransfers::UNCOUNTED_SOURCE]["A"], dec!(3));
        let from_a = transfers.transfers_from(2, "A").unwrap();
        assert_eq!(from_a[TallyTransfers::EXHAUSTED_TARGET], dec!(0.5));
        assert_eq!(from_a[TallyTransfers::RESIDUAL_TARGET], dec!(0.1));
        assert!(transfers.transfers_for_round(3).is_none());
    }
}
