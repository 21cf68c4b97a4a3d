use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rust_decimal::Decimal;

use crate::arithmetic::VoteArithmetic;
use crate::ballot::{BallotStatus, CastVoteRecord, VoteOutcomeType};
use crate::config::{
    ContestConfig, TiebreakMode, EXPLICIT_OVERVOTE_LABEL, UNDECLARED_WRITE_IN_LABEL,
};
use crate::overvote::{decide_overvote, OvervoteDecision};
use crate::tally::{RoundTally, TallyTransfers};
use crate::tiebreak::{InteractiveTiebreakPrompt, Tiebreak};
use crate::TabulationError;

/// Where a candidate stands relative to the rounds tabulated so far.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum CandidateStatus {
    Continuing,
    Winner,
    Eliminated,
    /// Declared in the config but never tabulated.
    Excluded,
    /// The overvote sentinel; it can never receive votes.
    Invalid,
}

/// Record of one batch elimination, with the running total that witnessed
/// it and the next-lowest tally that made leapfrogging impossible.
#[derive(Eq, PartialEq, Debug, Clone)]
struct BatchElimination {
    candidate: String,
    running_total: Decimal,
    next_lowest_tally: Decimal,
}

struct TiebreakOutcome {
    selection: String,
    explanation: String,
    non_selected: String,
}

/// Immutable results of a completed tabulation, for the writer layer.
#[derive(Debug, Clone)]
pub struct ContestResult {
    pub num_rounds: u32,
    pub round_tallies: BTreeMap<u32, RoundTally>,
    pub precinct_round_tallies: BTreeMap<String, BTreeMap<u32, RoundTally>>,
    pub tally_transfers: TallyTransfers,
    pub precinct_tally_transfers: BTreeMap<String, TallyTransfers>,
    pub candidate_to_round_eliminated: BTreeMap<String, u32>,
    pub winner_to_round: BTreeMap<String, u32>,
    pub round_to_residual_surplus: BTreeMap<u32, Decimal>,
    pub precinct_ids: BTreeSet<String>,
    pub cast_vote_records: Vec<CastVoteRecord>,
}

impl ContestResult {
    /// Winners ordered by the round they won, then by name.
    pub fn winners(&self) -> Vec<String> {
        let mut winners: Vec<(&u32, &String)> =
            self.winner_to_round.iter().map(|(w, r)| (r, w)).collect();
        winners.sort();
        winners.into_iter().map(|(_, w)| w.clone()).collect()
    }
}

/// Runs the round loop for a single contest.
///
/// On each loop a round is tallied and tabulated according to the
/// configured rules: ballots are walked once, the winning threshold is
/// fixed, winners are identified (and their surplus distributed) or
/// candidates are eliminated, and the round tally is locked. Results are
/// narrated to the log as the audit trail.
impl std::fmt::Debug for Tabulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tabulator")
            .field("current_round", &self.current_round)
            .finish_non_exhaustive()
    }
}

pub struct Tabulator {
    cast_vote_records: Vec<CastVoteRecord>,
    config: ContestConfig,
    arithmetic: VoteArithmetic,
    candidate_names: BTreeSet<String>,
    // Working copy; GeneratePermutation sorts and shuffles it once at the
    // start of tabulation.
    candidate_permutation: Vec<String>,
    round_tallies: BTreeMap<u32, RoundTally>,
    precinct_round_tallies: BTreeMap<String, BTreeMap<u32, RoundTally>>,
    candidate_to_round_eliminated: BTreeMap<String, u32>,
    winner_to_round: BTreeMap<String, u32>,
    tally_transfers: TallyTransfers,
    precinct_tally_transfers: BTreeMap<String, TallyTransfers>,
    round_to_residual_surplus: BTreeMap<u32, Decimal>,
    precinct_ids: BTreeSet<String>,
    current_round: u32,
    rng: Option<StdRng>,
    prompt: Option<Box<dyn InteractiveTiebreakPrompt>>,
    cancel_flag: Option<Arc<AtomicBool>>,
}

impl Tabulator {
    pub fn new(
        cast_vote_records: Vec<CastVoteRecord>,
        config: ContestConfig,
    ) -> Result<Tabulator, TabulationError> {
        if config.needs_random_seed() && config.random_seed.is_none() {
            return Err(TabulationError::InvalidConfig {
                reason: format!(
                    "tiebreak mode {:?} requires a random seed",
                    config.tiebreak_mode
                ),
            });
        }
        if config.is_multi_seat_bottoms_up_with_threshold()
            && config.multi_seat_bottoms_up_percentage_threshold.is_none()
        {
            return Err(TabulationError::InvalidConfig {
                reason: "bottoms-up with threshold requires a percentage threshold".to_string(),
            });
        }

        let precinct_ids: BTreeSet<String> = cast_vote_records
            .iter()
            .filter_map(|cvr| cvr.precinct.clone())
            .collect();

        let mut precinct_round_tallies = BTreeMap::new();
        let mut precinct_tally_transfers = BTreeMap::new();
        if config.tabulate_by_precinct {
            if precinct_ids.is_empty() {
                return Err(TabulationError::NoPrecinctsInData);
            }
            for precinct in &precinct_ids {
                precinct_round_tallies.insert(precinct.clone(), BTreeMap::new());
                precinct_tally_transfers.insert(precinct.clone(), TallyTransfers::new());
            }
        }

        Ok(Tabulator {
            arithmetic: config.arithmetic(),
            candidate_names: config.candidate_names(),
            candidate_permutation: config.candidate_permutation.clone(),
            cast_vote_records,
            config,
            round_tallies: BTreeMap::new(),
            precinct_round_tallies,
            candidate_to_round_eliminated: BTreeMap::new(),
            winner_to_round: BTreeMap::new(),
            tally_transfers: TallyTransfers::new(),
            precinct_tally_transfers,
            round_to_residual_surplus: BTreeMap::new(),
            precinct_ids,
            current_round: 0,
            rng: None,
            prompt: None,
            cancel_flag: None,
        })
    }

    /// Installs the callback used by the interactive tiebreak modes.
    pub fn with_interactive_prompt(
        mut self,
        prompt: Box<dyn InteractiveTiebreakPrompt>,
    ) -> Tabulator {
        self.prompt = Some(prompt);
        self
    }

    /// Installs a flag polled between rounds; raising it aborts the
    /// tabulation with a user-cancellation error.
    pub fn with_cancellation_flag(mut self, flag: Arc<AtomicBool>) -> Tabulator {
        self.cancel_flag = Some(flag);
        self
    }

    /// Runs the main tabulation routine and returns the winner set.
    pub fn tabulate(&mut self) -> Result<BTreeSet<String>, TabulationError> {
        if self.config.needs_random_seed() {
            let seed = self
                .config
                .random_seed
                .expect("validated at construction");
            let mut rng = StdRng::seed_from_u64(seed);
            if self.config.tiebreak_mode == TiebreakMode::GeneratePermutation {
                // sort first for reproducibility, then shuffle once
                self.candidate_permutation.sort();
                self.candidate_permutation.shuffle(&mut rng);
            }
            self.rng = Some(rng);
        }

        self.log_summary_info();

        // Loop until the winner(s) are found, with a couple exceptions:
        // continue-until-two keeps going after the winner is known, and
        // bottoms-up with threshold loops until every remaining candidate
        // clears the percentage threshold. Each iteration either elects
        // (and redistributes surplus) or eliminates.
        while self.should_continue_tabulating() {
            self.check_for_cancellation()?;
            self.current_round += 1;
            info!("Round: {}", self.current_round);

            let continuing = self.continuing_candidates();
            let mut current_round_tally =
                self.compute_tallies_for_round(self.current_round, &continuing)?;

            let carried_residual = if self.current_round == 1 {
                Decimal::ZERO
            } else {
                self.round_to_residual_surplus[&(self.current_round - 1)]
            };
            self.round_to_residual_surplus
                .insert(self.current_round, carried_residual);

            // The winning threshold of a standard multi-seat contest is
            // fixed by the first round. Single-winner recomputes every
            // round unless the first round determines the threshold.
            let should_recompute_threshold = if self.config.num_winners > 1 {
                self.current_round == 1
            } else {
                !self.config.first_round_determines_threshold || self.current_round == 1
            };
            if should_recompute_threshold {
                Self::set_winning_threshold(&mut current_round_tally, &self.config);
            } else {
                let last_round_threshold =
                    self.round_tallies[&(self.current_round - 1)].winning_threshold();
                current_round_tally.set_winning_threshold(last_round_threshold);
            }

            let tally_to_candidates = Self::build_tally_to_candidates(
                &current_round_tally,
                &current_round_tally.candidates(),
                true,
            );
            let winners = self.identify_winners(&current_round_tally, &tally_to_candidates)?;

            if !winners.is_empty() {
                for winner in &winners {
                    self.winner_to_round
                        .insert(winner.clone(), self.current_round);
                }
                // In multi-seat contests the surplus (if any) is always
                // redistributed unless bottoms-up is enabled.
                if self.config.num_winners > 1
                    && !self.config.is_multi_seat_bottoms_up_until_n_winners()
                {
                    self.distribute_surplus(&winners, &current_round_tally);
                }
            } else if self.winner_to_round.len() < self.config.num_winners as usize
                || (self.config.continue_until_two_candidates_remain
                    && self.candidate_to_round_eliminated.len()
                        < self.config.num_candidates().saturating_sub(2))
                || self.config.is_multi_seat_bottoms_up_with_threshold()
            {
                // More eliminations are needed: seats are unfilled, or the
                // contest continues until two remain, or not every
                // remaining candidate clears the bottoms-up threshold.
                // Four mutually exclusive elimination steps.
                let mut eliminated = self.drop_undeclared_write_ins(&current_round_tally);
                if eliminated.is_empty() {
                    eliminated = self.drop_candidates_below_threshold(&tally_to_candidates);
                    // Edge case: everyone below the minimum threshold. Can
                    // only happen in the first (or, after dropping
                    // write-ins, second) round.
                    if eliminated.len() == self.config.num_declared_candidates() {
                        return Err(TabulationError::AllCandidatesBelowMinimumThreshold);
                    }
                }
                if eliminated.is_empty() {
                    eliminated = self.do_batch_elimination(&tally_to_candidates);
                }
                if eliminated.is_empty() {
                    eliminated = self.do_regular_elimination(&tally_to_candidates)?;
                }
                if eliminated.is_empty() {
                    return Err(TabulationError::NoCandidateToEliminate {
                        round: self.current_round,
                    });
                }
                for loser in eliminated {
                    self.candidate_to_round_eliminated
                        .insert(loser, self.current_round);
                }
            }

            if self.config.num_winners > 1 {
                self.update_winner_tallies(&mut current_round_tally)?;
            }

            self.round_tallies
                .insert(self.current_round, current_round_tally);
        }

        Ok(self.winner_to_round.keys().cloned().collect())
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn round_tallies(&self) -> &BTreeMap<u32, RoundTally> {
        &self.round_tallies
    }

    pub fn tally_transfers(&self) -> &TallyTransfers {
        &self.tally_transfers
    }

    pub fn winner_to_round(&self) -> &BTreeMap<String, u32> {
        &self.winner_to_round
    }

    pub fn candidate_to_round_eliminated(&self) -> &BTreeMap<String, u32> {
        &self.candidate_to_round_eliminated
    }

    pub fn cast_vote_records(&self) -> &[CastVoteRecord] {
        &self.cast_vote_records
    }

    pub fn precinct_ids(&self) -> &BTreeSet<String> {
        &self.precinct_ids
    }

    /// Consumes the tabulator, yielding the immutable outputs for the
    /// writer layer.
    pub fn into_result(self) -> ContestResult {
        ContestResult {
            num_rounds: self.current_round,
            round_tallies: self.round_tallies,
            precinct_round_tallies: self.precinct_round_tallies,
            tally_transfers: self.tally_transfers,
            precinct_tally_transfers: self.precinct_tally_transfers,
            candidate_to_round_eliminated: self.candidate_to_round_eliminated,
            winner_to_round: self.winner_to_round,
            round_to_residual_surplus: self.round_to_residual_surplus,
            precinct_ids: self.precinct_ids,
            cast_vote_records: self.cast_vote_records,
        }
    }

    fn check_for_cancellation(&self) -> Result<(), TabulationError> {
        match &self.cancel_flag {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(TabulationError::CancelledByUser),
            _ => Ok(()),
        }
    }

    fn log_summary_info(&self) {
        info!(
            "There are {} declared candidates for this contest:",
            self.config.num_declared_candidates()
        );
        for candidate in &self.candidate_names {
            if candidate != UNDECLARED_WRITE_IN_LABEL {
                info!(
                    "{}{}",
                    candidate,
                    if self.config.candidate_is_excluded(candidate) {
                        " (excluded from tabulation)"
                    } else {
                        ""
                    }
                );
            }
        }
        if self.config.tiebreak_mode == TiebreakMode::GeneratePermutation {
            info!("Randomly generated candidate permutation for tie-breaking:");
            for candidate in &self.candidate_permutation {
                info!("{}", candidate);
            }
        }
    }

    fn should_continue_tabulating(&self) -> bool {
        let num_eliminated = self.candidate_to_round_eliminated.len();
        let num_winners_declared = self.winner_to_round.len();
        if let Some(stop_after) = self.config.stop_tabulation_early_after_round {
            if self.current_round >= stop_after {
                return false;
            }
        }
        if self.config.continue_until_two_candidates_remain {
            // Keep going while more than two candidates are alive, plus one
            // last round after the final elimination.
            num_eliminated + num_winners_declared + 1 < self.config.num_candidates()
                || self
                    .candidate_to_round_eliminated
                    .values()
                    .any(|r| *r == self.current_round)
        } else if self.config.is_multi_seat_bottoms_up_with_threshold() {
            // Done as soon as any winners have been declared.
            num_winners_declared == 0
        } else {
            // Keep going while seats are unfilled. A standard multi-seat
            // contest also tabulates one extra round after the last winner
            // to show the final surplus redistribution.
            num_winners_declared < self.config.num_winners as usize
                || (self.config.num_winners > 1
                    && self
                        .winner_to_round
                        .values()
                        .any(|r| *r == self.current_round)
                    && !self.config.is_multi_seat_bottoms_up_until_n_winners())
        }
    }

    fn candidate_status(&self, candidate: &str) -> CandidateStatus {
        if self.config.candidate_is_excluded(candidate) {
            CandidateStatus::Excluded
        } else if self.winner_to_round.contains_key(candidate) {
            CandidateStatus::Winner
        } else if self.candidate_to_round_eliminated.contains_key(candidate) {
            CandidateStatus::Eliminated
        } else if candidate == EXPLICIT_OVERVOTE_LABEL {
            CandidateStatus::Invalid
        } else {
            CandidateStatus::Continuing
        }
    }

    // Under continue-until-two a past winner keeps receiving votes, so the
    // final rounds still show meaningful totals.
    fn is_candidate_continuing(&self, candidate: &str) -> bool {
        match self.candidate_status(candidate) {
            CandidateStatus::Continuing => true,
            CandidateStatus::Winner => self.config.continue_until_two_candidates_remain,
            _ => false,
        }
    }

    fn continuing_candidates(&self) -> BTreeSet<String> {
        self.candidate_names
            .iter()
            .filter(|c| self.is_candidate_continuing(c))
            .cloned()
            .collect()
    }

    /// "Inverts" a round tally into a sorted map from tally to the
    /// candidates holding it, the shape used by winner selection, the
    /// elimination steps, and tie-breaking.
    fn build_tally_to_candidates(
        round_tally: &RoundTally,
        candidates_to_include: &[String],
        should_log: bool,
    ) -> BTreeMap<Decimal, Vec<String>> {
        let mut tally_to_candidates: BTreeMap<Decimal, Vec<String>> = BTreeMap::new();
        for candidate in candidates_to_include {
            let votes = round_tally
                .candidate_tally(candidate)
                .unwrap_or(Decimal::ZERO);
            if should_log {
                info!("Candidate \"{}\" got {} vote(s).", candidate, votes);
            }
            tally_to_candidates
                .entry(votes)
                .or_default()
                .push(candidate.clone());
        }
        tally_to_candidates
    }

    fn set_winning_threshold(round_tally: &mut RoundTally, config: &ContestConfig) {
        let total_votes = round_tally.num_active_ballots();
        let arithmetic = config.arithmetic();

        let mut winning_threshold = if config.is_multi_seat_bottoms_up_with_threshold() {
            let percentage = config
                .multi_seat_bottoms_up_percentage_threshold
                .expect("validated at construction");
            arithmetic.multiply(total_votes, percentage)
        } else {
            // Divisor is num winners + 1, unless the archaic Hare quota is
            // in use, in which case it is just num winners.
            let divisor = Decimal::from(if config.hare_quota {
                config.num_winners
            } else {
                config.num_winners + 1
            });
            if config.hare_quota {
                // Rounding up simulates "greater than or equal to":
                // threshold = ceiling(votes / num_winners)
                arithmetic.divide_up_threshold(total_votes, divisor)
            } else {
                // Rounding down then adding the augend simulates "greater
                // than": threshold = floor(votes / (num_winners + 1)) + augend
                arithmetic.divide_down_threshold(total_votes, divisor)
                    + arithmetic.threshold_augend()
            }
        };

        if config.minimum_vote_threshold > Decimal::ZERO
            && config.minimum_vote_threshold > winning_threshold
        {
            winning_threshold = config.minimum_vote_threshold;
        }

        round_tally.set_winning_threshold(winning_threshold);
        info!("Winning threshold set to {}.", winning_threshold);
    }

    fn identify_winners(
        &mut self,
        current_round_tally: &RoundTally,
        tally_to_candidates: &BTreeMap<Decimal, Vec<String>>,
    ) -> Result<Vec<String>, TabulationError> {
        let mut selected_winners: Vec<String> = Vec::new();

        if self.config.is_multi_seat_bottoms_up_with_threshold() {
            // If everyone meets the threshold, they all win.
            let threshold = current_round_tally.winning_threshold();
            if current_round_tally.num_candidates_meeting(threshold)
                == current_round_tally.num_active_candidates()
            {
                selected_winners = current_round_tally.candidates();
            }
            for winner in &selected_winners {
                info!(
                    "Candidate \"{}\" was elected in round {} with {} votes.",
                    winner,
                    self.current_round,
                    current_round_tally
                        .candidate_tally(winner)
                        .unwrap_or(Decimal::ZERO)
                );
            }
            return Ok(selected_winners);
        }

        let num_seats_unfilled =
            self.config.num_winners as i64 - self.winner_to_round.len() as i64;
        if num_seats_unfilled > 0 {
            if current_round_tally.num_active_candidates() as i64 == num_seats_unfilled {
                // As many continuing candidates as open seats: everyone wins.
                selected_winners = current_round_tally.candidates();
            } else if self.config.first_round_determines_threshold
                && current_round_tally.num_active_candidates() as i64 - 1
                    == self.config.num_winners as i64
            {
                // Penultimate-round fallback: nobody may reach a threshold
                // frozen in round one, so the max vote-getters win here.
                if let Some((_, max_candidates)) = tally_to_candidates.iter().next_back() {
                    selected_winners = max_candidates.clone();
                }
            } else if !self.config.is_multi_seat_bottoms_up_until_n_winners() {
                // Everyone at or above the threshold wins. The undeclared
                // write-in placeholder can't win.
                let threshold = current_round_tally.winning_threshold();
                for (votes, candidates) in tally_to_candidates {
                    if *votes >= threshold {
                        for candidate in candidates {
                            if candidate != UNDECLARED_WRITE_IN_LABEL {
                                selected_winners.push(candidate.clone());
                            }
                        }
                    }
                }
            }
        }

        // Multiple winners selected but only one may be elected per round:
        // keep the top vote-getters and tie-break among them.
        let needs_tiebreak_multiple_winners = selected_winners.len() > 1
            && (self.config.is_multi_seat_allow_only_one_winner_per_round()
                || self.config.first_round_determines_threshold);
        // Two candidates remain in a single-winner contest, neither at the
        // threshold but both above the minimum: break the tie now rather
        // than run a final round with a single candidate.
        let needs_tiebreak_no_winners = self.config.num_winners == 1
            && selected_winners.is_empty()
            && current_round_tally.num_active_candidates() == 2
            && num_seats_unfilled == 1
            && tally_to_candidates
                .keys()
                .all(|votes| *votes >= self.config.minimum_vote_threshold);

        if needs_tiebreak_multiple_winners || needs_tiebreak_no_winners {
            if let Some((max_votes, max_candidates)) = tally_to_candidates.iter().next_back() {
                let max_votes = *max_votes;
                selected_winners = max_candidates.clone();
                if selected_winners.len() > 1 {
                    let outcome = self.run_tiebreak(true, &selected_winners)?;
                    info!(
                        "Candidate \"{}\" won a tie-breaker in round {} against {}. Each candidate \
                         had {} vote(s). {}",
                        outcome.selection,
                        self.current_round,
                        outcome.non_selected,
                        max_votes,
                        outcome.explanation
                    );
                    selected_winners = vec![outcome.selection];
                }
            }
        }

        for winner in &selected_winners {
            info!(
                "Candidate \"{}\" was elected in round {} with {} votes.",
                winner,
                self.current_round,
                current_round_tally
                    .candidate_tally(winner)
                    .unwrap_or(Decimal::ZERO)
            );
        }

        Ok(selected_winners)
    }

    /// Splits every ballot sitting with a new winner into the portion the
    /// winner keeps and the portion that flows onward next round.
    fn distribute_surplus(&mut self, winners: &[String], current_round_tally: &RoundTally) {
        for winner in winners {
            let candidate_votes = current_round_tally
                .candidate_tally(winner)
                .unwrap_or(Decimal::ZERO);
            let extra_votes = candidate_votes - current_round_tally.winning_threshold();
            let surplus_fraction = if extra_votes > Decimal::ZERO {
                self.config.divide(extra_votes, candidate_votes)
            } else {
                Decimal::ZERO
            };
            info!(
                "Candidate \"{}\" was elected with a surplus fraction of {}.",
                winner, surplus_fraction
            );
            let arithmetic = self.arithmetic;
            for cvr in &mut self.cast_vote_records {
                if cvr.current_recipient() == Some(winner.as_str()) {
                    cvr.record_current_recipient_as_winner(surplus_fraction, &arithmetic);
                }
            }
        }
    }

    fn drop_undeclared_write_ins(&self, current_round_tally: &RoundTally) -> Vec<String> {
        let mut eliminated = Vec::new();
        if let Some(votes) = current_round_tally.candidate_tally(UNDECLARED_WRITE_IN_LABEL) {
            if votes > Decimal::ZERO {
                eliminated.push(UNDECLARED_WRITE_IN_LABEL.to_string());
                info!(
                    "Eliminated candidate \"{}\" in round {} because it represents undeclared \
                     write-ins. It had {} votes.",
                    UNDECLARED_WRITE_IN_LABEL, self.current_round, votes
                );
            }
        }
        eliminated
    }

    fn drop_candidates_below_threshold(
        &self,
        tally_to_candidates: &BTreeMap<Decimal, Vec<String>>,
    ) -> Vec<String> {
        let mut eliminated = Vec::new();
        let threshold = self.config.minimum_vote_threshold;
        let lowest_tally = tally_to_candidates.keys().next();
        if threshold > Decimal::ZERO && matches!(lowest_tally, Some(votes) if *votes < threshold) {
            for (votes, candidates) in tally_to_candidates {
                if *votes >= threshold {
                    break;
                }
                for candidate in candidates {
                    eliminated.push(candidate.clone());
                    info!(
                        "Eliminated candidate \"{}\" in round {} because they only had {} vote(s), \
                         below the minimum threshold of {}.",
                        candidate, self.current_round, votes, threshold
                    );
                }
            }
        }
        eliminated
    }

    fn do_batch_elimination(
        &self,
        tally_to_candidates: &BTreeMap<Decimal, Vec<String>>,
    ) -> Vec<String> {
        let mut eliminated = Vec::new();
        if self.config.batch_elimination {
            let batch = self.run_batch_elimination(tally_to_candidates);
            // A batch of one is no faster than regular elimination.
            if batch.len() > 1 {
                for elimination in batch {
                    info!(
                        "Batch-eliminated candidate \"{}\" in round {}. The running total was {} \
                         vote(s) and the next-lowest count was {} vote(s).",
                        elimination.candidate,
                        self.current_round,
                        elimination.running_total,
                        elimination.next_lowest_tally
                    );
                    eliminated.push(elimination.candidate);
                }
            }
        }
        eliminated
    }

    // Sums tallies low to high, and whenever the sum so far cannot reach
    // the next-lowest tally, everyone seen so far is mathematically unable
    // to win ("leapfrogging" is impossible) and can be eliminated at once.
    // Under continue-until-two, a batch that would leave only one candidate
    // is rolled back to the previous batch.
    fn run_batch_elimination(
        &self,
        tally_to_candidates: &BTreeMap<Decimal, Vec<String>>,
    ) -> Vec<BatchElimination> {
        let mut running_total = Decimal::ZERO;
        let mut candidates_seen: Vec<String> = Vec::new();
        let mut candidates_eliminated: BTreeSet<String> = BTreeSet::new();
        let mut eliminations: Vec<BatchElimination> = Vec::new();
        let mut previous_eliminations: Vec<BatchElimination> = Vec::new();

        for (current_vote_tally, current_candidates) in tally_to_candidates {
            let mut new_eliminations = eliminations.clone();
            if running_total < *current_vote_tally {
                for candidate in &candidates_seen {
                    if candidates_eliminated.insert(candidate.clone()) {
                        new_eliminations.push(BatchElimination {
                            candidate: candidate.clone(),
                            running_total,
                            next_lowest_tally: *current_vote_tally,
                        });
                    }
                }
            }
            let group_total = self.arithmetic.multiply(
                *current_vote_tally,
                Decimal::from(current_candidates.len() as u64),
            );
            running_total += group_total;
            candidates_seen.extend(current_candidates.iter().cloned());
            if new_eliminations.len() > eliminations.len() {
                previous_eliminations = mem::replace(&mut eliminations, new_eliminations);
            }
        }
        if self.config.continue_until_two_candidates_remain
            && eliminations.len() + self.candidate_to_round_eliminated.len()
                == self.config.num_candidates() - 1
        {
            // The batch would leave only one candidate standing; fall back
            // to the batch before this one.
            eliminations = previous_eliminations;
        }
        eliminations
    }

    fn do_regular_elimination(
        &mut self,
        tally_to_candidates: &BTreeMap<Decimal, Vec<String>>,
    ) -> Result<Vec<String>, TabulationError> {
        let (min_votes, last_place_candidates) = tally_to_candidates
            .iter()
            .next()
            .expect("a round always has at least one continuing candidate");
        let min_votes = *min_votes;
        let eliminated_candidate = if last_place_candidates.len() > 1 {
            let outcome = self.run_tiebreak(false, last_place_candidates)?;
            info!(
                "Candidate \"{}\" lost a tie-breaker in round {} against {}. Each candidate had \
                 {} vote(s). {}",
                outcome.selection,
                self.current_round,
                outcome.non_selected,
                min_votes,
                outcome.explanation
            );
            outcome.selection
        } else {
            let candidate = last_place_candidates[0].clone();
            info!(
                "Candidate \"{}\" was eliminated in round {} with {} vote(s).",
                candidate, self.current_round, min_votes
            );
            candidate
        };
        Ok(vec![eliminated_candidate])
    }

    fn run_tiebreak(
        &mut self,
        selecting_winner: bool,
        tied_candidates: &[String],
    ) -> Result<TiebreakOutcome, TabulationError> {
        let mut tiebreak = Tiebreak::new(
            selecting_winner,
            tied_candidates,
            self.config.tiebreak_mode,
            self.current_round,
            &self.round_tallies,
            &self.candidate_permutation,
        );
        let selection =
            tiebreak.select_candidate(self.rng.as_mut(), self.prompt.as_deref_mut())?;
        Ok(TiebreakOutcome {
            selection,
            explanation: tiebreak.explanation().to_string(),
            non_selected: tiebreak.non_selected_candidate_description(),
        })
    }

    /// Walks every ballot once to determine who it counts for this round.
    /// A ballot either stays with its current recipient, routes to a new
    /// continuing candidate, becomes exhausted, or remains exhausted.
    fn compute_tallies_for_round(
        &mut self,
        round: u32,
        continuing: &BTreeSet<String>,
    ) -> Result<RoundTally, TabulationError> {
        let mut round_tally = RoundTally::new(round, continuing.iter().cloned());
        let mut tally_by_precinct: BTreeMap<String, RoundTally> = BTreeMap::new();
        if self.config.tabulate_by_precinct {
            for precinct in &self.precinct_ids {
                tally_by_precinct
                    .insert(precinct.clone(), RoundTally::new(round, continuing.iter().cloned()));
            }
        }

        let tabulate_by_precinct = self.config.tabulate_by_precinct;
        let overvote_rule = self.config.overvote_rule;
        let max_skipped_ranks_allowed = self.config.max_skipped_ranks_allowed;
        let max_rankings_allowed = self.config.max_rankings_allowed;
        let exhaust_on_duplicate = self.config.exhaust_on_duplicate_candidate;

        let mut cast_vote_records = mem::take(&mut self.cast_vote_records);
        for cvr in &mut cast_vote_records {
            if cvr.is_exhausted() {
                round_tally.add_inactive_ballot(cvr.ballot_status(), cvr.fractional_transfer_value());
                continue;
            }

            // Current recipient still continuing: the vote rolls over.
            if let Some(recipient) = cvr.current_recipient() {
                if continuing.contains(recipient) {
                    let recipient = recipient.to_string();
                    Self::increment_tallies(
                        &mut round_tally,
                        &mut tally_by_precinct,
                        cvr.fractional_transfer_value(),
                        &recipient,
                        cvr.precinct.as_deref(),
                        tabulate_by_precinct,
                    );
                    continue;
                }
            }

            if cvr.rankings.num_rankings() == 0 {
                self.record_selection(cvr, &mut round_tally, None, BallotStatus::InactiveByUndervote, "")?;
                continue;
            }

            // Walk the rankings from most to least preferred: exhaust on
            // overvote/skip/duplicate violations, count for the first
            // continuing candidate, exhaust when the rankings run out.
            let mut last_rank_seen = 0u32;
            let mut candidates_seen: BTreeSet<String> = BTreeSet::new();
            let mut selected_candidate: Option<String> = None;
            let rankings = cvr.rankings.clone();
            let max_ranking_number = rankings.max_ranking_number();

            for (rank, candidates) in rankings.iter() {
                if let Some(max_skipped) = max_skipped_ranks_allowed {
                    if rank - last_rank_seen > max_skipped + 1 {
                        self.record_selection(
                            cvr,
                            &mut round_tally,
                            None,
                            BallotStatus::InactiveBySkippedRanking,
                            "",
                        )?;
                        break;
                    }
                }
                last_rank_seen = *rank;

                if exhaust_on_duplicate {
                    let mut duplicate_candidate: Option<String> = None;
                    for candidate in candidates.iter() {
                        if !candidates_seen.insert(candidate.clone()) {
                            duplicate_candidate = Some(candidate.clone());
                            break;
                        }
                    }
                    if let Some(duplicate) = duplicate_candidate {
                        let log_text = format!(" {}", duplicate);
                        self.record_selection(
                            cvr,
                            &mut round_tally,
                            None,
                            BallotStatus::InactiveByRepeatedRanking,
                            &log_text,
                        )?;
                        break;
                    }
                }

                let overvote_decision = decide_overvote(candidates, overvote_rule, |mark| {
                    match self.config.name_for_candidate(mark) {
                        Some(name) => continuing.contains(name),
                        None => false,
                    }
                })?;
                match overvote_decision {
                    OvervoteDecision::Exhaust => {
                        self.record_selection(
                            cvr,
                            &mut round_tally,
                            None,
                            BallotStatus::InactiveByOvervote,
                            "",
                        )?;
                        break;
                    }
                    OvervoteDecision::SkipToNextRank => {
                        if *rank == max_ranking_number {
                            // A final-rank overvote under the skip rule
                            // counts as exhausted choices, not an overvote.
                            self.record_selection(
                                cvr,
                                &mut round_tally,
                                None,
                                BallotStatus::InactiveByExhaustedChoices,
                                "",
                            )?;
                        }
                        continue;
                    }
                    OvervoteDecision::None => {}
                }

                // At most one mark at this rank can be continuing; two or
                // more would have tripped the exhaust-if-multiple rule.
                for mark in candidates.iter() {
                    let Some(name) = self.config.name_for_candidate(mark).map(|n| n.to_string())
                    else {
                        continue;
                    };
                    if !continuing.contains(&name) {
                        continue;
                    }
                    selected_candidate = Some(name.clone());
                    self.record_selection(
                        cvr,
                        &mut round_tally,
                        Some(&name),
                        BallotStatus::Active,
                        "",
                    )?;
                    Self::increment_tallies(
                        &mut round_tally,
                        &mut tally_by_precinct,
                        cvr.fractional_transfer_value(),
                        &name,
                        cvr.precinct.as_deref(),
                        tabulate_by_precinct,
                    );
                    break;
                }

                if selected_candidate.is_some() {
                    break;
                }

                if *rank == max_ranking_number {
                    // Out of rankings. Trailing blank ranks beyond the skip
                    // allowance make this an undervote; otherwise the
                    // choices are simply exhausted.
                    let trailing_undervote = matches!(
                        max_skipped_ranks_allowed,
                        Some(max_skipped) if max_rankings_allowed.saturating_sub(*rank) > max_skipped
                    );
                    let status = if trailing_undervote {
                        BallotStatus::InactiveByUndervote
                    } else {
                        BallotStatus::InactiveByExhaustedChoices
                    };
                    self.record_selection(cvr, &mut round_tally, None, status, "")?;
                }
            }
        }
        self.cast_vote_records = cast_vote_records;

        if self.config.tabulate_by_precinct {
            for (precinct, mut tally) in tally_by_precinct {
                tally.lock_in_round();
                self.precinct_round_tallies
                    .get_mut(&precinct)
                    .expect("precinct tallies initialized at construction")
                    .insert(round, tally);
            }
        }
        round_tally.lock_in_round();

        Ok(round_tally)
    }

    // Sets the ballot's new recipient (or exhausts it), appends to the
    // transfer ledgers, and writes the per-ballot audit log entry.
    fn record_selection(
        &mut self,
        cvr: &mut CastVoteRecord,
        round_tally: &mut RoundTally,
        selected_candidate: Option<&str>,
        status: BallotStatus,
        additional_log_text: &str,
    ) -> Result<(), TabulationError> {
        // No transfer entry when there is no value to move, which happens
        // when someone wins with exactly the threshold.
        if cvr.fractional_transfer_value() > Decimal::ZERO {
            self.tally_transfers.add_transfer(
                round_tally.round_number(),
                cvr.current_recipient(),
                selected_candidate,
                cvr.fractional_transfer_value(),
            );
            if self.config.tabulate_by_precinct {
                let precinct = cvr.precinct.as_deref().unwrap_or_default();
                let precinct_transfers = self
                    .precinct_tally_transfers
                    .get_mut(precinct)
                    .ok_or_else(|| TabulationError::UnknownPrecinct {
                        precinct: precinct.to_string(),
                    })?;
                precinct_transfers.add_transfer(
                    round_tally.round_number(),
                    cvr.current_recipient(),
                    selected_candidate,
                    cvr.fractional_transfer_value(),
                );
            }
        }

        cvr.set_current_recipient(selected_candidate.map(|c| c.to_string()));
        if selected_candidate.is_none() {
            cvr.exhaust_by(status);
        }

        if !status.is_active() {
            round_tally.add_inactive_ballot(status, cvr.fractional_transfer_value());
        }

        let outcome_description = match selected_candidate {
            Some(candidate) => candidate.to_string(),
            None => format!("{}{}", status.description(), additional_log_text),
        };
        let outcome_type = if selected_candidate.is_none() {
            VoteOutcomeType::Exhausted
        } else {
            VoteOutcomeType::Counted
        };
        let value = cvr.fractional_transfer_value();
        cvr.log_round_outcome(round_tally.round_number(), outcome_type, &outcome_description, value);

        if self.config.generate_cdf_json {
            cvr.log_cdf_snapshot(round_tally.round_number());
        }

        Ok(())
    }

    fn increment_tallies(
        round_tally: &mut RoundTally,
        tally_by_precinct: &mut BTreeMap<String, RoundTally>,
        fractional_transfer_value: Decimal,
        selected_candidate: &str,
        precinct: Option<&str>,
        tabulate_by_precinct: bool,
    ) {
        round_tally.add_to_candidate_tally(selected_candidate, fractional_transfer_value);
        if tabulate_by_precinct {
            if let Some(precinct) = precinct {
                if let Some(precinct_tally) = tally_by_precinct.get_mut(precinct) {
                    precinct_tally
                        .add_to_candidate_tally(selected_candidate, fractional_transfer_value);
                }
            }
        }
    }

    /// Brings past-round winners' totals forward into the just-completed
    /// round, since the regular walk only accumulates votes for continuing
    /// candidates. Winners from the immediately prior round are recomputed
    /// from the per-ballot winner credits (their surplus just moved);
    /// earlier winners are copied unchanged. The rounding residue above the
    /// threshold is booked as residual surplus.
    fn update_winner_tallies(
        &mut self,
        round_tally: &mut RoundTally,
    ) -> Result<(), TabulationError> {
        let current_round = self.current_round;

        let mut winners_to_process: Vec<String> = Vec::new();
        let mut winners_requiring_computation: BTreeSet<String> = BTreeSet::new();
        for (winner, &won_round) in &self.winner_to_round {
            // Only previous-round winners matter here.
            if won_round == current_round {
                continue;
            }
            winners_to_process.push(winner.clone());
            if won_round == current_round - 1 {
                winners_requiring_computation.insert(winner.clone());
            }
        }

        // Snapshot the previous round's numbers before mutating anything.
        let mut previous_tallies: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut previous_precinct_tallies: BTreeMap<(String, String), Decimal> = BTreeMap::new();
        if current_round > 1 {
            let previous_round_tally = &self.round_tallies[&(current_round - 1)];
            for winner in &winners_to_process {
                previous_tallies.insert(
                    winner.clone(),
                    previous_round_tally
                        .candidate_tally(winner)
                        .unwrap_or(Decimal::ZERO),
                );
            }
            if self.config.tabulate_by_precinct {
                for (precinct, rounds) in &self.precinct_round_tallies {
                    if let Some(tally) = rounds.get(&(current_round - 1)) {
                        for winner in &winners_to_process {
                            previous_precinct_tallies.insert(
                                (precinct.clone(), winner.clone()),
                                tally.candidate_tally(winner).unwrap_or(Decimal::ZERO),
                            );
                        }
                    }
                }
            }
        }

        round_tally.unlock_for_surplus_calculation();
        for winner in &winners_to_process {
            let initial = if winners_requiring_computation.contains(winner) {
                Decimal::ZERO
            } else {
                previous_tallies[winner]
            };
            round_tally.set_candidate_tally_via_surplus_adjustment(winner, initial);
        }

        if self.config.tabulate_by_precinct {
            for (precinct, rounds) in self.precinct_round_tallies.iter_mut() {
                let precinct_tally = rounds
                    .get_mut(&current_round)
                    .expect("precinct tally computed for every round");
                precinct_tally.unlock_for_surplus_calculation();
                for winner in &winners_to_process {
                    let initial = if winners_requiring_computation.contains(winner) {
                        Decimal::ZERO
                    } else {
                        previous_precinct_tallies[&(precinct.clone(), winner.clone())]
                    };
                    precinct_tally.set_candidate_tally_via_surplus_adjustment(winner, initial);
                }
            }
        }

        if !winners_requiring_computation.is_empty() {
            // Gather the permanent per-ballot credits of last round's
            // winners.
            for cvr in &self.cast_vote_records {
                for (winner, fractional_value) in cvr.winner_to_fractional_value() {
                    if !winners_requiring_computation.contains(winner) {
                        continue;
                    }
                    round_tally
                        .add_to_candidate_tally_via_surplus_adjustment(winner, *fractional_value);
                    if self.config.tabulate_by_precinct {
                        if let Some(precinct) = &cvr.precinct {
                            if let Some(rounds) = self.precinct_round_tallies.get_mut(precinct) {
                                rounds
                                    .get_mut(&current_round)
                                    .expect("precinct tally computed for every round")
                                    .add_to_candidate_tally_via_surplus_adjustment(
                                        winner,
                                        *fractional_value,
                                    );
                            }
                        }
                    }
                }
            }

            // Per-ballot rounding leaves each winner slightly above the
            // threshold; book the difference as residual surplus and pin
            // the winner at exactly the threshold.
            let winning_threshold = round_tally.winning_threshold();
            for winner in &winners_requiring_computation {
                let winner_tally = round_tally
                    .candidate_tally(winner)
                    .unwrap_or(Decimal::ZERO);
                let winner_residual = winner_tally - winning_threshold;
                if winner_residual > Decimal::ZERO {
                    info!("{} had residual surplus of {}.", winner, winner_residual);
                    *self
                        .round_to_residual_surplus
                        .get_mut(&current_round)
                        .expect("carried forward at the top of the round") += winner_residual;
                    round_tally
                        .set_candidate_tally_via_surplus_adjustment(winner, winning_threshold);
                    self.tally_transfers.add_transfer(
                        current_round,
                        Some(winner),
                        Some(TallyTransfers::RESIDUAL_TARGET),
                        winner_residual,
                    );
                }
            }
        }

        if self.config.tabulate_by_precinct {
            for rounds in self.precinct_round_tallies.values_mut() {
                rounds
                    .get_mut(&current_round)
                    .expect("precinct tally computed for every round")
                    .relock_after_surplus_calculation();
            }
        }
        round_tally.relock_after_surplus_calculation();
        Ok(())
    }
}

/// Sequential winner-takes-all ("multi-pass IRV"): runs one single-winner
/// tabulation per seat over pristine copies of the ballots, excluding the
/// winners of earlier passes, and returns the per-pass results in order.
pub fn tabulate_sequential(
    cast_vote_records: &[CastVoteRecord],
    config: &ContestConfig,
) -> Result<Vec<ContestResult>, TabulationError> {
    let mut results: Vec<ContestResult> = Vec::new();
    let mut sequential_winners: Vec<String> = Vec::new();
    for pass in 1..=config.num_winners {
        let mut pass_config = config.clone();
        pass_config.num_winners = 1;
        for candidate in pass_config.candidates.iter_mut() {
            if sequential_winners.contains(&candidate.name) {
                candidate.excluded = true;
            }
        }
        info!("Beginning tabulation pass {} of {}.", pass, config.num_winners);
        let mut tabulator = Tabulator::new(cast_vote_records.to_vec(), pass_config)?;
        let winners = tabulator.tabulate()?;
        sequential_winners.extend(winners);
        results.push(tabulator.into_result());
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::{CandidateRankings, CandidatesAtRanking};
    use crate::config::Candidate;
    use rust_decimal_macros::dec;

    fn ballot(id: &str, prefs: &[&[&str]]) -> CastVoteRecord {
        let pairs = prefs
            .iter()
            .enumerate()
            .map(|(idx, names)| {
                (
                    idx as u32 + 1,
                    CandidatesAtRanking::new(names.iter().map(|s| s.to_string()).collect()),
                )
            })
            .collect();
        CastVoteRecord::new(id, CandidateRankings::new(pairs))
    }

    fn config_for(names: &[&str]) -> ContestConfig {
        ContestConfig::new(names.iter().map(|n| Candidate::new(n)).collect())
    }

    #[test]
    fn batch_elimination_follows_the_running_total() {
        // Tallies A=10, B=4, C=3, D=2, E=1. Only E can be batch-eliminated
        // (cumulative 1 < next-lowest 2); a batch of one is discarded and
        // regular elimination takes over.
        let config = config_for(&["A", "B", "C", "D", "E"]);
        let mut config = config;
        config.batch_elimination = true;
        let tabulator = Tabulator::new(vec![], config).unwrap();

        let mut tally_to_candidates: BTreeMap<Decimal, Vec<String>> = BTreeMap::new();
        for (name, votes) in [("A", 10), ("B", 4), ("C", 3), ("D", 2), ("E", 1)] {
            tally_to_candidates
                .entry(Decimal::from(votes))
                .or_default()
                .push(name.to_string());
        }
        let batch = tabulator.run_batch_elimination(&tally_to_candidates);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].candidate, "E");
        assert_eq!(batch[0].running_total, dec!(1));
        assert_eq!(batch[0].next_lowest_tally, dec!(2));
        // run_batch_elimination found one candidate, but a batch needs at
        // least two to beat regular elimination
        assert!(tabulator.do_batch_elimination(&tally_to_candidates).is_empty());
    }

    #[test]
    fn batch_elimination_removes_a_hopeless_tail() {
        // A=15, B=10, C=3, D=2, E=1: C, D and E together hold 6 < 10, so
        // all three go at once. B survives because the cumulative total
        // through B (16) reaches past A's 15.
        let mut config = config_for(&["A", "B", "C", "D", "E"]);
        config.batch_elimination = true;
        let tabulator = Tabulator::new(vec![], config).unwrap();

        let mut tally_to_candidates: BTreeMap<Decimal, Vec<String>> = BTreeMap::new();
        for (name, votes) in [("A", 15), ("B", 10), ("C", 3), ("D", 2), ("E", 1)] {
            tally_to_candidates
                .entry(Decimal::from(votes))
                .or_default()
                .push(name.to_string());
        }
        let eliminated = tabulator.do_batch_elimination(&tally_to_candidates);
        assert_eq!(eliminated, vec!["E", "D", "C"]);
    }

    #[test]
    fn batch_elimination_rewinds_under_continue_until_two() {
        // Without the rewind the batch would leave A alone.
        let mut config = config_for(&["A", "B", "C", "D"]);
        config.batch_elimination = true;
        config.continue_until_two_candidates_remain = true;
        let tabulator = Tabulator::new(vec![], config).unwrap();

        let mut tally_to_candidates: BTreeMap<Decimal, Vec<String>> = BTreeMap::new();
        for (name, votes) in [("A", 50), ("B", 5), ("C", 2), ("D", 1)] {
            tally_to_candidates
                .entry(Decimal::from(votes))
                .or_default()
                .push(name.to_string());
        }
        let batch = tabulator.run_batch_elimination(&tally_to_candidates);
        let names: Vec<&str> = batch.iter().map(|b| b.candidate.as_str()).collect();
        // D and C are hopeless (1 < 2, 3 < 5), and B would be too (8 < 50),
        // but eliminating B as well would leave only A.
        assert_eq!(names, vec!["D", "C"]);
    }

    #[test]
    fn no_precincts_aborts_when_precinct_tabulation_requested() {
        let mut config = config_for(&["A", "B"]);
        config.tabulate_by_precinct = true;
        let cvrs = vec![ballot("b-1", &[&["A"]])];
        let err = Tabulator::new(cvrs, config).unwrap_err();
        assert!(matches!(err, TabulationError::NoPrecinctsInData));
    }

    #[test]
    fn random_mode_without_seed_is_rejected() {
        let mut config = config_for(&["A", "B"]);
        config.tiebreak_mode = TiebreakMode::Random;
        let err = Tabulator::new(vec![], config).unwrap_err();
        assert!(matches!(err, TabulationError::InvalidConfig { .. }));
    }

    #[test]
    fn cancellation_flag_stops_the_round_loop() {
        let config = config_for(&["A", "B"]);
        let cvrs = vec![ballot("b-1", &[&["A"]]), ballot("b-2", &[&["B"]])];
        let flag = Arc::new(AtomicBool::new(true));
        let mut tabulator = Tabulator::new(cvrs, config)
            .unwrap()
            .with_cancellation_flag(flag);
        let err = tabulator.tabulate().unwrap_err();
        assert!(err.cancelled_by_user());
    }

    #[test]
    fn winner_and_elimination_ledgers_stay_disjoint() {
        let config = config_for(&["A", "B", "C"]);
        let cvrs = vec![
            ballot("b-1", &[&["A"]]),
            ballot("b-2", &[&["A"]]),
            ballot("b-3", &[&["A"]]),
            ballot("b-4", &[&["B"], &["A"]]),
            ballot("b-5", &[&["C"], &["B"]]),
        ];
        let mut tabulator = Tabulator::new(cvrs, config).unwrap();
        let winners = tabulator.tabulate().unwrap();
        // A holds a clear majority in round one
        assert_eq!(tabulator.current_round(), 1);
        assert_eq!(winners.len(), 1);
        assert!(winners.contains("A"));
        // no candidate appears in both ledgers
        let mut seen: BTreeSet<&String> = tabulator.winner_to_round().keys().collect();
        for candidate in tabulator.candidate_to_round_eliminated().keys() {
            assert!(seen.insert(candidate));
        }
    }
}
