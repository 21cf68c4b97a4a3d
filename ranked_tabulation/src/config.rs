use std::collections::BTreeSet;

use rust_decimal::Decimal;

use crate::arithmetic::VoteArithmetic;

/// Sentinel candidate identifier for an explicit overvote mark at a rank.
/// It can never win and is never a continuing candidate.
pub const EXPLICIT_OVERVOTE_LABEL: &str = "overvote";

/// Bucket identifier for undeclared write-in votes. It may receive votes
/// but is dropped before any other elimination and cannot be elected.
pub const UNDECLARED_WRITE_IN_LABEL: &str = "Undeclared Write-ins";

// ********* Configuration **********

// The configuration options follow the configuration options defined here:
// https://github.com/BrightSpots/rcv/blob/develop/config_file_documentation.txt

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum OvervoteRule {
    AlwaysSkipToNextRank,
    ExhaustImmediately,
    ExhaustIfMultipleContinuing,
}

impl OvervoteRule {
    pub fn from_internal_label(label: &str) -> Option<OvervoteRule> {
        match label {
            "alwaysSkipToNextRank" => Some(OvervoteRule::AlwaysSkipToNextRank),
            "exhaustImmediately" => Some(OvervoteRule::ExhaustImmediately),
            "exhaustIfMultipleContinuing" => Some(OvervoteRule::ExhaustIfMultipleContinuing),
            _ => None,
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum TiebreakMode {
    Random,
    Interactive,
    PreviousRoundCountsThenRandom,
    PreviousRoundCountsThenInteractive,
    UsePermutationInConfig,
    GeneratePermutation,
}

impl TiebreakMode {
    pub fn from_internal_label(label: &str) -> Option<TiebreakMode> {
        match label {
            "random" => Some(TiebreakMode::Random),
            "stopCountingAndAsk" => Some(TiebreakMode::Interactive),
            "previousRoundCountsThenRandom" => Some(TiebreakMode::PreviousRoundCountsThenRandom),
            "previousRoundCountsThenAsk" => {
                Some(TiebreakMode::PreviousRoundCountsThenInteractive)
            }
            "useCandidateOrder" => Some(TiebreakMode::UsePermutationInConfig),
            "generatePermutation" => Some(TiebreakMode::GeneratePermutation),
            _ => None,
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum WinnerElectionMode {
    StandardSingleWinner,
    MultiSeatAllowOnlyOneWinnerPerRound,
    MultiSeatAllowMultipleWinnersPerRound,
    MultiSeatBottomsUpUntilNWinners,
    MultiSeatBottomsUpUsingPercentageThreshold,
    MultiSeatSequentialWinnerTakesAll,
}

impl WinnerElectionMode {
    pub fn from_internal_label(label: &str) -> Option<WinnerElectionMode> {
        match label {
            "singleWinnerMajority" => Some(WinnerElectionMode::StandardSingleWinner),
            "multiWinnerAllowOnlyOneWinnerPerRound" => {
                Some(WinnerElectionMode::MultiSeatAllowOnlyOneWinnerPerRound)
            }
            "multiWinnerAllowMultipleWinnersPerRound" => {
                Some(WinnerElectionMode::MultiSeatAllowMultipleWinnersPerRound)
            }
            "bottomsUp" => Some(WinnerElectionMode::MultiSeatBottomsUpUntilNWinners),
            "bottomsUpUsingPercentageThreshold" => {
                Some(WinnerElectionMode::MultiSeatBottomsUpUsingPercentageThreshold)
            }
            "multiPassIrv" => Some(WinnerElectionMode::MultiSeatSequentialWinnerTakesAll),
            _ => None,
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub code: Option<String>,
    pub excluded: bool,
}

impl Candidate {
    pub fn new(name: &str) -> Candidate {
        Candidate {
            name: name.to_string(),
            code: None,
            excluded: false,
        }
    }
}

/// Validated contest configuration handed to the tabulator.
///
/// Construction happens in the reader layer; the engine treats the whole
/// structure as immutable (the sequential mode clones and adjusts it for
/// each pass).
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ContestConfig {
    pub candidates: Vec<Candidate>,
    pub num_winners: u32,
    pub overvote_rule: OvervoteRule,
    pub tiebreak_mode: TiebreakMode,
    pub winner_election_mode: WinnerElectionMode,
    /// `None` means unlimited.
    pub max_skipped_ranks_allowed: Option<u32>,
    pub max_rankings_allowed: u32,
    pub exhaust_on_duplicate_candidate: bool,
    pub batch_elimination: bool,
    pub continue_until_two_candidates_remain: bool,
    pub first_round_determines_threshold: bool,
    pub hare_quota: bool,
    /// Fraction in [0, 1]; only read in the bottoms-up percentage mode.
    pub multi_seat_bottoms_up_percentage_threshold: Option<Decimal>,
    pub tabulate_by_precinct: bool,
    pub generate_cdf_json: bool,
    pub minimum_vote_threshold: Decimal,
    pub decimal_places: u32,
    pub non_integer_winning_threshold: bool,
    pub random_seed: Option<u64>,
    /// Candidate order used by the permutation tiebreak modes. For
    /// `GeneratePermutation` the tabulator sorts and shuffles this once at
    /// the start of tabulation.
    pub candidate_permutation: Vec<String>,
    pub stop_tabulation_early_after_round: Option<u32>,
}

impl ContestConfig {
    pub fn new(candidates: Vec<Candidate>) -> ContestConfig {
        let permutation: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
        ContestConfig {
            candidates,
            num_winners: 1,
            overvote_rule: OvervoteRule::AlwaysSkipToNextRank,
            tiebreak_mode: TiebreakMode::UsePermutationInConfig,
            winner_election_mode: WinnerElectionMode::StandardSingleWinner,
            max_skipped_ranks_allowed: Some(1),
            max_rankings_allowed: permutation.len().max(1) as u32,
            exhaust_on_duplicate_candidate: false,
            batch_elimination: false,
            continue_until_two_candidates_remain: false,
            first_round_determines_threshold: false,
            hare_quota: false,
            multi_seat_bottoms_up_percentage_threshold: None,
            tabulate_by_precinct: false,
            generate_cdf_json: false,
            minimum_vote_threshold: Decimal::ZERO,
            decimal_places: 4,
            non_integer_winning_threshold: false,
            random_seed: None,
            candidate_permutation: permutation,
            stop_tabulation_early_after_round: None,
        }
    }

    pub fn arithmetic(&self) -> VoteArithmetic {
        VoteArithmetic::new(self.decimal_places, self.non_integer_winning_threshold)
    }

    pub fn divide(&self, dividend: Decimal, divisor: Decimal) -> Decimal {
        self.arithmetic().divide(dividend, divisor)
    }

    pub fn multiply(&self, multiplier: Decimal, multiplicand: Decimal) -> Decimal {
        self.arithmetic().multiply(multiplier, multiplicand)
    }

    /// All candidate identifiers for the contest, sorted. Includes the
    /// undeclared-write-in bucket when it is registered as a candidate.
    pub fn candidate_names(&self) -> BTreeSet<String> {
        self.candidates.iter().map(|c| c.name.clone()).collect()
    }

    pub fn num_candidates(&self) -> usize {
        self.candidates.len()
    }

    /// Candidates on the ballot proper, i.e. everything except the
    /// undeclared-write-in bucket.
    pub fn num_declared_candidates(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| c.name != UNDECLARED_WRITE_IN_LABEL)
            .count()
    }

    pub fn candidate_is_excluded(&self, name: &str) -> bool {
        self.candidates
            .iter()
            .any(|c| c.name == name && c.excluded)
    }

    /// Resolves a raw ballot mark (name or short code) to the canonical
    /// candidate name. Returns `None` for marks that are not on the roster.
    pub fn name_for_candidate(&self, id: &str) -> Option<&str> {
        for c in &self.candidates {
            if c.name == id {
                return Some(c.name.as_str());
            }
            if let Some(code) = &c.code {
                if code == id {
                    return Some(c.name.as_str());
                }
            }
        }
        None
    }

    pub fn needs_random_seed(&self) -> bool {
        matches!(
            self.tiebreak_mode,
            TiebreakMode::Random
                | TiebreakMode::PreviousRoundCountsThenRandom
                | TiebreakMode::GeneratePermutation
        )
    }

    pub fn is_multi_seat_bottoms_up_until_n_winners(&self) -> bool {
        self.winner_election_mode == WinnerElectionMode::MultiSeatBottomsUpUntilNWinners
    }

    pub fn is_multi_seat_bottoms_up_with_threshold(&self) -> bool {
        self.winner_election_mode == WinnerElectionMode::MultiSeatBottomsUpUsingPercentageThreshold
    }

    pub fn is_multi_seat_allow_only_one_winner_per_round(&self) -> bool {
        self.winner_election_mode == WinnerElectionMode::MultiSeatAllowOnlyOneWinnerPerRound
    }

    pub fn is_multi_seat_sequential_winner_takes_all(&self) -> bool {
        self.winner_election_mode == WinnerElectionMode::MultiSeatSequentialWinnerTakesAll
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_candidates() -> Vec<Candidate> {
        vec![
            Candidate::new("Alice"),
            Candidate {
                name: "Bob".to_string(),
                code: Some("BOB".to_string()),
                excluded: false,
            },
            Candidate {
                name: "Clara".to_string(),
                code: None,
                excluded: true,
            },
        ]
    }

    #[test]
    fn name_resolution_covers_codes() {
        let config = ContestConfig::new(three_candidates());
        assert_eq!(config.name_for_candidate("Alice"), Some("Alice"));
        assert_eq!(config.name_for_candidate("BOB"), Some("Bob"));
        assert_eq!(config.name_for_candidate("Bob"), Some("Bob"));
        assert_eq!(config.name_for_candidate("Zed"), None);
    }

    #[test]
    fn exclusion_flag() {
        let config = ContestConfig::new(three_candidates());
        assert!(config.candidate_is_excluded("Clara"));
        assert!(!config.candidate_is_excluded("Alice"));
    }

    #[test]
    fn declared_count_skips_write_in_bucket() {
        let mut candidates = three_candidates();
        candidates.push(Candidate::new(UNDECLARED_WRITE_IN_LABEL));
        let config = ContestConfig::new(candidates);
        assert_eq!(config.num_candidates(), 4);
        assert_eq!(config.num_declared_candidates(), 3);
    }

    #[test]
    fn random_seed_requirement_follows_mode() {
        let mut config = ContestConfig::new(three_candidates());
        assert!(!config.needs_random_seed());
        config.tiebreak_mode = TiebreakMode::Random;
        assert!(config.needs_random_seed());
        config.tiebreak_mode = TiebreakMode::GeneratePermutation;
        assert!(config.needs_random_seed());
        config.tiebreak_mode = TiebreakMode::PreviousRoundCountsThenInteractive;
        assert!(!config.needs_random_seed());
    }
}
