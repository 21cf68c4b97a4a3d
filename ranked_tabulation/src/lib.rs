//! Ranked-choice voting tabulation.
//!
//! This crate implements the round-by-round tabulation of a single
//! ranked-choice contest: single-winner instant-runoff, multi-winner
//! single transferable vote with fractional surplus transfers, bottoms-up
//! variants, and sequential winner-takes-all. The rules follow the RCTab
//! reference semantics (overvote and skipped-rank handling, duplicate
//! exhaustion, batch elimination, six tiebreak modes, precinct-level
//! tallies).
//!
//! All vote arithmetic is exact decimal with explicit scales and rounding
//! directions, and every iteration order that can affect an outcome is
//! deterministic, so a tabulation can be re-run bit for bit from the same
//! inputs and seed.
//!
//! ```
//! use ranked_tabulation::{
//!     Candidate, CandidateRankings, CandidatesAtRanking, CastVoteRecord, ContestConfig,
//!     Tabulator,
//! };
//!
//! let config = ContestConfig::new(vec![
//!     Candidate::new("Alice"),
//!     Candidate::new("Bob"),
//! ]);
//! let ballots: Vec<CastVoteRecord> = ["Alice", "Alice", "Bob"]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, choice)| {
//!         let ranks = vec![(1, CandidatesAtRanking::new(vec![choice.to_string()]))];
//!         CastVoteRecord::new(&format!("ballot-{}", i), CandidateRankings::new(ranks))
//!     })
//!     .collect();
//! let mut tabulator = Tabulator::new(ballots, config)?;
//! let winners = tabulator.tabulate()?;
//! assert!(winners.contains("Alice"));
//! # Ok::<(), ranked_tabulation::TabulationError>(())
//! ```

mod arithmetic;
mod ballot;
mod config;
mod overvote;
mod tabulator;
mod tally;
mod tiebreak;

pub use arithmetic::VoteArithmetic;
pub use ballot::{
    BallotStatus, CandidateRankings, CandidatesAtRanking, CastVoteRecord, VoteOutcome,
    VoteOutcomeType,
};
pub use config::{
    Candidate, ContestConfig, OvervoteRule, TiebreakMode, WinnerElectionMode,
    EXPLICIT_OVERVOTE_LABEL, UNDECLARED_WRITE_IN_LABEL,
};
pub use overvote::{decide_overvote, OvervoteDecision};
pub use tabulator::{tabulate_sequential, CandidateStatus, ContestResult, Tabulator};
pub use tally::{RoundTally, TallyTransfers};
pub use tiebreak::{InteractiveTiebreakPrompt, Tiebreak};

use thiserror::Error;

/// The single fatal error surface of the engine. Tabulation halts on the
/// first of these; inactive-ballot outcomes are recorded on the ballots and
/// are not errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TabulationError {
    #[error("tabulation was cancelled by the user")]
    CancelledByUser,
    #[error("\"Tabulate by Precinct\" enabled, but CVRs don't list precincts")]
    NoPrecinctsInData,
    #[error("tabulation can't proceed because all declared candidates are below the minimum vote threshold")]
    AllCandidatesBelowMinimumThreshold,
    #[error("failed to eliminate any candidates in round {round}")]
    NoCandidateToEliminate { round: u32 },
    #[error("found multiple candidates at a ranking that carries the explicit overvote label")]
    OvervoteLabelNotAlone,
    #[error("invalid overvote rule {rule:?} selected when an explicit overvote label was provided")]
    InvalidOvervoteRule { rule: OvervoteRule },
    #[error("precinct \"{precinct}\" is not among the known precincts")]
    UnknownPrecinct { precinct: String },
    #[error("round {round} requires an interactive tiebreak but no prompt is available")]
    InteractiveTiebreakUnavailable { round: u32 },
    #[error("invalid contest configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl TabulationError {
    /// True when the tabulation stopped because the user asked it to, as
    /// opposed to a problem with the input data or configuration.
    pub fn cancelled_by_user(&self) -> bool {
        matches!(self, TabulationError::CancelledByUser)
    }
}
