//! Property tests: conservation, determinism, termination, and the
//! batch-elimination rewind invariant, over randomly generated contests.

use proptest::prelude::*;

use ranked_tabulation::{
    Candidate, CandidateRankings, CandidatesAtRanking, CastVoteRecord, ContestConfig, Tabulator,
};
use rust_decimal::Decimal;

const CANDIDATES: [&str; 5] = ["A", "B", "C", "D", "E"];

fn make_ballots(raw: &[Vec<u8>]) -> Vec<CastVoteRecord> {
    raw.iter()
        .enumerate()
        .map(|(i, prefs)| {
            let mut pairs = Vec::new();
            for (rank0, candidate_idx) in prefs.iter().enumerate() {
                let name = CANDIDATES[*candidate_idx as usize % CANDIDATES.len()];
                pairs.push((
                    rank0 as u32 + 1,
                    CandidatesAtRanking::new(vec![name.to_string()]),
                ));
            }
            CastVoteRecord::new(&format!("ballot-{:04}", i), CandidateRankings::new(pairs))
        })
        .collect()
}

fn base_config() -> ContestConfig {
    let mut config = ContestConfig::new(CANDIDATES.iter().map(|n| Candidate::new(n)).collect());
    // rankings are dense, so the skip limit never fires; duplicates may
    // occur in generated ballots and are allowed to count
    config.max_skipped_ranks_allowed = None;
    config
}

fn arbitrary_ballots() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(0u8..5, 0..5), 1..40)
}

proptest! {
    // Every round conserves the full ballot weight: actives plus inactives
    // plus accumulated residual surplus equals the number of ballots.
    #[test]
    fn conservation_across_rounds(raw in arbitrary_ballots()) {
        let total = Decimal::from(raw.len() as u64);
        let mut tabulator = Tabulator::new(make_ballots(&raw), base_config()).unwrap();
        tabulator.tabulate().unwrap();
        let result = tabulator.into_result();
        for (round, tally) in &result.round_tallies {
            let sum = tally.num_active_ballots()
                + tally.num_inactive_ballots()
                + result.round_to_residual_surplus[round];
            prop_assert_eq!(sum, total);
        }
    }

    // Re-running the engine on identical inputs reproduces every ledger
    // bit for bit.
    #[test]
    fn tabulation_is_deterministic(raw in arbitrary_ballots()) {
        let run = || {
            let mut config = base_config();
            config.tiebreak_mode = ranked_tabulation::TiebreakMode::Random;
            config.random_seed = Some(98217);
            let mut tabulator = Tabulator::new(make_ballots(&raw), config).unwrap();
            tabulator.tabulate().unwrap();
            tabulator.into_result()
        };
        let first = run();
        let second = run();
        prop_assert_eq!(&first.round_tallies, &second.round_tallies);
        prop_assert_eq!(&first.tally_transfers, &second.tally_transfers);
        prop_assert_eq!(&first.winner_to_round, &second.winner_to_round);
        prop_assert_eq!(
            &first.candidate_to_round_eliminated,
            &second.candidate_to_round_eliminated
        );
        for (a, b) in first
            .cast_vote_records
            .iter()
            .zip(second.cast_vote_records.iter())
        {
            prop_assert_eq!(a.round_outcomes(), b.round_outcomes());
        }
    }

    // The round loop finishes within one round per candidate.
    #[test]
    fn termination_within_candidate_count(raw in arbitrary_ballots()) {
        let mut tabulator = Tabulator::new(make_ballots(&raw), base_config()).unwrap();
        tabulator.tabulate().unwrap();
        prop_assert!(tabulator.current_round() as usize <= CANDIDATES.len());
    }

    // No candidate is ever both elected and eliminated, and tallies only
    // grow for continuing candidates from round to round.
    #[test]
    fn ledgers_disjoint_and_tallies_monotone(raw in arbitrary_ballots()) {
        let mut tabulator = Tabulator::new(make_ballots(&raw), base_config()).unwrap();
        tabulator.tabulate().unwrap();
        let result = tabulator.into_result();
        for winner in result.winner_to_round.keys() {
            prop_assert!(!result.candidate_to_round_eliminated.contains_key(winner));
        }
        for round in 1..result.num_rounds {
            let current = &result.round_tallies[&round];
            let next = &result.round_tallies[&(round + 1)];
            for candidate in next.candidates() {
                if let (Some(now), Some(later)) = (
                    current.candidate_tally(&candidate),
                    next.candidate_tally(&candidate),
                ) {
                    prop_assert!(later >= now);
                }
            }
        }
    }

    // Batch elimination under continue-until-two must never leave fewer
    // than two candidates standing (the rewind invariant).
    #[test]
    fn batch_rewind_leaves_at_least_two(raw in arbitrary_ballots()) {
        let mut config = base_config();
        config.batch_elimination = true;
        config.continue_until_two_candidates_remain = true;
        let mut tabulator = Tabulator::new(make_ballots(&raw), config).unwrap();
        tabulator.tabulate().unwrap();
        let result = tabulator.into_result();
        prop_assert!(
            result.candidate_to_round_eliminated.len() <= CANDIDATES.len() - 2,
            "eliminated {} of {} candidates",
            result.candidate_to_round_eliminated.len(),
            CANDIDATES.len()
        );
    }
}
