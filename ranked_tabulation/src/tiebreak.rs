use std::collections::BTreeMap;

use log::info;
use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::Decimal;

use crate::config::TiebreakMode;
use crate::tally::RoundTally;
use crate::TabulationError;

/// Out-of-band selection seam for the interactive tiebreak modes. The
/// engine never blocks on input itself; callers that enable an interactive
/// mode must supply an implementation (tests use a deterministic stub).
pub trait InteractiveTiebreakPrompt {
    /// Returns the chosen candidate, or `None` to abandon the tabulation.
    fn select_candidate(
        &mut self,
        round: u32,
        tied_candidates: &[String],
        selecting_winner: bool,
    ) -> Option<String>;
}

/// Resolves a tie among candidates with equal tallies, either to pick a
/// winner or to pick the candidate to eliminate.
///
/// Whatever the mode, candidates are always considered in sorted order so
/// the same inputs and seed reproduce the same choice.
pub struct Tiebreak<'a> {
    selecting_winner: bool,
    tied_candidates: Vec<String>,
    mode: TiebreakMode,
    round: u32,
    round_tallies: &'a BTreeMap<u32, RoundTally>,
    candidate_permutation: &'a [String],
    selected: Option<String>,
    explanation: String,
}

impl<'a> Tiebreak<'a> {
    pub fn new(
        selecting_winner: bool,
        tied_candidates: &[String],
        mode: TiebreakMode,
        round: u32,
        round_tallies: &'a BTreeMap<u32, RoundTally>,
        candidate_permutation: &'a [String],
    ) -> Tiebreak<'a> {
        let mut tied: Vec<String> = tied_candidates.to_vec();
        tied.sort();
        Tiebreak {
            selecting_winner,
            tied_candidates: tied,
            mode,
            round,
            round_tallies,
            candidate_permutation,
            selected: None,
            explanation: String::new(),
        }
    }

    /// Runs the configured mode and returns exactly one candidate.
    pub fn select_candidate(
        &mut self,
        rng: Option<&mut StdRng>,
        prompt: Option<&mut (dyn InteractiveTiebreakPrompt + 'static)>,
    ) -> Result<String, TabulationError> {
        let selection = match self.mode {
            TiebreakMode::Random => self.select_by_random(rng)?,
            TiebreakMode::Interactive => self.select_interactively(prompt)?,
            TiebreakMode::PreviousRoundCountsThenRandom
            | TiebreakMode::PreviousRoundCountsThenInteractive => {
                self.select_by_previous_rounds(rng, prompt)?
            }
            TiebreakMode::UsePermutationInConfig | TiebreakMode::GeneratePermutation => {
                self.select_by_permutation()?
            }
        };
        self.selected = Some(selection.clone());
        Ok(selection)
    }

    pub fn explanation(&self) -> &str {
        &self.explanation
    }

    /// The tied candidates that were not chosen, for audit logging.
    pub fn non_selected_candidate_description(&self) -> String {
        let others: Vec<&str> = self
            .tied_candidates
            .iter()
            .filter(|c| Some(c.as_str()) != self.selected.as_deref())
            .map(|c| c.as_str())
            .collect();
        match others.as_slice() {
            [] => String::new(),
            [only] => format!("\"{}\"", only),
            [head @ .., last] => {
                let head: Vec<String> = head.iter().map(|c| format!("\"{}\"", c)).collect();
                format!("{} and \"{}\"", head.join(", "), last)
            }
        }
    }

    fn select_by_random(&mut self, rng: Option<&mut StdRng>) -> Result<String, TabulationError> {
        let rng = rng.ok_or(TabulationError::InvalidConfig {
            reason: "random tiebreak requested but no random seed was configured".to_string(),
        })?;
        let index = rng.gen_range(0..self.tied_candidates.len());
        self.explanation = "Randomly selected from the tied candidates.".to_string();
        Ok(self.tied_candidates[index].clone())
    }

    fn select_interactively(
        &mut self,
        prompt: Option<&mut (dyn InteractiveTiebreakPrompt + 'static)>,
    ) -> Result<String, TabulationError> {
        let prompt = prompt.ok_or(TabulationError::InteractiveTiebreakUnavailable {
            round: self.round,
        })?;
        let choice = prompt
            .select_candidate(self.round, &self.tied_candidates, self.selecting_winner)
            .filter(|c| self.tied_candidates.contains(c))
            .ok_or(TabulationError::InteractiveTiebreakUnavailable { round: self.round })?;
        self.explanation = "Chosen interactively.".to_string();
        Ok(choice)
    }

    // Walk earlier rounds, keeping only the candidates with the minimum
    // (loser case) or maximum (winner case) tally at each, until one
    // remains or round 1 still leaves a tie.
    fn select_by_previous_rounds(
        &mut self,
        rng: Option<&mut StdRng>,
        prompt: Option<&mut (dyn InteractiveTiebreakPrompt + 'static)>,
    ) -> Result<String, TabulationError> {
        let mut in_contention = self.tied_candidates.clone();
        for round in (1..self.round).rev() {
            let tally = &self.round_tallies[&round];
            let mut by_tally: BTreeMap<Decimal, Vec<String>> = BTreeMap::new();
            for candidate in &in_contention {
                let votes = tally.candidate_tally(candidate).unwrap_or(Decimal::ZERO);
                by_tally.entry(votes).or_default().push(candidate.clone());
            }
            let (votes, group) = if self.selecting_winner {
                by_tally.iter().next_back().expect("tied set is never empty")
            } else {
                by_tally.iter().next().expect("tied set is never empty")
            };
            if let [single] = group.as_slice() {
                self.explanation = format!(
                    "\"{}\" had the {} votes ({}) in round {}.",
                    single,
                    if self.selecting_winner { "most" } else { "fewest" },
                    votes,
                    round
                );
                return Ok(single.clone());
            }
            in_contention = group.clone();
        }

        info!(
            "Tie still unresolved after looking at all previous rounds; falling back for {:?}.",
            in_contention
        );
        self.tied_candidates = in_contention;
        if self.mode == TiebreakMode::PreviousRoundCountsThenRandom {
            self.select_by_random(rng)
        } else {
            self.select_interactively(prompt)
        }
    }

    // Winner: the first tied candidate in permutation order. Loser: the
    // last.
    fn select_by_permutation(&mut self) -> Result<String, TabulationError> {
        let mut selection: Option<&String> = None;
        for candidate in self.candidate_permutation {
            if !self.tied_candidates.contains(candidate) {
                continue;
            }
            selection = Some(candidate);
            if self.selecting_winner {
                break;
            }
        }
        let selection = selection.ok_or_else(|| TabulationError::InvalidConfig {
            reason: format!(
                "tied candidates {:?} are missing from the candidate permutation",
                self.tied_candidates
            ),
        })?;
        self.explanation = format!(
            "\"{}\" appeared {} in the candidate permutation.",
            selection,
            if self.selecting_winner { "earliest" } else { "latest" }
        );
        Ok(selection.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tally::RoundTally;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;

    fn tallies_for(rounds: &[&[(&str, Decimal)]]) -> BTreeMap<u32, RoundTally> {
        let mut result = BTreeMap::new();
        for (idx, entries) in rounds.iter().enumerate() {
            let round = idx as u32 + 1;
            let mut tally = RoundTally::new(round, entries.iter().map(|(c, _)| c.to_string()));
            for (candidate, votes) in entries.iter() {
                tally.add_to_candidate_tally(candidate, *votes);
            }
            tally.lock_in_round();
            result.insert(round, tally);
        }
        result
    }

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn permutation_winner_takes_first_loser_takes_last() {
        let tallies = BTreeMap::new();
        let permutation = names(&["D", "E", "F"]);
        let tied = names(&["E", "D"]);

        let mut winner_break =
            Tiebreak::new(true, &tied, TiebreakMode::UsePermutationInConfig, 2, &tallies, &permutation);
        assert_eq!(winner_break.select_candidate(None, None).unwrap(), "D");

        let mut loser_break =
            Tiebreak::new(false, &tied, TiebreakMode::UsePermutationInConfig, 2, &tallies, &permutation);
        assert_eq!(loser_break.select_candidate(None, None).unwrap(), "E");
        assert_eq!(loser_break.non_selected_candidate_description(), "\"D\"");
    }

    #[test]
    fn previous_round_counts_narrow_the_tie() {
        // Round 3 has D and E tied; round 2 had D=5, E=4 -> E is the loser.
        let tallies = tallies_for(&[
            &[("D", dec!(4)), ("E", dec!(4)), ("F", dec!(9))],
            &[("D", dec!(5)), ("E", dec!(4)), ("F", dec!(9))],
        ]);
        let permutation = names(&["D", "E", "F"]);
        let tied = names(&["D", "E"]);
        let mut tiebreak = Tiebreak::new(
            false,
            &tied,
            TiebreakMode::PreviousRoundCountsThenRandom,
            3,
            &tallies,
            &permutation,
        );
        assert_eq!(tiebreak.select_candidate(None, None).unwrap(), "E");
        assert!(tiebreak.explanation().contains("round 2"));
    }

    #[test]
    fn previous_round_counts_fall_back_to_seeded_random() {
        // Tied in every earlier round: the fallback consumes the seeded rng,
        // so the outcome is reproducible.
        let tallies = tallies_for(&[
            &[("D", dec!(5)), ("E", dec!(5))],
            &[("D", dec!(7)), ("E", dec!(7))],
        ]);
        let permutation = names(&["D", "E"]);
        let tied = names(&["D", "E"]);

        let pick = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut tiebreak = Tiebreak::new(
                false,
                &tied,
                TiebreakMode::PreviousRoundCountsThenRandom,
                3,
                &tallies,
                &permutation,
            );
            tiebreak.select_candidate(Some(&mut rng), None).unwrap()
        };
        assert_eq!(pick(1234), pick(1234));
    }

    #[test]
    fn random_without_rng_is_a_config_error() {
        let tallies = BTreeMap::new();
        let permutation = names(&["A", "B"]);
        let tied = names(&["A", "B"]);
        let mut tiebreak =
            Tiebreak::new(false, &tied, TiebreakMode::Random, 1, &tallies, &permutation);
        let err = tiebreak.select_candidate(None, None).unwrap_err();
        assert!(matches!(err, TabulationError::InvalidConfig { .. }));
    }

    struct FixedPrompt(&'static str);
    impl InteractiveTiebreakPrompt for FixedPrompt {
        fn select_candidate(&mut self, _: u32, _: &[String], _: bool) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    #[test]
    fn interactive_mode_uses_the_prompt() {
        let tallies = BTreeMap::new();
        let permutation = names(&["A", "B"]);
        let tied = names(&["A", "B"]);
        let mut prompt = FixedPrompt("B");
        let mut tiebreak =
            Tiebreak::new(false, &tied, TiebreakMode::Interactive, 1, &tallies, &permutation);
        assert_eq!(
            tiebreak.select_candidate(None, Some(&mut prompt)).unwrap(),
            "B"
        );
    }

    #[test]
    fn interactive_without_prompt_aborts() {
        let tallies = BTreeMap::new();
        let permutation = names(&["A", "B"]);
        let tied = names(&["A", "B"]);
        let mut tiebreak =
            Tiebreak::new(true, &tied, TiebreakMode::Interactive, 4, &tallies, &permutation);
        let err = tiebreak.select_candidate(None, None).unwrap_err();
        assert!(matches!(
            err,
            TabulationError::InteractiveTiebreakUnavailable { round: 4 }
        ));
    }
}
