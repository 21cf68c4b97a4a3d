use crate::ballot::CandidatesAtRanking;
use crate::config::{OvervoteRule, EXPLICIT_OVERVOTE_LABEL};
use crate::TabulationError;

/// What to do with a ballot when a rank holds an overvote.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum OvervoteDecision {
    None,
    Exhaust,
    SkipToNextRank,
}

/// Applies the configured overvote rule to the candidates marked at one
/// rank.
///
/// `is_continuing` reports whether a mark refers to a continuing candidate;
/// it is only consulted for the exhaust-if-multiple-continuing rule. An
/// explicit overvote sentinel sharing a rank with any other mark, or
/// combined with a rule other than exhaust-immediately / always-skip, is a
/// fatal configuration error.
pub fn decide_overvote<F>(
    candidates: &CandidatesAtRanking,
    rule: OvervoteRule,
    is_continuing: F,
) -> Result<OvervoteDecision, TabulationError>
where
    F: Fn(&str) -> bool,
{
    if candidates.contains(EXPLICIT_OVERVOTE_LABEL) {
        // The sentinel replaces the overvoted marks; anything else at the
        // same rank means the input was not normalized.
        if candidates.count() != 1 {
            return Err(TabulationError::OvervoteLabelNotAlone);
        }
        return match rule {
            OvervoteRule::ExhaustImmediately => Ok(OvervoteDecision::Exhaust),
            OvervoteRule::AlwaysSkipToNextRank => Ok(OvervoteDecision::SkipToNextRank),
            OvervoteRule::ExhaustIfMultipleContinuing => {
                Err(TabulationError::InvalidOvervoteRule { rule })
            }
        };
    }

    if candidates.count() <= 1 {
        return Ok(OvervoteDecision::None);
    }

    Ok(match rule {
        OvervoteRule::ExhaustImmediately => OvervoteDecision::Exhaust,
        OvervoteRule::AlwaysSkipToNextRank => OvervoteDecision::SkipToNextRank,
        OvervoteRule::ExhaustIfMultipleContinuing => {
            let num_continuing = candidates.iter().filter(|c| is_continuing(c)).count();
            if num_continuing >= 2 {
                OvervoteDecision::Exhaust
            } else {
                OvervoteDecision::None
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at_rank(names: &[&str]) -> CandidatesAtRanking {
        CandidatesAtRanking::new(names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn single_candidate_is_never_an_overvote() {
        for rule in [
            OvervoteRule::ExhaustImmediately,
            OvervoteRule::AlwaysSkipToNextRank,
            OvervoteRule::ExhaustIfMultipleContinuing,
        ] {
            let decision = decide_overvote(&at_rank(&["A"]), rule, |_| true).unwrap();
            assert_eq!(decision, OvervoteDecision::None);
        }
    }

    #[test]
    fn multiple_candidates_follow_the_rule() {
        let rank = at_rank(&["A", "B"]);
        assert_eq!(
            decide_overvote(&rank, OvervoteRule::ExhaustImmediately, |_| true).unwrap(),
            OvervoteDecision::Exhaust
        );
        assert_eq!(
            decide_overvote(&rank, OvervoteRule::AlwaysSkipToNextRank, |_| true).unwrap(),
            OvervoteDecision::SkipToNextRank
        );
    }

    #[test]
    fn exhaust_if_multiple_continuing_counts_the_continuing_set() {
        let rank = at_rank(&["A", "B", "C"]);
        let rule = OvervoteRule::ExhaustIfMultipleContinuing;
        // two continuing -> exhaust
        let decision = decide_overvote(&rank, rule, |c| c != "C").unwrap();
        assert_eq!(decision, OvervoteDecision::Exhaust);
        // only one continuing -> the overvote resolves itself
        let decision = decide_overvote(&rank, rule, |c| c == "A").unwrap();
        assert_eq!(decision, OvervoteDecision::None);
        // none continuing
        let decision = decide_overvote(&rank, rule, |_| false).unwrap();
        assert_eq!(decision, OvervoteDecision::None);
    }

    #[test]
    fn explicit_sentinel_must_be_alone() {
        let rank = at_rank(&[EXPLICIT_OVERVOTE_LABEL, "A"]);
        let err = decide_overvote(&rank, OvervoteRule::ExhaustImmediately, |_| true).unwrap_err();
        assert!(matches!(err, TabulationError::OvervoteLabelNotAlone));
    }

    #[test]
    fn explicit_sentinel_decisions() {
        let rank = at_rank(&[EXPLICIT_OVERVOTE_LABEL]);
        assert_eq!(
            decide_overvote(&rank, OvervoteRule::ExhaustImmediately, |_| true).unwrap(),
            OvervoteDecision::Exhaust
        );
        assert_eq!(
            decide_overvote(&rank, OvervoteRule::AlwaysSkipToNextRank, |_| true).unwrap(),
            OvervoteDecision::SkipToNextRank
        );
        let err =
            decide_overvote(&rank, OvervoteRule::ExhaustIfMultipleContinuing, |_| true).unwrap_err();
        assert!(matches!(err, TabulationError::InvalidOvervoteRule { .. }));
    }
}
