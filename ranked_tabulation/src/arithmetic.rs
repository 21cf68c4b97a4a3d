//! Exact decimal arithmetic with a configured scale.
//!
//! Every division in the engine goes through this module so that the scale
//! and the rounding direction are always explicit. Two runs with the same
//! inputs produce identical digits on every platform: there is no native
//! floating point anywhere on a result path.

use rust_decimal::{Decimal, RoundingStrategy};

/// Arithmetic helper carrying the contest-wide precision settings.
///
/// `decimal_places` is the scale used for vote arithmetic (surplus
/// fractions, tally divisions). `non_integer_thresholds` selects whether
/// winning thresholds are computed at that scale or at whole-vote
/// granularity.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct VoteArithmetic {
    decimal_places: u32,
    non_integer_thresholds: bool,
}

impl VoteArithmetic {
    pub const MAX_DECIMAL_PLACES: u32 = 20;

    pub fn new(decimal_places: u32, non_integer_thresholds: bool) -> VoteArithmetic {
        assert!(
            decimal_places <= Self::MAX_DECIMAL_PLACES,
            "decimal_places must be in 0..=20, got {}",
            decimal_places
        );
        VoteArithmetic {
            decimal_places,
            non_integer_thresholds,
        }
    }

    pub fn decimal_places(&self) -> u32 {
        self.decimal_places
    }

    /// Scale used for winning thresholds: the configured number of decimal
    /// places when non-integer thresholds are allowed, zero otherwise.
    pub fn threshold_scale(&self) -> u32 {
        if self.non_integer_thresholds {
            self.decimal_places
        } else {
            0
        }
    }

    /// The smallest representable increment at the threshold scale,
    /// `10^(-scale)`. With integer thresholds this is 1.
    pub fn threshold_augend(&self) -> Decimal {
        Decimal::new(1, self.threshold_scale())
    }

    /// `dividend / divisor` truncated to the vote-arithmetic scale.
    pub fn divide(&self, dividend: Decimal, divisor: Decimal) -> Decimal {
        Self::divide_with_scale(dividend, divisor, self.decimal_places, RoundingStrategy::ToZero)
    }

    /// `dividend / divisor` at the threshold scale, rounded down.
    pub fn divide_down_threshold(&self, dividend: Decimal, divisor: Decimal) -> Decimal {
        Self::divide_with_scale(dividend, divisor, self.threshold_scale(), RoundingStrategy::ToZero)
    }

    /// `dividend / divisor` at the threshold scale, rounded up.
    pub fn divide_up_threshold(&self, dividend: Decimal, divisor: Decimal) -> Decimal {
        Self::divide_with_scale(
            dividend,
            divisor,
            self.threshold_scale(),
            RoundingStrategy::AwayFromZero,
        )
    }

    fn divide_with_scale(
        dividend: Decimal,
        divisor: Decimal,
        scale: u32,
        strategy: RoundingStrategy,
    ) -> Decimal {
        assert!(!divisor.is_zero(), "division by zero in vote arithmetic");
        (dividend / divisor).round_dp_with_strategy(scale, strategy)
    }

    /// Exact product. Multiplication never rounds; the operands the engine
    /// produces are bounded well inside `Decimal`'s 28 significant digits.
    pub fn multiply(&self, multiplier: Decimal, multiplicand: Decimal) -> Decimal {
        multiplier * multiplicand
    }
}
