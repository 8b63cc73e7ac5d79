//! Decimal arithmetic utilities for share and leverage calculations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Seconds in the 365-day year used for fee proration.
pub const SECONDS_PER_YEAR: i64 = 365 * 86_400;

/// Safe division that returns zero if the divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Round a quantity up to the next multiple of `step`.
///
/// Used to clamp deutilization orders up to the hedge leg's minimum order
/// size rather than leaving an unservable remainder.
pub fn round_up_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step == Decimal::ZERO {
        return value;
    }
    (value / step).ceil() * step
}

/// Elapsed time between two instants as a fraction of a 365-day year.
///
/// Negative intervals clamp to zero so a stale timestamp can never rebate
/// fees.
pub fn year_fraction(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    let secs = (to - from).num_seconds();
    if secs <= 0 {
        return Decimal::ZERO;
    }
    Decimal::from(secs) / Decimal::from(SECONDS_PER_YEAR)
}

/// Relative deviation of `a` from `b`, as a fraction of `b`.
pub fn relative_deviation(a: Decimal, b: Decimal) -> Decimal {
    if b == Decimal::ZERO {
        return if a == Decimal::ZERO { Decimal::ZERO } else { dec!(1) };
    }
    ((a - b) / b).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_safe_div_zero_denominator() {
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
    }

    #[test]
    fn test_round_up_to_step() {
        assert_eq!(round_up_to_step(dec!(7), dec!(10)), dec!(10));
        assert_eq!(round_up_to_step(dec!(10), dec!(10)), dec!(10));
        assert_eq!(round_up_to_step(dec!(10.1), dec!(10)), dec!(20));
        assert_eq!(round_up_to_step(dec!(3), Decimal::ZERO), dec!(3));
    }

    #[test]
    fn test_year_fraction() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        // 36.5 days = 0.1 of a 365-day year
        let t1 = t0 + chrono::Duration::seconds(36 * 86_400 + 43_200);
        assert_eq!(year_fraction(t0, t1), dec!(0.1));
        // Clock going backwards yields zero, not a negative accrual
        assert_eq!(year_fraction(t1, t0), Decimal::ZERO);
    }

    #[test]
    fn test_relative_deviation() {
        assert_eq!(relative_deviation(dec!(11), dec!(10)), dec!(0.1));
        assert_eq!(relative_deviation(dec!(9), dec!(10)), dec!(0.1));
        assert_eq!(relative_deviation(Decimal::ZERO, Decimal::ZERO), Decimal::ZERO);
    }
}
