//! Decimal arithmetic utilities for financial calculations.

use rust_decimal::Decimal;

/// Floor a quantity down to the nearest multiple of `step`.
pub fn floor_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step == Decimal::ZERO {
        return value;
    }
    (value / step).floor() * step
}

/// Whether `value` is an exact multiple of `step`.
pub fn conforms_to_step(value: Decimal, step: Decimal) -> bool {
    if step == Decimal::ZERO {
        return true;
    }
    (value % step).is_zero()
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Volume-weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_floor_to_step() {
        assert_eq!(floor_to_step(dec!(10000.7), dec!(1)), dec!(10000));
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.01)), dec!(1.56));
        assert_eq!(floor_to_step(dec!(1.567), dec!(0.1)), dec!(1.5));
        assert_eq!(floor_to_step(dec!(0.4), dec!(1)), dec!(0));
    }

    #[test]
    fn test_conforms_to_step() {
        assert!(conforms_to_step(dec!(10.5), dec!(0.5)));
        assert!(!conforms_to_step(dec!(10.3), dec!(0.5)));
        assert!(conforms_to_step(dec!(7), Decimal::ZERO));
    }

    #[test]
    fn test_weighted_average() {
        let values = vec![(dec!(100), dec!(2)), (dec!(200), dec!(1))];
        let avg = weighted_average(&values);
        assert!(avg > dec!(133) && avg < dec!(134));
        assert_eq!(weighted_average(&[]), Decimal::ZERO);
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(10), dec!(4)), dec!(2.5));
        assert_eq!(safe_div(dec!(10), Decimal::ZERO), Decimal::ZERO);
    }
}
