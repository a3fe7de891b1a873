use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::Neg;

/// A template number. Integers stay integers until an operation needs a fraction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    /// Returns the value as `f64`.
    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }

    /// Returns the value as `i64`, truncating any fractional part.
    pub fn to_int(self) -> i64 {
        match self {
            Number::Int(i) => i,
            Number::Float(f) => f as i64,
        }
    }

    pub fn is_int(&self) -> bool {
        matches!(self, Number::Int(_))
    }

    /// Returns `true` for integral values regardless of representation.
    pub fn is_integral(&self) -> bool {
        match self {
            Number::Int(_) => true,
            Number::Float(f) => f.is_finite() && f.fract() == 0.0,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Number::Int(i) => *i == 0,
            Number::Float(f) => *f == 0.0,
        }
    }

    pub fn abs(&self) -> Self {
        match self {
            Number::Int(i) => i.checked_abs().map(Number::Int).unwrap_or(Number::Float((*i as f64).abs())),
            Number::Float(f) => Number::Float(f.abs()),
        }
    }

    pub fn round(&self, precision: i32) -> Self {
        match self {
            Number::Int(_) if precision >= 0 => *self,
            _ => {
                let factor = 10f64.powi(precision);
                let rounded = (self.as_f64() * factor).round() / factor;
                if precision <= 0 { Number::from_f64(rounded) } else { Number::Float(rounded) }
            }
        }
    }

    /// Collapses integral floats that fit into `i64` back to integers.
    pub fn from_f64(value: f64) -> Self {
        if value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15 {
            Number::Int(value as i64)
        } else {
            Number::Float(value)
        }
    }

    pub fn add(self, other: Self) -> Self {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.checked_add(b).map(Number::Int).unwrap_or(Number::Float(a as f64 + b as f64)),
            (a, b) => Number::Float(a.as_f64() + b.as_f64()),
        }
    }

    pub fn sub(self, other: Self) -> Self {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.checked_sub(b).map(Number::Int).unwrap_or(Number::Float(a as f64 - b as f64)),
            (a, b) => Number::Float(a.as_f64() - b.as_f64()),
        }
    }

    pub fn mul(self, other: Self) -> Self {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.checked_mul(b).map(Number::Int).unwrap_or(Number::Float(a as f64 * b as f64)),
            (a, b) => Number::Float(a.as_f64() * b.as_f64()),
        }
    }

    /// Division yields an integer only when it is exact. `None` on division by zero.
    pub fn div(self, other: Self) -> Option<Self> {
        if other.is_zero() {
            return None;
        }

        match (self, other) {
            (Number::Int(a), Number::Int(b)) if a.checked_rem(b) == Some(0) => match a.checked_div(b) {
                Some(quotient) => Some(Number::Int(quotient)),
                None => Some(Number::Float(a as f64 / b as f64)),
            },
            (a, b) => Some(Number::Float(a.as_f64() / b.as_f64())),
        }
    }

    /// Integer remainder, as the `%` operator of the template language truncates both sides.
    pub fn rem(self, other: Self) -> Option<Self> {
        let divisor = other.to_int();
        if divisor == 0 {
            return None;
        }

        Some(Number::Int(self.to_int().wrapping_rem(divisor)))
    }
}

impl Default for Number {
    fn default() -> Self {
        Number::Int(0)
    }
}

impl Neg for Number {
    type Output = Self;

    fn neg(self) -> Self {
        match self {
            Number::Int(i) => i.checked_neg().map(Number::Int).unwrap_or(Number::Float(-(i as f64))),
            Number::Float(f) => Number::Float(-f),
        }
    }
}

impl From<i64> for Number {
    fn from(value: i64) -> Self {
        Number::Int(value)
    }
}

impl From<i32> for Number {
    fn from(value: i32) -> Self {
        Number::Int(value as i64)
    }
}

impl From<usize> for Number {
    fn from(value: usize) -> Self {
        i64::try_from(value).map(Number::Int).unwrap_or(Number::Float(value as f64))
    }
}

impl From<u64> for Number {
    fn from(value: u64) -> Self {
        i64::try_from(value).map(Number::Int).unwrap_or(Number::Float(value as f64))
    }
}

impl From<f64> for Number {
    fn from(value: f64) -> Self {
        Number::Float(value)
    }
}

impl fmt::Display for Number {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Number::Int(i) => write!(f, "{}", i),
            Number::Float(v) if v.is_nan() => write!(f, "NAN"),
            Number::Float(v) if v.is_infinite() => write!(f, "{}", if *v > 0.0 { "INF" } else { "-INF" }),
            Number::Float(v) if v.fract() == 0.0 && v.abs() < 1e15 => write!(f, "{}", *v as i64),
            Number::Float(v) => {
                let s = format!("{:.14}", v);
                let s = s.trim_end_matches('0').trim_end_matches('.');
                write!(f, "{}", s)
            }
        }
    }
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            (a, b) => a.as_f64() == b.as_f64(),
        }
    }
}

impl PartialOrd for Number {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => Some(a.cmp(b)),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::int(Number::Int(42), "42")]
    #[case::negative(Number::Int(-7), "-7")]
    #[case::float(Number::Float(42.125), "42.125")]
    #[case::integral_float(Number::Float(3.0), "3")]
    #[case::rounding_noise(Number::Float(0.1 + 0.2), "0.3")]
    fn test_display(#[case] number: Number, #[case] expected: &str) {
        assert_eq!(number.to_string(), expected);
    }

    #[rstest]
    #[case::exact(Number::Int(10), Number::Int(2), Some(Number::Int(5)))]
    #[case::fraction(Number::Int(7), Number::Int(2), Some(Number::Float(3.5)))]
    #[case::by_zero(Number::Int(7), Number::Int(0), None)]
    #[case::float_by_zero(Number::Float(1.5), Number::Float(0.0), None)]
    #[case::min_by_minus_one(Number::Int(i64::MIN), Number::Int(-1), Some(Number::Float(9.223372036854775808e18)))]
    #[case::min_by_one(Number::Int(i64::MIN), Number::Int(1), Some(Number::Int(i64::MIN)))]
    fn test_div(#[case] a: Number, #[case] b: Number, #[case] expected: Option<Number>) {
        assert_eq!(a.div(b), expected);
    }

    #[rstest]
    #[case::by_zero(Number::Int(7), Number::Int(0), None)]
    #[case::min_by_minus_one(Number::Int(i64::MIN), Number::Int(-1), Some(Number::Int(0)))]
    #[case::truncates(Number::Float(7.9), Number::Int(3), Some(Number::Int(1)))]
    fn test_rem(#[case] a: Number, #[case] b: Number, #[case] expected: Option<Number>) {
        assert_eq!(a.rem(b), expected);
    }

    #[test]
    fn test_overflow_promotes_to_float() {
        assert!(!Number::Int(i64::MAX).add(Number::Int(1)).is_int());
    }

    #[rstest]
    #[case(Number::Int(1), Number::Float(1.0), true)]
    #[case(Number::Int(1), Number::Int(2), false)]
    fn test_eq(#[case] a: Number, #[case] b: Number, #[case] expected: bool) {
        assert_eq!(a == b, expected);
    }
}
