use std::ops::{Add, Neg, Sub};

use serde::{Deserialize, Deserializer, Serialize};

/// Whole currency units. Balances, stakes and ledger amounts never carry a
/// fractional part.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Money(pub i64);

impl Money {
    pub const ZERO: Money = Money(0);

    pub fn zero() -> Self {
        Self::ZERO
    }

    pub fn as_units(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn checked_mul(self, factor: i64) -> Option<Money> {
        self.0.checked_mul(factor).map(Money)
    }

    /// Parses "100", "-25" or "100.00". A non-zero fractional part is rejected
    /// rather than rounded.
    pub fn from_units_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }

        let mut parts = s.split('.');
        let int_part = parts.next()?;
        if int_part.is_empty() || int_part == "-" {
            return None;
        }
        let units: i64 = int_part.parse().ok()?;

        if let Some(frac) = parts.next() {
            if !frac.chars().all(|c| c == '0') {
                return None;
            }
        }
        if parts.next().is_some() {
            return None;
        }

        Some(Self(units))
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl From<i64> for Money {
    fn from(units: i64) -> Self {
        Money(units)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Money::from_units_str(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("Invalid Money format: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::Money;

    #[test]
    fn parses_whole_units_only() {
        assert_eq!(Money::from_units_str("100"), Some(Money(100)));
        assert_eq!(Money::from_units_str(" -25 "), Some(Money(-25)));
        assert_eq!(Money::from_units_str("100.00"), Some(Money(100)));
        assert_eq!(Money::from_units_str("100.5"), None);
        assert_eq!(Money::from_units_str("1.0.0"), None);
        assert_eq!(Money::from_units_str(""), None);
        assert_eq!(Money::from_units_str("-"), None);
    }

    #[test]
    fn checked_arithmetic_reports_overflow() {
        assert_eq!(Money(i64::MAX).checked_add(Money(1)), None);
        assert_eq!(Money(i64::MIN).checked_sub(Money(1)), None);
        assert_eq!(Money(100).checked_mul(2), Some(Money(200)));
    }
}
