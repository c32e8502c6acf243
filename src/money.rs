use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MoneyError {
    #[error("Amount must not be negative, got {0}")]
    Negative(Decimal),
    #[error("Amount `{0}` is not a decimal number")]
    Malformed(String),
}

/// Non-negative decimal quantity.
///
/// Arithmetic never clamps: [`Money::checked_sub`] returns `None` when the
/// result would drop below zero and leaves the decision to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(MoneyError::Negative(amount));
        }
        Ok(Self(amount.normalize()))
    }

    pub fn amount(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// `None` on decimal overflow.
    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(|sum| Money(sum.normalize()))
    }

    /// `None` when `other` exceeds `self`.
    pub fn checked_sub(self, other: Money) -> Option<Money> {
        if other.0 > self.0 {
            return None;
        }
        self.0.checked_sub(other.0).map(|diff| Money(diff.normalize()))
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Money::new(value)
    }
}

impl From<Money> for Decimal {
    fn from(value: Money) -> Self {
        value.0
    }
}

impl From<u32> for Money {
    fn from(value: u32) -> Self {
        Money(Decimal::from(value))
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let amount =
            Decimal::from_str(s.trim()).map_err(|_| MoneyError::Malformed(s.to_owned()))?;
        Money::new(amount)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// Amounts travel as JSON numbers, both on the queue and in the ledger.
impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        rust_decimal::serde::float::serialize(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let amount = rust_decimal::serde::float::deserialize(deserializer)?;
        Money::new(amount).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_amounts() {
        assert_eq!(
            Money::new(Decimal::new(-1, 2)).unwrap_err(),
            MoneyError::Negative(Decimal::new(-1, 2))
        );
        assert!(Money::new(Decimal::ZERO).unwrap().is_zero());
        assert!("-3".parse::<Money>().is_err());
        assert!(matches!("abc".parse::<Money>(), Err(MoneyError::Malformed(_))));
    }

    #[test]
    fn subtraction_never_goes_below_zero() {
        let ten = Money::from(10);
        let four = Money::from(4);
        assert_eq!(ten.checked_sub(four), Some(Money::from(6)));
        assert_eq!(ten.checked_sub(ten), Some(Money::ZERO));
        assert_eq!(four.checked_sub(ten), None);
    }

    #[test]
    fn addition_reports_overflow() {
        let max = Money::new(Decimal::MAX).unwrap();
        assert_eq!(max.checked_add(Money::from(1)), None);
        assert_eq!(
            Money::from(1).checked_add("0.5".parse().unwrap()),
            Some("1.5".parse().unwrap())
        );
    }

    #[test]
    fn equal_values_compare_equal_regardless_of_scale() {
        let a: Money = "150.00".parse().unwrap();
        let b = Money::from(150);
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "150");
    }

    #[test]
    fn serializes_as_json_number() {
        let money: Money = "12.5".parse().unwrap();
        assert_eq!(serde_json::to_string(&money).unwrap(), "12.5");
        let parsed: Money = serde_json::from_str("12.5").unwrap();
        assert_eq!(parsed, money);
        assert!(serde_json::from_str::<Money>("-1").is_err());
    }
}
