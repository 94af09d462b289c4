//! Decimal currency amounts and atomic-unit conversion.
//!
//! Amounts travel over the wire as decimal strings (`"0.50"`) and are turned
//! into integer atomic units (lamports, token base units) with
//! [`rust_decimal`] arithmetic, never floating point. Two precisions are in
//! play: 9 decimals for SOL and 6 for USDC.

use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// A non-negative decimal currency amount.
///
/// Parsing rejects anything that is not a plain decimal number, including
/// signs, exponents, and empty strings, so callers can't smuggle `NaN`-shaped
/// input into policy or verification math.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(Decimal);

static MAX_AMOUNT: Lazy<Decimal> =
    Lazy::new(|| Decimal::from_str("999999999").expect("valid decimal"));

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AmountParseError {
    #[error("Invalid decimal amount: {0}")]
    InvalidFormat(String),
    #[error("Negative amount is not allowed")]
    Negative,
    #[error("Amount out of range")]
    OutOfRange,
    #[error("Amount does not fit in atomic units")]
    AtomicOverflow,
}

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    /// Parses a plain decimal string like `"0.001"` or `"100.50"`.
    pub fn parse(input: &str) -> Result<Self, AmountParseError> {
        let s = input.trim();
        let valid_shape = !s.is_empty()
            && s.chars().all(|c| c.is_ascii_digit() || c == '.')
            && s.chars().filter(|c| *c == '.').count() <= 1
            && !s.starts_with('.')
            && !s.ends_with('.');
        if !valid_shape {
            return Err(AmountParseError::InvalidFormat(input.to_string()));
        }
        let parsed =
            Decimal::from_str(s).map_err(|_| AmountParseError::InvalidFormat(input.to_string()))?;
        if parsed.is_sign_negative() {
            return Err(AmountParseError::Negative);
        }
        if parsed > *MAX_AMOUNT {
            return Err(AmountParseError::OutOfRange);
        }
        Ok(Amount(parsed))
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    /// Converts to integer atomic units at the given precision.
    ///
    /// Fractional digits beyond `decimals` are truncated toward zero; missing
    /// digits are implicit zero padding. `Amount::parse("0.50")` at 6 decimals
    /// yields `500_000`; `"1"` at 9 decimals yields `1_000_000_000`.
    pub fn atomic_units(&self, decimals: u32) -> Result<u64, AmountParseError> {
        let truncated = self
            .0
            .round_dp_with_strategy(decimals, rust_decimal::RoundingStrategy::ToZero);
        let mantissa = truncated.mantissa().unsigned_abs();
        let scale_diff = decimals - truncated.scale().min(decimals);
        let multiplier = 10u128
            .checked_pow(scale_diff)
            .ok_or(AmountParseError::AtomicOverflow)?;
        let value = mantissa
            .checked_mul(multiplier)
            .ok_or(AmountParseError::AtomicOverflow)?;
        u64::try_from(value).map_err(|_| AmountParseError::AtomicOverflow)
    }
}

impl From<Decimal> for Amount {
    fn from(value: Decimal) -> Self {
        Amount(value)
    }
}

impl FromStr for Amount {
    type Err = AmountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::parse(s)
    }
}

// Keeps the scale the amount was written with: an intent issued as "0.10"
// reads back as "0.10", not "0.1", on the wire and in wallet calls.
impl Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_units_round_trip() {
        assert_eq!(Amount::parse("0.50").unwrap().atomic_units(6).unwrap(), 500_000);
        assert_eq!(
            Amount::parse("1").unwrap().atomic_units(9).unwrap(),
            1_000_000_000
        );
        assert_eq!(Amount::parse("0.000001").unwrap().atomic_units(6).unwrap(), 1);
        assert_eq!(Amount::parse("0").unwrap().atomic_units(9).unwrap(), 0);
    }

    #[test]
    fn test_atomic_units_truncates_excess_precision() {
        // 7th fractional digit is dropped, not rounded up.
        assert_eq!(
            Amount::parse("0.1234567").unwrap().atomic_units(6).unwrap(),
            123_456
        );
    }

    #[test]
    fn test_non_numeric_input_fails() {
        for bad in ["", "abc", "1.2.3", "-1", "1e9", " 1 0", ".5", "5.", "0x10"] {
            assert!(Amount::parse(bad).is_err(), "expected failure for {bad:?}");
        }
    }

    #[test]
    fn test_large_amount_within_u64() {
        let amount = Amount::parse("999999999").unwrap();
        assert_eq!(amount.atomic_units(9).unwrap(), 999_999_999_000_000_000);
    }

    #[test]
    fn test_display_preserves_scale() {
        assert_eq!(Amount::parse("0.10").unwrap().to_string(), "0.10");
        assert_eq!(Amount::parse("1").unwrap().to_string(), "1");
        assert_eq!(Amount::parse("0.100").unwrap().to_string(), "0.100");
    }

    #[test]
    fn test_serde_as_string() {
        let amount: Amount = serde_json::from_str("\"0.25\"").unwrap();
        assert_eq!(serde_json::to_string(&amount).unwrap(), "\"0.25\"");
    }
}
