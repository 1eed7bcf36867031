//! Monetary types for the ledger.
//!
//! Every amount in the system is a `rust_decimal::Decimal` with at most
//! [`AMOUNT_SCALE`] fractional digits. Floating point never enters the ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of fractional digits an amount may carry (minor units).
pub const AMOUNT_SCALE: u32 = 2;

/// Largest amount or balance the ledger stores: 999999999999999999.99,
/// the range of a `NUMERIC(20,2)` column.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(1_661_992_959, 1_808_227_885, 5, false, 2);

/// Reasons an amount is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmountError {
    /// Amount is zero or negative.
    #[error("amount must be positive, got {0}")]
    NotPositive(Decimal),

    /// Amount has more fractional digits than the ledger tracks.
    #[error("amount {value} has {scale} decimal places, at most {max} allowed")]
    TooPrecise { value: Decimal, scale: u32, max: u32 },

    /// Amount is above [`MAX_AMOUNT`].
    #[error("amount {value} exceeds the maximum of {max}")]
    TooLarge { value: Decimal, max: Decimal },

    /// A balance or total would leave the representable range.
    #[error("{0} would overflow the ledger range")]
    Overflow(String),

    /// Amount could not be parsed.
    #[error("malformed amount: {0}")]
    Malformed(String),
}

/// A strictly positive amount of money with at most two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Validate and wrap a decimal value.
    pub fn new(value: Decimal) -> Result<Self, AmountError> {
        if value <= Decimal::ZERO {
            return Err(AmountError::NotPositive(value));
        }

        // 10.50 and 10.5 are the same amount; only significant digits count.
        let scale = value.normalize().scale();
        if scale > AMOUNT_SCALE {
            return Err(AmountError::TooPrecise {
                value,
                scale,
                max: AMOUNT_SCALE,
            });
        }

        if value > MAX_AMOUNT {
            return Err(AmountError::TooLarge {
                value,
                max: MAX_AMOUNT,
            });
        }

        Ok(Self(value.round_dp(AMOUNT_SCALE)))
    }

    /// Build from an integer number of minor units (cents).
    pub fn from_minor_units(units: i64) -> Result<Self, AmountError> {
        Self::new(Decimal::new(units, AMOUNT_SCALE))
    }

    /// Get the decimal value.
    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value =
            Decimal::from_str_exact(s.trim()).map_err(|e| AmountError::Malformed(e.to_string()))?;
        Self::new(value)
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AmountError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// `balance + delta`, failing when the sum passes [`MAX_AMOUNT`] or leaves
/// the range of `Decimal`.
pub fn checked_balance(balance: Decimal, delta: Decimal) -> Result<Decimal, AmountError> {
    balance
        .checked_add(delta)
        .filter(|next| *next <= MAX_AMOUNT)
        .ok_or_else(|| AmountError::Overflow(format!("{balance} + {delta}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_validation() {
        assert!(Amount::new(dec!(100.00)).is_ok());
        assert!(Amount::new(dec!(0.01)).is_ok());
        assert_eq!(
            Amount::new(Decimal::ZERO),
            Err(AmountError::NotPositive(Decimal::ZERO))
        );
        assert!(matches!(
            Amount::new(dec!(-5)),
            Err(AmountError::NotPositive(_))
        ));
    }

    #[test]
    fn test_amount_precision() {
        assert!(matches!(
            Amount::new(dec!(1.001)),
            Err(AmountError::TooPrecise { scale: 3, .. })
        ));
        // Trailing zeros are not precision.
        assert!(Amount::new(dec!(1.1000)).is_ok());
    }

    #[test]
    fn test_amount_upper_bound() {
        assert_eq!(MAX_AMOUNT, dec!(999999999999999999.99));
        assert!(Amount::new(MAX_AMOUNT).is_ok());
        assert!(matches!(
            Amount::new(Decimal::MAX),
            Err(AmountError::TooLarge { .. })
        ));
        assert!(matches!(
            Amount::new(dec!(1000000000000000000)),
            Err(AmountError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_checked_balance() {
        assert_eq!(checked_balance(dec!(10), dec!(-4)), Ok(dec!(6)));
        assert_eq!(checked_balance(MAX_AMOUNT - dec!(1), dec!(1)), Ok(MAX_AMOUNT));
        assert!(matches!(
            checked_balance(MAX_AMOUNT, dec!(0.01)),
            Err(AmountError::Overflow(_))
        ));
        assert!(matches!(
            checked_balance(Decimal::MAX, Decimal::MAX),
            Err(AmountError::Overflow(_))
        ));
    }

    #[test]
    fn test_amount_parse_and_display() {
        let amount: Amount = "40".parse().unwrap();
        assert_eq!(amount.value(), dec!(40));
        assert_eq!(amount.to_string(), "40.00");
        assert!("forty".parse::<Amount>().is_err());
    }

    #[test]
    fn test_minor_units() {
        let amount = Amount::from_minor_units(12_345).unwrap();
        assert_eq!(amount.value(), dec!(123.45));
        assert!(Amount::from_minor_units(0).is_err());
    }
}
