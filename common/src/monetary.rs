//! Monetary types for the ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, Result};

/// Maximum number of fractional digits an amount may carry.
///
/// Matches the persisted `NUMERIC(20,2)` columns; finer amounts are rejected
/// instead of being rounded by the store.
pub const AMOUNT_SCALE: u32 = 2;

/// Exclusive upper bound for amounts and balances: 10^18, the first value a
/// `NUMERIC(20,2)` column cannot hold.
pub const AMOUNT_LIMIT: Decimal = Decimal::from_parts(0xA764_0000, 0x0DE0_B6B3, 0, false, 0);

/// A strictly positive monetary amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    /// Create an amount, rejecting zero, negative, oversized and over-precise
    /// values.
    pub fn new(value: Decimal) -> Result<Self> {
        if value <= Decimal::ZERO {
            return Err(LedgerError::validation_field(
                format!("amount must be greater than zero, got {value}"),
                "amount",
            ));
        }

        if value >= AMOUNT_LIMIT {
            return Err(LedgerError::validation_field(
                format!("amount {value} must be below {AMOUNT_LIMIT}"),
                "amount",
            ));
        }

        let value = value.normalize();
        if value.scale() > AMOUNT_SCALE {
            return Err(LedgerError::validation_field(
                format!("amount {value} has more than {AMOUNT_SCALE} decimal places"),
                "amount",
            ));
        }

        Ok(Self(value))
    }

    /// Parse an amount from a string such as `"125.50"`.
    pub fn parse(value: &str) -> Result<Self> {
        let value: Decimal = value.trim().parse().map_err(|e| {
            LedgerError::validation_field(format!("invalid amount {value:?}: {e}"), "amount")
        })?;
        Self::new(value)
    }

    /// Get the underlying value.
    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Signed delta that adds this amount to a balance.
    pub fn credit_delta(&self) -> Decimal {
        self.0
    }

    /// Signed delta that removes this amount from a balance.
    pub fn debit_delta(&self) -> Decimal {
        -self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
