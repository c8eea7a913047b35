//! Account balance tracking.

use chrono::{DateTime, Utc};
use ledgercore_common::AccountId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::history::BalanceHistoryEntry;

/// Current balance of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Current amount, never negative.
    pub amount: Decimal,
    /// When this balance was last updated.
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Create a new zero balance.
    pub fn zero(account_id: AccountId, at: DateTime<Utc>) -> Self {
        Self {
            account_id,
            amount: Decimal::ZERO,
            updated_at: at,
        }
    }

    /// Check if account has sufficient funds for a debit of `amount`.
    pub fn has_sufficient_funds(&self, amount: Decimal) -> bool {
        self.amount >= amount
    }
}

/// Outcome of applying one signed delta to a balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceMutation {
    pub account_id: AccountId,
    pub previous: Decimal,
    pub current: Decimal,
    pub delta: Decimal,
    /// History row written for the change; `None` when a best-effort append failed.
    pub history: Option<BalanceHistoryEntry>,
}
