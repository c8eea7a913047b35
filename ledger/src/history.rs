//! Append-only balance history and reconciliation.

use chrono::{DateTime, Utc};
use ledgercore_common::{AccountId, HistoryId, TransactionId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single persisted balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceHistoryEntry {
    /// Unique entry ID.
    pub id: HistoryId,
    /// Account affected.
    pub account_id: AccountId,
    /// Balance after this change.
    pub resulting_balance: Decimal,
    /// Signed change applied.
    pub change_amount: Decimal,
    /// Transaction that caused the change, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    /// When this entry was created.
    pub created_at: DateTime<Utc>,
}

/// A history entry before the store has assigned its id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewHistoryEntry {
    pub account_id: AccountId,
    pub resulting_balance: Decimal,
    pub change_amount: Decimal,
    pub transaction_id: Option<TransactionId>,
}

/// Balance implied by a sequence of history entries.
pub fn derive_balance<'a>(entries: impl IntoIterator<Item = &'a BalanceHistoryEntry>) -> Decimal {
    entries.into_iter().map(|e| e.change_amount).sum()
}

/// Offset pagination over newest-first listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Clamp the limit into `1..=max_limit`.
    pub fn clamped(self, max_limit: u32) -> Self {
        Self {
            limit: self.limit.clamp(1, max_limit.max(1)),
            offset: self.offset,
        }
    }
}

/// Result of comparing a stored balance with the sum of its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub account_id: AccountId,
    /// Balance row value.
    pub stored: Decimal,
    /// Sum of history change amounts.
    pub derived: Decimal,
    pub checked_at: DateTime<Utc>,
}

impl Reconciliation {
    /// Stored minus derived.
    pub fn drift(&self) -> Decimal {
        self.stored - self.derived
    }

    pub fn is_consistent(&self) -> bool {
        self.drift().is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry(id: i64, resulting: Decimal, change: Decimal) -> BalanceHistoryEntry {
        BalanceHistoryEntry {
            id: HistoryId::from_raw(id),
            account_id: AccountId::new(1).unwrap(),
            resulting_balance: resulting,
            change_amount: change,
            transaction_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_derive_balance() {
        let entries = vec![
            entry(1, dec!(100), dec!(100)),
            entry(2, dec!(60), dec!(-40)),
            entry(3, dec!(75.5), dec!(15.5)),
        ];
        assert_eq!(derive_balance(&entries), dec!(75.5));
        assert_eq!(derive_balance(&Vec::<BalanceHistoryEntry>::new()), Decimal::ZERO);
    }

    #[test]
    fn test_reconciliation_drift() {
        let report = Reconciliation {
            account_id: AccountId::new(1).unwrap(),
            stored: dec!(150),
            derived: dec!(100),
            checked_at: Utc::now(),
        };
        assert_eq!(report.drift(), dec!(50));
        assert!(!report.is_consistent());
    }

    #[test]
    fn test_page_clamp() {
        assert_eq!(Page::new(0, 3).clamped(100), Page::new(1, 3));
        assert_eq!(Page::new(1000, 0).clamped(100), Page::new(100, 0));
        assert_eq!(Page::new(20, 40).clamped(100), Page::new(20, 40));
    }
}
