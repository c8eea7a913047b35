//! Transaction records and their status state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LedgerError, Result};
use crate::{AccountId, Amount, TransactionId};

/// Kind of balance movement a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Funds added to a destination account.
    Credit,
    /// Funds removed from a source account.
    Debit,
    /// Funds moved from a source to a destination account.
    Transfer,
}

impl TransactionType {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
            TransactionType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "credit" => Ok(TransactionType::Credit),
            "debit" => Ok(TransactionType::Debit),
            "transfer" => Ok(TransactionType::Transfer),
            other => Err(LedgerError::storage(format!(
                "unknown transaction type {other:?}"
            ))),
        }
    }
}

/// Transaction status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Record created, balances not yet mutated.
    Pending,
    /// Balances mutated and committed.
    Completed,
    /// Compensated by a reversing mutation.
    RolledBack,
}

impl TransactionStatus {
    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, TransactionStatus::RolledBack)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => &[TransactionStatus::Completed],
            TransactionStatus::Completed => &[TransactionStatus::RolledBack],
            TransactionStatus::RolledBack => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "completed" => Ok(TransactionStatus::Completed),
            "rolled_back" => Ok(TransactionStatus::RolledBack),
            other => Err(LedgerError::storage(format!(
                "unknown transaction status {other:?}"
            ))),
        }
    }
}

/// A transaction before the store has assigned it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub source_account: Option<AccountId>,
    pub dest_account: Option<AccountId>,
    pub amount: Amount,
    pub tx_type: TransactionType,
}

impl NewTransaction {
    /// A credit into `dest`.
    pub fn credit(dest: AccountId, amount: Amount) -> Self {
        Self {
            source_account: None,
            dest_account: Some(dest),
            amount,
            tx_type: TransactionType::Credit,
        }
    }

    /// A debit from `source`.
    pub fn debit(source: AccountId, amount: Amount) -> Self {
        Self {
            source_account: Some(source),
            dest_account: None,
            amount,
            tx_type: TransactionType::Debit,
        }
    }

    /// A transfer from `source` to `dest`. The accounts must differ.
    pub fn transfer(source: AccountId, dest: AccountId, amount: Amount) -> Result<Self> {
        if source == dest {
            return Err(LedgerError::validation_field(
                "cannot transfer to the same account",
                "dest_account",
            ));
        }
        Ok(Self {
            source_account: Some(source),
            dest_account: Some(dest),
            amount,
            tx_type: TransactionType::Transfer,
        })
    }
}

/// A persisted transaction record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_account: Option<AccountId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_account: Option<AccountId>,
    pub amount: Amount,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl TransactionRecord {
    /// Build a record from a new transaction and its store-assigned fields.
    pub fn from_new(
        id: TransactionId,
        new: NewTransaction,
        status: TransactionStatus,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            source_account: new.source_account,
            dest_account: new.dest_account,
            amount: new.amount,
            tx_type: new.tx_type,
            status,
            created_at,
        }
    }

    /// Transition to a new status.
    pub fn transition_to(&mut self, next: TransactionStatus) -> std::result::Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Accounts whose balances this transaction touches, ascending and deduplicated.
    pub fn involved_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .source_account
            .into_iter()
            .chain(self.dest_account)
            .collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }

    /// Signed deltas that reverse this transaction's effect on balances.
    ///
    /// Fails if the record is missing an account its type requires.
    pub fn compensating_deltas(&self) -> Result<Vec<(AccountId, Decimal)>> {
        let missing = |field: &str| {
            LedgerError::storage(format!(
                "{} transaction {} has no {field}",
                self.tx_type, self.id
            ))
        };

        match self.tx_type {
            TransactionType::Credit => {
                let dest = self.dest_account.ok_or_else(|| missing("dest_account"))?;
                Ok(vec![(dest, self.amount.debit_delta())])
            }
            TransactionType::Debit => {
                let source = self.source_account.ok_or_else(|| missing("source_account"))?;
                Ok(vec![(source, self.amount.credit_delta())])
            }
            TransactionType::Transfer => {
                let source = self.source_account.ok_or_else(|| missing("source_account"))?;
                let dest = self.dest_account.ok_or_else(|| missing("dest_account"))?;
                Ok(vec![
                    (source, self.amount.credit_delta()),
                    (dest, self.amount.debit_delta()),
                ])
            }
        }
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid state transition from {:?} to {:?}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}
