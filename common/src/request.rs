//! Requests accepted by the transaction orchestrator.
//!
//! Transport, authentication and authorization live outside the ledger core;
//! requests arrive here already authorized, carrying raw values that are
//! validated into typed ids and amounts before any unit of work is opened.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{LedgerError, Result};
use crate::{AccountId, Amount, TransactionId};

/// Role of the caller as established by the authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    Merchant,
}

/// Trusted caller identity. Recorded for tracing only; never re-verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub id: String,
    pub role: Role,
}

impl Caller {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    /// Caller used by internal jobs such as reconciliation.
    pub fn system() -> Self {
        Self::new("system", Role::Admin)
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.id, self.role)
    }
}

/// Add funds to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditRequest {
    pub account_id: i64,
    pub amount: Decimal,
}

impl CreditRequest {
    pub fn new(account_id: i64, amount: Decimal) -> Self {
        Self { account_id, amount }
    }

    pub fn validate(&self) -> Result<(AccountId, Amount)> {
        Ok((AccountId::new(self.account_id)?, Amount::new(self.amount)?))
    }
}

/// Remove funds from an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitRequest {
    pub account_id: i64,
    pub amount: Decimal,
}

impl DebitRequest {
    pub fn new(account_id: i64, amount: Decimal) -> Self {
        Self { account_id, amount }
    }

    pub fn validate(&self) -> Result<(AccountId, Amount)> {
        Ok((AccountId::new(self.account_id)?, Amount::new(self.amount)?))
    }
}

/// Move funds between two distinct accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account: i64,
    pub dest_account: i64,
    pub amount: Decimal,
}

/// Validated transfer parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidTransfer {
    pub source: AccountId,
    pub dest: AccountId,
    pub amount: Amount,
}

impl TransferRequest {
    pub fn new(source_account: i64, dest_account: i64, amount: Decimal) -> Self {
        Self {
            source_account,
            dest_account,
            amount,
        }
    }

    pub fn validate(&self) -> Result<ValidTransfer> {
        let source = AccountId::new(self.source_account)?;
        let dest = AccountId::new(self.dest_account)?;
        if source == dest {
            return Err(LedgerError::validation_field(
                "cannot transfer to the same account",
                "dest_account",
            ));
        }
        Ok(ValidTransfer {
            source,
            dest,
            amount: Amount::new(self.amount)?,
        })
    }
}

/// Any operation the orchestrator executes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    Credit(CreditRequest),
    Debit(DebitRequest),
    Transfer(TransferRequest),
    Rollback { transaction_id: TransactionId },
}

impl Operation {
    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Credit(_) => "credit",
            Operation::Debit(_) => "debit",
            Operation::Transfer(_) => "transfer",
            Operation::Rollback { .. } => "rollback",
        }
    }
}
