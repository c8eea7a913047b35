//! Error types for ledger operations.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::{AccountId, TransactionId, TransactionStatus};

/// Main error type for ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Request rejected before any unit of work was opened.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// The resulting balance would be negative.
    #[error("Insufficient funds in account {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        required: Decimal,
        available: Decimal,
    },

    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Invalid status transition.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Rollback requested for a transaction that was already compensated.
    #[error("Transaction {0} already rolled back")]
    AlreadyRolledBack(TransactionId),

    /// Underlying persistence failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The service is not accepting requests in its current state.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl LedgerError {
    /// Create a validation error without a field.
    pub fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation {
            message: message.into(),
            field: None,
        }
    }

    /// Create a validation error naming the offending field.
    pub fn validation_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        LedgerError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        LedgerError::Storage(message.into())
    }

    /// Whether the error was caused by the request rather than the system.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            LedgerError::Storage(_)
                | LedgerError::Configuration(_)
                | LedgerError::ServiceUnavailable(_)
        )
    }

    /// Get error code for external transports.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Validation { .. } => "VALIDATION_ERROR",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::AlreadyRolledBack(_) => "ALREADY_ROLLED_BACK",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
        }
    }
}

impl From<crate::transaction::InvalidTransition> for LedgerError {
    fn from(err: crate::transaction::InvalidTransition) -> Self {
        LedgerError::InvalidTransition {
            from: err.from,
            to: err.to,
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
