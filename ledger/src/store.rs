//! Storage abstraction for the ledger.
//!
//! A [`LedgerStore`] persists three tables: balances, balance history and
//! transaction records. Every mutation happens inside a [`UnitOfWork`], which
//! commits or discards all of its effects together and holds exclusive row
//! locks until it ends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ledgercore_common::{
    AccountId, NewTransaction, Result, TransactionId, TransactionRecord, TransactionStatus,
};
use rust_decimal::Decimal;

use crate::balance::AccountBalance;
use crate::history::{BalanceHistoryEntry, NewHistoryEntry, Page};

/// A transactional store of balances, history and transaction records.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Open an atomic unit of work.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;

    /// Read a balance, creating it at zero if absent.
    async fn get_or_create_balance(&self, account_id: AccountId) -> Result<AccountBalance>;

    /// History for an account, newest first.
    async fn history(&self, account_id: AccountId, page: Page) -> Result<Vec<BalanceHistoryEntry>>;

    /// Latest history entry created at or before `at`.
    async fn history_at(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Option<BalanceHistoryEntry>>;

    /// Sum of all change amounts recorded for an account.
    async fn history_sum(&self, account_id: AccountId) -> Result<Decimal>;

    /// Stored balance and history sum for an account, read from one
    /// committed snapshot. A missing balance row reads as zero and is not
    /// created.
    async fn balance_with_history_sum(&self, account_id: AccountId) -> Result<(Decimal, Decimal)>;

    /// Fetch a transaction record.
    async fn transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>>;

    /// Transactions where the account is source or destination, newest first.
    async fn transactions_for_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<TransactionRecord>>;

    /// Every account that has a balance row, ascending.
    async fn account_ids(&self) -> Result<Vec<AccountId>>;
}

/// An open atomic unit of work.
///
/// Dropping a unit without calling [`UnitOfWork::commit`] discards all of its
/// effects and releases its locks.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Lock the balance row exclusively until the unit ends, creating it at
    /// zero if absent. Locking a row the unit already holds is a no-op.
    async fn lock_balance(&mut self, account_id: AccountId) -> Result<AccountBalance>;

    /// Persist a new amount for a row locked by this unit.
    async fn write_balance(&mut self, account_id: AccountId, amount: Decimal)
        -> Result<AccountBalance>;

    /// Append a history row. A failure leaves the unit usable.
    async fn append_history(&mut self, entry: NewHistoryEntry) -> Result<BalanceHistoryEntry>;

    /// Insert a transaction record.
    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
        status: TransactionStatus,
    ) -> Result<TransactionRecord>;

    /// Lock a transaction record exclusively until the unit ends.
    async fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<TransactionRecord>>;

    /// Set the status of a transaction record.
    async fn update_transaction_status(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<()>;

    /// Make every effect of the unit durable and visible.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard every effect of the unit.
    async fn rollback(self: Box<Self>) -> Result<()>;
}
