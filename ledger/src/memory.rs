//! In-process transactional store.
//!
//! Committed rows live behind a single `RwLock`. A unit of work takes an
//! exclusive async lock per row it touches, stages its writes privately and
//! merges them into the committed tables in one step on commit, so readers
//! never observe a partial unit. Row locks nobody else waits on are dropped
//! from the lock table when the unit ends.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use ledgercore_common::{
    AccountId, Clock, HistoryId, LedgerError, NewTransaction, Result, SystemClock, TransactionId,
    TransactionRecord, TransactionStatus,
};

use crate::balance::AccountBalance;
use crate::history::{derive_balance, BalanceHistoryEntry, NewHistoryEntry, Page};
use crate::store::{LedgerStore, UnitOfWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum RowKey {
    Balance(AccountId),
    Transaction(TransactionId),
}

#[derive(Debug, Default)]
struct Tables {
    balances: BTreeMap<AccountId, AccountBalance>,
    history: Vec<BalanceHistoryEntry>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
    last_history_id: i64,
    last_transaction_id: i64,
}

struct Inner {
    tables: RwLock<Tables>,
    row_locks: DashMap<RowKey, Arc<Mutex<()>>>,
    clock: Arc<dyn Clock>,
    fail_history: AtomicBool,
}

/// Ledger store held entirely in memory.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create an empty store stamped by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store stamped by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: RwLock::new(Tables::default()),
                row_locks: DashMap::new(),
                clock,
                fail_history: AtomicBool::new(false),
            }),
        }
    }

    /// Make every subsequent history append fail until switched off.
    pub fn fail_history_appends(&self, fail: bool) {
        self.inner.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Number of committed history rows across all accounts.
    pub fn history_len(&self) -> usize {
        self.inner.tables.read().history.len()
    }

    /// Number of committed transaction records.
    pub fn transaction_count(&self) -> usize {
        self.inner.tables.read().transactions.len()
    }

    /// Number of row locks currently tracked.
    pub fn row_lock_count(&self) -> usize {
        self.inner.row_locks.len()
    }
}

impl Tables {
    fn history_sum(&self, account_id: AccountId) -> Decimal {
        derive_balance(self.history.iter().filter(|e| e.account_id == account_id))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn newest_first<T>(items: &mut [T], key: impl Fn(&T) -> (DateTime<Utc>, i64)) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnit {
            inner: self.inner.clone(),
            held: HashMap::new(),
            balances: BTreeMap::new(),
            history: Vec::new(),
            transactions: BTreeMap::new(),
        }))
    }

    async fn get_or_create_balance(&self, account_id: AccountId) -> Result<AccountBalance> {
        if let Some(balance) = self.inner.tables.read().balances.get(&account_id) {
            return Ok(balance.clone());
        }

        let now = self.inner.clock.now();
        let mut tables = self.inner.tables.write();
        let balance = tables
            .balances
            .entry(account_id)
            .or_insert_with(|| AccountBalance::zero(account_id, now));
        Ok(balance.clone())
    }

    async fn history(&self, account_id: AccountId, page: Page) -> Result<Vec<BalanceHistoryEntry>> {
        let mut entries: Vec<BalanceHistoryEntry> = self
            .inner
            .tables
            .read()
            .history
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect();
        newest_first(&mut entries, |e| (e.created_at, e.id.get()));
        Ok(paginate(entries, page))
    }

    async fn history_at(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Option<BalanceHistoryEntry>> {
        Ok(self
            .inner
            .tables
            .read()
            .history
            .iter()
            .filter(|e| e.account_id == account_id && e.created_at <= at)
            .max_by_key(|e| (e.created_at, e.id))
            .cloned())
    }

    async fn history_sum(&self, account_id: AccountId) -> Result<Decimal> {
        Ok(self.inner.tables.read().history_sum(account_id))
    }

    async fn balance_with_history_sum(&self, account_id: AccountId) -> Result<(Decimal, Decimal)> {
        let tables = self.inner.tables.read();
        let stored = tables
            .balances
            .get(&account_id)
            .map_or(Decimal::ZERO, |b| b.amount);
        Ok((stored, tables.history_sum(account_id)))
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        Ok(self.inner.tables.read().transactions.get(&id).cloned())
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<TransactionRecord>> {
        let mut records: Vec<TransactionRecord> = self
            .inner
            .tables
            .read()
            .transactions
            .values()
            .filter(|t| {
                t.source_account == Some(account_id) || t.dest_account == Some(account_id)
            })
            .cloned()
            .collect();
        newest_first(&mut records, |t| (t.created_at, t.id.get()));
        Ok(paginate(records, page))
    }

    async fn account_ids(&self) -> Result<Vec<AccountId>> {
        Ok(self.inner.tables.read().balances.keys().copied().collect())
    }
}

/// A unit of work against a [`MemoryStore`].
struct MemoryUnit {
    inner: Arc<Inner>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    balances: BTreeMap<AccountId, AccountBalance>,
    history: Vec<BalanceHistoryEntry>,
    transactions: BTreeMap<TransactionId, TransactionRecord>,
}

impl MemoryUnit {
    async fn acquire(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = self.inner.row_locks.entry(key).or_default().clone();
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    fn ensure_held(&self, key: RowKey) -> Result<()> {
        if self.held.contains_key(&key) {
            Ok(())
        } else {
            Err(LedgerError::storage(format!("{key:?} written without holding its lock")))
        }
    }

    fn current_transaction(&self, id: TransactionId) -> Option<TransactionRecord> {
        self.transactions
            .get(&id)
            .cloned()
            .or_else(|| self.inner.tables.read().transactions.get(&id).cloned())
    }
}

impl Drop for MemoryUnit {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain() {
            drop(guard);
            // Waiters hold their own clone, so a count of one means nobody
            // else needs this lock.
            self.inner
                .row_locks
                .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn lock_balance(&mut self, account_id: AccountId) -> Result<AccountBalance> {
        self.acquire(RowKey::Balance(account_id)).await;

        if let Some(balance) = self.balances.get(&account_id) {
            return Ok(balance.clone());
        }

        let committed = self.inner.tables.read().balances.get(&account_id).cloned();
        let balance =
            committed.unwrap_or_else(|| AccountBalance::zero(account_id, self.inner.clock.now()));
        self.balances.insert(account_id, balance.clone());
        Ok(balance)
    }

    async fn write_balance(
        &mut self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<AccountBalance> {
        self.ensure_held(RowKey::Balance(account_id))?;
        if amount < Decimal::ZERO {
            return Err(LedgerError::storage(format!(
                "balance of account {account_id} would be negative: {amount}"
            )));
        }

        let balance = AccountBalance {
            account_id,
            amount,
            updated_at: self.inner.clock.now(),
        };
        self.balances.insert(account_id, balance.clone());
        Ok(balance)
    }

    async fn append_history(&mut self, entry: NewHistoryEntry) -> Result<BalanceHistoryEntry> {
        if self.inner.fail_history.load(Ordering::SeqCst) {
            return Err(LedgerError::storage("history append rejected by store"));
        }

        let id = {
            let mut tables = self.inner.tables.write();
            tables.last_history_id += 1;
            tables.last_history_id
        };

        let entry = BalanceHistoryEntry {
            id: HistoryId::from_raw(id),
            account_id: entry.account_id,
            resulting_balance: entry.resulting_balance,
            change_amount: entry.change_amount,
            transaction_id: entry.transaction_id,
            created_at: self.inner.clock.now(),
        };
        self.history.push(entry.clone());
        Ok(entry)
    }

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
        status: TransactionStatus,
    ) -> Result<TransactionRecord> {
        let id = {
            let mut tables = self.inner.tables.write();
            tables.last_transaction_id += 1;
            TransactionId::from_raw(tables.last_transaction_id)
        };
        self.acquire(RowKey::Transaction(id)).await;

        let record = TransactionRecord::from_new(id, new, status, self.inner.clock.now());
        self.transactions.insert(id, record.clone());
        Ok(record)
    }

    async fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        self.acquire(RowKey::Transaction(id)).await;
        Ok(self.current_transaction(id))
    }

    async fn update_transaction_status(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<()> {
        self.ensure_held(RowKey::Transaction(id))?;
        let mut record = self
            .current_transaction(id)
            .ok_or(LedgerError::TransactionNotFound(id))?;
        record.status = status;
        self.transactions.insert(id, record);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut tables = self.inner.tables.write();
        tables.balances.append(&mut self.balances);
        tables.history.append(&mut self.history);
        tables.transactions.append(&mut self.transactions);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
