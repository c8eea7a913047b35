//! PostgreSQL ledger store.
//!
//! Row locks are `SELECT ... FOR UPDATE` inside a database transaction, so
//! they also serialize writers running in other processes.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::info;

use ledgercore_common::{
    AccountId, Amount, HistoryId, LedgerError, NewTransaction, Result, TransactionId,
    TransactionRecord, TransactionStatus,
};

use crate::balance::AccountBalance;
use crate::history::{BalanceHistoryEntry, NewHistoryEntry, Page};
use crate::store::{LedgerStore, UnitOfWork};

/// Idempotent schema, applied in order by [`PgLedgerStore::migrate`].
pub const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS balances (
        account_id BIGINT PRIMARY KEY CHECK (account_id > 0),
        amount NUMERIC(20,2) NOT NULL DEFAULT 0 CHECK (amount >= 0),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
    )"#,
    r#"CREATE TABLE IF NOT EXISTS transactions (
        id BIGSERIAL PRIMARY KEY,
        source_account BIGINT NULL,
        dest_account BIGINT NULL,
        amount NUMERIC(20,2) NOT NULL CHECK (amount > 0),
        tx_type TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
        CHECK (status IN ('pending', 'completed', 'rolled_back')),
        CHECK (
            (tx_type = 'credit' AND source_account IS NULL AND dest_account IS NOT NULL)
            OR (tx_type = 'debit' AND source_account IS NOT NULL AND dest_account IS NULL)
            OR (tx_type = 'transfer' AND source_account IS NOT NULL
                AND dest_account IS NOT NULL AND source_account <> dest_account)
        )
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_transactions_source ON transactions (source_account, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_transactions_dest ON transactions (dest_account, created_at DESC)",
    r#"CREATE TABLE IF NOT EXISTS balance_history (
        id BIGSERIAL PRIMARY KEY,
        account_id BIGINT NOT NULL,
        resulting_balance NUMERIC(20,2) NOT NULL,
        change_amount NUMERIC(20,2) NOT NULL,
        transaction_id BIGINT NULL REFERENCES transactions (id),
        created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_balance_history_account_time ON balance_history (account_id, created_at DESC, id DESC)",
];

const BALANCE_COLUMNS: &str = "account_id, amount, updated_at";
const HISTORY_COLUMNS: &str =
    "id, account_id, resulting_balance, change_amount, transaction_id, created_at";
const TRANSACTION_COLUMNS: &str =
    "id, source_account, dest_account, amount, tx_type, status, created_at";

fn db_err(err: sqlx::Error) -> LedgerError {
    LedgerError::Storage(err.to_string())
}

fn stored_account(id: i64) -> Result<AccountId> {
    AccountId::new(id).map_err(|_| LedgerError::storage(format!("invalid account id {id} in store")))
}

#[derive(Debug, sqlx::FromRow)]
struct BalanceRow {
    account_id: i64,
    amount: Decimal,
    updated_at: DateTime<Utc>,
}

impl BalanceRow {
    fn into_balance(self) -> Result<AccountBalance> {
        Ok(AccountBalance {
            account_id: stored_account(self.account_id)?,
            amount: self.amount,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    account_id: i64,
    resulting_balance: Decimal,
    change_amount: Decimal,
    transaction_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl HistoryRow {
    fn into_entry(self) -> Result<BalanceHistoryEntry> {
        Ok(BalanceHistoryEntry {
            id: HistoryId::from_raw(self.id),
            account_id: stored_account(self.account_id)?,
            resulting_balance: self.resulting_balance,
            change_amount: self.change_amount,
            transaction_id: self.transaction_id.map(TransactionId::from_raw),
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    source_account: Option<i64>,
    dest_account: Option<i64>,
    amount: Decimal,
    tx_type: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_record(self) -> Result<TransactionRecord> {
        Ok(TransactionRecord {
            id: TransactionId::from_raw(self.id),
            source_account: self.source_account.map(stored_account).transpose()?,
            dest_account: self.dest_account.map(stored_account).transpose()?,
            amount: Amount::new(self.amount).map_err(|e| LedgerError::storage(e.to_string()))?,
            tx_type: self.tx_type.parse()?,
            status: self.status.parse()?,
            created_at: self.created_at,
        })
    }
}

/// Ledger store backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    /// Wrap an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self::new(pool))
    }

    /// Apply the schema.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        info!(statements = SCHEMA.len(), "Ledger schema applied");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgUnit {
            tx,
            locked_balances: HashSet::new(),
        }))
    }

    async fn get_or_create_balance(&self, account_id: AccountId) -> Result<AccountBalance> {
        sqlx::query(
            "INSERT INTO balances (account_id, amount) VALUES ($1, 0) ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(account_id.get())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE account_id = $1"
        ))
        .bind(account_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?
        .into_balance()
    }

    async fn history(&self, account_id: AccountId, page: Page) -> Result<Vec<BalanceHistoryEntry>> {
        sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM balance_history WHERE account_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.get())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(HistoryRow::into_entry)
        .collect()
    }

    async fn history_at(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Option<BalanceHistoryEntry>> {
        sqlx::query_as::<_, HistoryRow>(&format!(
            "SELECT {HISTORY_COLUMNS} FROM balance_history WHERE account_id = $1 AND created_at <= $2 \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(account_id.get())
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(HistoryRow::into_entry)
        .transpose()
    }

    async fn history_sum(&self, account_id: AccountId) -> Result<Decimal> {
        sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(change_amount), 0) FROM balance_history WHERE account_id = $1",
        )
        .bind(account_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn balance_with_history_sum(&self, account_id: AccountId) -> Result<(Decimal, Decimal)> {
        // One statement reads both tables from the same snapshot.
        sqlx::query_as::<_, (Decimal, Decimal)>(
            "SELECT \
                COALESCE((SELECT amount FROM balances WHERE account_id = $1), 0), \
                COALESCE((SELECT SUM(change_amount) FROM balance_history WHERE account_id = $1), 0)",
        )
        .bind(account_id.get())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn transaction(&self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .map(TransactionRow::into_record)
        .transpose()
    }

    async fn transactions_for_account(
        &self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<TransactionRecord>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE source_account = $1 OR dest_account = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.get())
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?
        .into_iter()
        .map(TransactionRow::into_record)
        .collect()
    }

    async fn account_ids(&self) -> Result<Vec<AccountId>> {
        sqlx::query_scalar::<_, i64>("SELECT account_id FROM balances ORDER BY account_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(stored_account)
            .collect()
    }
}

/// A database transaction used as a unit of work.
struct PgUnit {
    tx: Transaction<'static, Postgres>,
    locked_balances: HashSet<AccountId>,
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn lock_balance(&mut self, account_id: AccountId) -> Result<AccountBalance> {
        if !self.locked_balances.contains(&account_id) {
            sqlx::query(
                "INSERT INTO balances (account_id, amount) VALUES ($1, 0) ON CONFLICT (account_id) DO NOTHING",
            )
            .bind(account_id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        }

        let balance = sqlx::query_as::<_, BalanceRow>(&format!(
            "SELECT {BALANCE_COLUMNS} FROM balances WHERE account_id = $1 FOR UPDATE"
        ))
        .bind(account_id.get())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?
        .into_balance()?;

        self.locked_balances.insert(account_id);
        Ok(balance)
    }

    async fn write_balance(
        &mut self,
        account_id: AccountId,
        amount: Decimal,
    ) -> Result<AccountBalance> {
        if !self.locked_balances.contains(&account_id) {
            return Err(LedgerError::storage(format!(
                "balance of account {account_id} written without holding its lock"
            )));
        }

        sqlx::query_as::<_, BalanceRow>(&format!(
            "UPDATE balances SET amount = $2, updated_at = clock_timestamp() \
             WHERE account_id = $1 RETURNING {BALANCE_COLUMNS}"
        ))
        .bind(account_id.get())
        .bind(amount)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::AccountNotFound(account_id))?
        .into_balance()
    }

    async fn append_history(&mut self, entry: NewHistoryEntry) -> Result<BalanceHistoryEntry> {
        // Savepoint so a failed insert does not poison the enclosing transaction.
        let mut savepoint = sqlx::Connection::begin(&mut *self.tx)
            .await
            .map_err(db_err)?;

        let inserted = sqlx::query_as::<_, HistoryRow>(&format!(
            "INSERT INTO balance_history (account_id, resulting_balance, change_amount, transaction_id) \
             VALUES ($1, $2, $3, $4) RETURNING {HISTORY_COLUMNS}"
        ))
        .bind(entry.account_id.get())
        .bind(entry.resulting_balance)
        .bind(entry.change_amount)
        .bind(entry.transaction_id.map(|id| id.get()))
        .fetch_one(&mut *savepoint)
        .await;

        match inserted {
            Ok(row) => {
                savepoint.commit().await.map_err(db_err)?;
                row.into_entry()
            }
            Err(e) => {
                savepoint.rollback().await.map_err(db_err)?;
                Err(db_err(e))
            }
        }
    }

    async fn insert_transaction(
        &mut self,
        new: NewTransaction,
        status: TransactionStatus,
    ) -> Result<TransactionRecord> {
        let (id, created_at): (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO transactions (source_account, dest_account, amount, tx_type, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id, created_at",
        )
        .bind(new.source_account.map(|a| a.get()))
        .bind(new.dest_account.map(|a| a.get()))
        .bind(new.amount.value())
        .bind(new.tx_type.as_str())
        .bind(status.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(TransactionRecord::from_new(
            TransactionId::from_raw(id),
            new,
            status,
            created_at,
        ))
    }

    async fn lock_transaction(&mut self, id: TransactionId) -> Result<Option<TransactionRecord>> {
        sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .map(TransactionRow::into_record)
        .transpose()
    }

    async fn update_transaction_status(
        &mut self,
        id: TransactionId,
        status: TransactionStatus,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1")
            .bind(id.get())
            .bind(status.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::TransactionNotFound(id));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}
