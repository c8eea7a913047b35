//! Read side of the ledger: balances, history, point-in-time balances and
//! reconciliation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, instrument, warn};

use ledgercore_common::{now, AccountId, Result};
use ledgercore_ledger::{AccountBalance, BalanceHistoryEntry, LedgerStore, Page, Reconciliation};

use crate::config::ReaderConfig;
use crate::metrics::SharedMetrics;

/// Read-only queries over the ledger store.
///
/// The one write is [`BalanceReader::get_balance`] creating a zero row for an
/// account seen for the first time.
pub struct BalanceReader {
    store: Arc<dyn LedgerStore>,
    config: ReaderConfig,
    metrics: SharedMetrics,
}

impl BalanceReader {
    pub fn new(store: Arc<dyn LedgerStore>, config: ReaderConfig, metrics: SharedMetrics) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Current balance, created at zero if the account has none.
    pub async fn get_balance(&self, account_id: AccountId) -> Result<AccountBalance> {
        self.store.get_or_create_balance(account_id).await
    }

    /// History newest first. A `limit` of `None` uses the configured default;
    /// any limit is clamped to the configured maximum.
    pub async fn get_history(
        &self,
        account_id: AccountId,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<Vec<BalanceHistoryEntry>> {
        let page = Page::new(limit.unwrap_or(self.config.default_page_limit), offset)
            .clamped(self.config.max_page_limit);
        self.store.history(account_id, page).await
    }

    /// Balance recorded by the latest history entry at or before `at`, or
    /// zero if there is none.
    pub async fn get_balance_at_time(
        &self,
        account_id: AccountId,
        at: DateTime<Utc>,
    ) -> Result<Decimal> {
        Ok(self
            .store
            .history_at(account_id, at)
            .await?
            .map(|entry| entry.resulting_balance)
            .unwrap_or(Decimal::ZERO))
    }

    /// Compare the stored balance with the sum of its history, both read from
    /// one committed snapshot.
    ///
    /// A mismatch is logged and reported, never corrected.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, account_id: AccountId) -> Result<Reconciliation> {
        let (stored, derived) = self.store.balance_with_history_sum(account_id).await?;

        let report = Reconciliation {
            account_id,
            stored,
            derived,
            checked_at: now(),
        };

        if !report.is_consistent() {
            warn!(
                account_id = %account_id,
                stored = %stored,
                derived = %derived,
                drift = %report.drift(),
                "Balance does not match history"
            );
        }

        Ok(report)
    }

    /// Reconcile every account, returning the inconsistent reports.
    pub async fn reconcile_all(&self) -> Result<Vec<Reconciliation>> {
        let accounts = self.store.account_ids().await?;
        let mut mismatches = Vec::new();

        for account_id in &accounts {
            let report = self.reconcile(*account_id).await?;
            if !report.is_consistent() {
                mismatches.push(report);
            }
        }

        self.metrics.reconcile_run(mismatches.len() as u64);
        info!(
            accounts = accounts.len(),
            mismatches = mismatches.len(),
            "Reconciliation sweep finished"
        );
        Ok(mismatches)
    }
}
