//! Core ledger engine implementation.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use ledgercore_common::{AccountId, LedgerError, Result, TransactionId, AMOUNT_LIMIT};

use crate::balance::{AccountBalance, BalanceMutation};
use crate::history::NewHistoryEntry;
use crate::store::{LedgerStore, UnitOfWork};

/// How a failed history append affects the surrounding unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryPolicy {
    /// The failure aborts the unit; balance and history never diverge.
    #[default]
    Atomic,
    /// The failure is logged and counted; the balance change still commits.
    /// Drift is left for reconciliation to detect.
    BestEffort,
}

impl FromStr for HistoryPolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "atomic" => Ok(HistoryPolicy::Atomic),
            "best_effort" | "best-effort" => Ok(HistoryPolicy::BestEffort),
            other => Err(LedgerError::Configuration(format!(
                "unknown history policy {other:?}"
            ))),
        }
    }
}

/// The ledger engine applies balance deltas inside units of work.
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    history_policy: HistoryPolicy,
    history_failures: AtomicU64,
}

impl LedgerEngine {
    /// Create a new ledger engine over a store.
    pub fn new(store: Arc<dyn LedgerStore>, history_policy: HistoryPolicy) -> Self {
        Self {
            store,
            history_policy,
            history_failures: AtomicU64::new(0),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn history_policy(&self) -> HistoryPolicy {
        self.history_policy
    }

    /// Number of history appends dropped under [`HistoryPolicy::BestEffort`].
    pub fn history_append_failures(&self) -> u64 {
        self.history_failures.load(Ordering::Relaxed)
    }

    /// Open an atomic unit of work.
    pub async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        self.store.begin().await
    }

    /// Lock balance rows in ascending account order.
    ///
    /// Every multi-account unit goes through here first so that two units
    /// touching the same accounts always request row locks in the same order.
    pub async fn lock_accounts(
        &self,
        unit: &mut dyn UnitOfWork,
        accounts: &[AccountId],
    ) -> Result<Vec<AccountBalance>> {
        let mut ordered = accounts.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut balances = Vec::with_capacity(ordered.len());
        for account_id in ordered {
            balances.push(unit.lock_balance(account_id).await?);
        }
        Ok(balances)
    }

    /// Atomically apply a signed delta to one account's balance.
    ///
    /// Reads the balance under an exclusive row lock (creating it at zero),
    /// rejects any result below zero with [`LedgerError::InsufficientFunds`],
    /// persists the new amount and appends a history row.
    #[instrument(skip(self, unit))]
    pub async fn apply_delta(
        &self,
        unit: &mut dyn UnitOfWork,
        account_id: AccountId,
        delta: Decimal,
        transaction_id: Option<TransactionId>,
    ) -> Result<BalanceMutation> {
        let current = unit.lock_balance(account_id).await?;
        let new_amount = current
            .amount
            .checked_add(delta)
            .filter(|amount| *amount < AMOUNT_LIMIT)
            .ok_or_else(|| {
                LedgerError::validation(format!(
                    "balance of account {account_id} would reach the limit of {AMOUNT_LIMIT}"
                ))
            })?;

        if new_amount < Decimal::ZERO {
            debug!(
                account_id = %account_id,
                available = %current.amount,
                delta = %delta,
                "Rejecting delta below zero"
            );
            return Err(LedgerError::InsufficientFunds {
                account_id,
                required: -delta,
                available: current.amount,
            });
        }

        unit.write_balance(account_id, new_amount).await?;

        let entry = NewHistoryEntry {
            account_id,
            resulting_balance: new_amount,
            change_amount: delta,
            transaction_id,
        };

        let history = match unit.append_history(entry).await {
            Ok(entry) => Some(entry),
            Err(e) => match self.history_policy {
                HistoryPolicy::Atomic => {
                    error!(
                        account_id = %account_id,
                        error = %e,
                        "History append failed, aborting unit"
                    );
                    return Err(e);
                }
                HistoryPolicy::BestEffort => {
                    self.history_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        account_id = %account_id,
                        error = %e,
                        "Failed to record balance history (non-critical)"
                    );
                    None
                }
            },
        };

        Ok(BalanceMutation {
            account_id,
            previous: current.amount,
            current: new_amount,
            delta,
            history,
        })
    }
}
