//! In-process account guard.
//!
//! Serializes operations on the same account within one process before they
//! reach the store, so concurrent callers queue here instead of on database
//! row locks. The store's row lock remains the authority on correctness.
//!
//! Locks are striped over a fixed number of shards; memory use does not grow
//! with the number of accounts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use ledgercore_common::AccountId;

use crate::config::GuardConfig;

/// Scoped exclusive hold on one or more shards, released on drop.
#[derive(Debug)]
pub struct GuardHandle {
    shards: Vec<usize>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl GuardHandle {
    /// Shard indexes held, in acquisition order.
    pub fn shards(&self) -> &[usize] {
        &self.shards
    }
}

/// Striped per-account lock.
pub struct AccountGuard {
    shards: Vec<Arc<Mutex<()>>>,
    enabled: bool,
    acquisitions: AtomicU64,
}

impl AccountGuard {
    /// Create a guard from configuration.
    pub fn new(config: &GuardConfig) -> Self {
        let count = config.shards.max(1);
        Self {
            shards: (0..count).map(|_| Arc::new(Mutex::new(()))).collect(),
            enabled: config.enabled,
            acquisitions: AtomicU64::new(0),
        }
    }

    /// A guard whose handles hold nothing.
    pub fn disabled() -> Self {
        Self::new(&GuardConfig {
            enabled: false,
            shards: 1,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard an account maps to.
    pub fn shard_of(&self, account_id: AccountId) -> usize {
        (account_id.get() as u64 % self.shards.len() as u64) as usize
    }

    /// Number of handles handed out.
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Acquire the guard for one account.
    pub async fn acquire(&self, account_id: AccountId) -> GuardHandle {
        self.acquire_many(&[account_id]).await
    }

    /// Acquire the guard for several accounts.
    ///
    /// Shards are locked in ascending shard index whatever order the accounts
    /// are given in. Ordering by shard rather than by account id matters: two
    /// accounts in ascending id order can map to shards in descending order.
    pub async fn acquire_many(&self, accounts: &[AccountId]) -> GuardHandle {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);

        if !self.enabled {
            return GuardHandle {
                shards: Vec::new(),
                _guards: Vec::new(),
            };
        }

        let shards = self.lock_order(accounts);
        let mut guards = Vec::with_capacity(shards.len());
        for &shard in &shards {
            guards.push(self.shards[shard].clone().lock_owned().await);
        }
        trace!(?shards, "Account guard acquired");

        GuardHandle {
            shards,
            _guards: guards,
        }
    }

    /// Distinct shards for `accounts`, ascending.
    pub fn lock_order(&self, accounts: &[AccountId]) -> Vec<usize> {
        let mut shards: Vec<usize> = accounts.iter().map(|&a| self.shard_of(a)).collect();
        shards.sort_unstable();
        shards.dedup();
        shards
    }
}
