//! LedgerCore Ledger Store
//!
//! Balances, append-only balance history and transaction records, with
//! atomic read-modify-write of balances under exclusive row locks.

pub mod engine;
pub mod balance;
pub mod history;
pub mod store;
pub mod memory;
pub mod postgres;

pub use engine::{HistoryPolicy, LedgerEngine};
pub use balance::{AccountBalance, BalanceMutation};
pub use history::{derive_balance, BalanceHistoryEntry, NewHistoryEntry, Page, Reconciliation};
pub use store::{LedgerStore, UnitOfWork};
pub use memory::MemoryStore;
pub use postgres::PgLedgerStore;
