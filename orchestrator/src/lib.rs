//! LedgerCore Orchestrator
//!
//! Credits, debits, transfers and compensating rollbacks composed from ledger
//! store primitives, the balance reader, and the service that runs periodic
//! reconciliation.

pub mod config;
pub mod guard;
pub mod metrics;
pub mod orchestrator;
pub mod reader;
pub mod service;
pub mod state;

pub use config::{GuardConfig, LedgerConfig, OrchestratorConfig, ReaderConfig};
pub use guard::{AccountGuard, GuardHandle};
pub use metrics::{Metrics, MetricsSnapshot, OperationKind, SharedMetrics};
pub use orchestrator::TransactionOrchestrator;
pub use reader::BalanceReader;
pub use service::LedgerService;
pub use state::ServiceState;
