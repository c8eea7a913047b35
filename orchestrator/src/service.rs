//! Ledger service wiring and lifecycle.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use ledgercore_common::{Caller, LedgerError, Operation, Result, TransactionRecord};
use ledgercore_ledger::{LedgerEngine, LedgerStore};

use crate::config::LedgerConfig;
use crate::guard::AccountGuard;
use crate::metrics::{Metrics, MetricsSnapshot, SharedMetrics};
use crate::orchestrator::TransactionOrchestrator;
use crate::reader::BalanceReader;
use crate::state::ServiceState;

/// The ledger service: orchestrator and reader over one store, plus the
/// periodic reconciliation job.
pub struct LedgerService {
    /// Configuration.
    config: LedgerConfig,
    /// Identifier for this process in logs.
    instance_id: String,
    /// Current service state.
    state: Arc<RwLock<ServiceState>>,
    engine: Arc<LedgerEngine>,
    guard: Arc<AccountGuard>,
    orchestrator: Arc<TransactionOrchestrator>,
    reader: Arc<BalanceReader>,
    metrics: SharedMetrics,
    /// Shutdown signal for background tasks.
    shutdown_tx: watch::Sender<bool>,
    reconcile_task: Mutex<Option<JoinHandle<()>>>,
}

impl LedgerService {
    /// Wire a service over `store`.
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig, instance_id: String) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let metrics: SharedMetrics = Arc::new(Metrics::new());

        let engine = Arc::new(LedgerEngine::new(
            store.clone(),
            config.orchestrator.history_policy,
        ));
        let guard = Arc::new(AccountGuard::new(&config.guard));
        let orchestrator = Arc::new(
            TransactionOrchestrator::new(
                engine.clone(),
                guard.clone(),
                config.orchestrator.clone(),
                metrics.clone(),
            )
            .with_max_page_limit(config.reader.max_page_limit),
        );
        let reader = Arc::new(BalanceReader::new(
            store,
            config.reader.clone(),
            metrics.clone(),
        ));

        Self {
            config,
            instance_id,
            state: Arc::new(RwLock::new(ServiceState::Starting)),
            engine,
            guard,
            orchestrator,
            reader,
            metrics,
            shutdown_tx,
            reconcile_task: Mutex::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<TransactionOrchestrator> {
        &self.orchestrator
    }

    pub fn reader(&self) -> &Arc<BalanceReader> {
        &self.reader
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Get the current service state.
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Check if the service is accepting requests.
    pub fn is_accepting_requests(&self) -> bool {
        self.state.read().accepts_requests()
    }

    /// Execute an operation if the service is running.
    ///
    /// Requests arriving before `start` or after `stop` begins are refused
    /// without touching the store.
    pub async fn execute(&self, caller: &Caller, operation: Operation) -> Result<TransactionRecord> {
        let state = self.state();
        if !state.accepts_requests() {
            warn!(state = ?state, operation = operation.kind(), "Refusing request");
            return Err(LedgerError::ServiceUnavailable(format!("service is {state:?}")));
        }
        self.orchestrator.execute(caller, operation).await
    }

    /// Metrics including guard and history counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.guard_acquisitions = self.guard.acquisitions();
        snapshot.history_append_failures = self.engine.history_append_failures();
        snapshot
    }

    /// Start the service and its reconciliation loop.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn start(&self) -> Result<()> {
        if self.state() != ServiceState::Starting {
            return Ok(());
        }

        info!(
            guard_enabled = self.guard.is_enabled(),
            guard_shards = self.guard.shard_count(),
            history_policy = ?self.engine.history_policy(),
            "Starting ledger service"
        );

        let reader = self.reader.clone();
        let interval = self.config.reconcile_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reader.reconcile_all().await {
                            error!(error = %e, "Reconciliation sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        *self.reconcile_task.lock() = Some(handle);
        *self.state.write() = ServiceState::Running;

        info!("Ledger service started");
        Ok(())
    }

    /// Stop the service gracefully.
    #[instrument(skip(self), fields(instance_id = %self.instance_id))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping ledger service");

        *self.state.write() = ServiceState::ShuttingDown;
        let _ = self.shutdown_tx.send(true);

        let task = self.reconcile_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Reconciliation task ended abnormally");
            }
        }

        *self.state.write() = ServiceState::Stopped;

        info!("Ledger service stopped");
        Ok(())
    }
}
