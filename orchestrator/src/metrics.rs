//! Metrics collection for ledger monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Counters for one kind of operation.
#[derive(Debug, Default)]
pub struct OperationCounters {
    pub started: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
}

impl OperationCounters {
    fn snapshot(&self) -> OperationSnapshot {
        OperationSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Operation kinds tracked by [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Credit,
    Debit,
    Transfer,
    Rollback,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Credit => "credit",
            OperationKind::Debit => "debit",
            OperationKind::Transfer => "transfer",
            OperationKind::Rollback => "rollback",
        }
    }
}

/// Ledger metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    pub credits: OperationCounters,
    pub debits: OperationCounters,
    pub transfers: OperationCounters,
    pub rollbacks: OperationCounters,
    /// Rejections by the advisory pre-check, before any unit was opened.
    pub insufficient_funds_advisory: AtomicU64,
    /// Rejections by the locked balance check inside a unit.
    pub insufficient_funds_authoritative: AtomicU64,
    /// Reconciliation sweeps completed.
    pub reconcile_runs: AtomicU64,
    /// Accounts found with stored balance != history sum.
    pub reconcile_mismatches: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, kind: OperationKind) -> &OperationCounters {
        match kind {
            OperationKind::Credit => &self.credits,
            OperationKind::Debit => &self.debits,
            OperationKind::Transfer => &self.transfers,
            OperationKind::Rollback => &self.rollbacks,
        }
    }

    pub fn operation_started(&self, kind: OperationKind) {
        self.counters(kind).started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_succeeded(&self, kind: OperationKind) {
        self.counters(kind).succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn operation_failed(&self, kind: OperationKind) {
        self.counters(kind).failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn insufficient_funds(&self, advisory: bool) {
        let counter = if advisory {
            &self.insufficient_funds_advisory
        } else {
            &self.insufficient_funds_authoritative
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a finished reconciliation sweep.
    pub fn reconcile_run(&self, mismatches: u64) {
        self.reconcile_runs.fetch_add(1, Ordering::Relaxed);
        self.reconcile_mismatches.fetch_add(mismatches, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    ///
    /// Guard and history counters live on their owners and are filled in by
    /// the service.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            credits: self.credits.snapshot(),
            debits: self.debits.snapshot(),
            transfers: self.transfers.snapshot(),
            rollbacks: self.rollbacks.snapshot(),
            insufficient_funds_advisory: self.insufficient_funds_advisory.load(Ordering::Relaxed),
            insufficient_funds_authoritative: self
                .insufficient_funds_authoritative
                .load(Ordering::Relaxed),
            reconcile_runs: self.reconcile_runs.load(Ordering::Relaxed),
            reconcile_mismatches: self.reconcile_mismatches.load(Ordering::Relaxed),
            guard_acquisitions: 0,
            history_append_failures: 0,
        }
    }
}

/// Point-in-time counters for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub credits: OperationSnapshot,
    pub debits: OperationSnapshot,
    pub transfers: OperationSnapshot,
    pub rollbacks: OperationSnapshot,
    pub insufficient_funds_advisory: u64,
    pub insufficient_funds_authoritative: u64,
    pub reconcile_runs: u64,
    pub reconcile_mismatches: u64,
    pub guard_acquisitions: u64,
    pub history_append_failures: u64,
}

impl MetricsSnapshot {
    /// Export in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP ledgercore_operations_total Ledger operations by kind and outcome\n");
        out.push_str("# TYPE ledgercore_operations_total counter\n");
        for (kind, ops) in [
            (OperationKind::Credit, self.credits),
            (OperationKind::Debit, self.debits),
            (OperationKind::Transfer, self.transfers),
            (OperationKind::Rollback, self.rollbacks),
        ] {
            for (outcome, value) in [
                ("started", ops.started),
                ("succeeded", ops.succeeded),
                ("failed", ops.failed),
            ] {
                out.push_str(&format!(
                    "ledgercore_operations_total{{kind=\"{}\",outcome=\"{}\"}} {}\n",
                    kind.as_str(),
                    outcome,
                    value
                ));
            }
        }

        out.push_str(&format!(
            r#"
# HELP ledgercore_insufficient_funds_total Rejected debits by check
# TYPE ledgercore_insufficient_funds_total counter
ledgercore_insufficient_funds_total{{check="advisory"}} {}
ledgercore_insufficient_funds_total{{check="authoritative"}} {}

# HELP ledgercore_reconcile_runs_total Reconciliation sweeps
# TYPE ledgercore_reconcile_runs_total counter
ledgercore_reconcile_runs_total {}

# HELP ledgercore_reconcile_mismatches_total Accounts whose balance drifted from history
# TYPE ledgercore_reconcile_mismatches_total counter
ledgercore_reconcile_mismatches_total {}

# HELP ledgercore_guard_acquisitions_total Account guard acquisitions
# TYPE ledgercore_guard_acquisitions_total counter
ledgercore_guard_acquisitions_total {}

# HELP ledgercore_history_append_failures_total History appends dropped
# TYPE ledgercore_history_append_failures_total counter
ledgercore_history_append_failures_total {}
"#,
            self.insufficient_funds_advisory,
            self.insufficient_funds_authoritative,
            self.reconcile_runs,
            self.reconcile_mismatches,
            self.guard_acquisitions,
            self.history_append_failures,
        ));

        out
    }
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
