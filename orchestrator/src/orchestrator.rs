//! Transaction orchestration.
//!
//! Each operation is one atomic unit: the transaction record is inserted
//! Pending, balance deltas are applied under row locks, the record moves to
//! its next status and everything commits together. Any error drops the unit,
//! which discards all of it.

use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, error, info, instrument};

use ledgercore_common::{
    AccountId, Amount, Caller, CreditRequest, DebitRequest, LedgerError, NewTransaction,
    Operation, Result, TransactionId, TransactionRecord, TransactionStatus, TransferRequest,
};
use ledgercore_ledger::{LedgerEngine, Page, UnitOfWork};

use crate::config::{OrchestratorConfig, ReaderConfig};
use crate::guard::AccountGuard;
use crate::metrics::{OperationKind, SharedMetrics};

/// Executes credits, debits, transfers and rollbacks.
pub struct TransactionOrchestrator {
    engine: Arc<LedgerEngine>,
    guard: Arc<AccountGuard>,
    config: OrchestratorConfig,
    metrics: SharedMetrics,
    /// Largest page served by `transactions_for_account`.
    max_page_limit: u32,
}

impl TransactionOrchestrator {
    pub fn new(
        engine: Arc<LedgerEngine>,
        guard: Arc<AccountGuard>,
        config: OrchestratorConfig,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            engine,
            guard,
            config,
            metrics,
            max_page_limit: ReaderConfig::default().max_page_limit,
        }
    }

    /// Cap transaction listings at `limit` rows per page.
    pub fn with_max_page_limit(mut self, limit: u32) -> Self {
        self.max_page_limit = limit;
        self
    }

    pub fn engine(&self) -> &Arc<LedgerEngine> {
        &self.engine
    }

    pub fn guard(&self) -> &Arc<AccountGuard> {
        &self.guard
    }

    /// Dispatch any operation.
    pub async fn execute(&self, caller: &Caller, operation: Operation) -> Result<TransactionRecord> {
        match operation {
            Operation::Credit(request) => self.credit(caller, request).await,
            Operation::Debit(request) => self.debit(caller, request).await,
            Operation::Transfer(request) => self.transfer(caller, request).await,
            Operation::Rollback { transaction_id } => self.rollback(caller, transaction_id).await,
        }
    }

    /// Add funds to an account.
    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn credit(&self, caller: &Caller, request: CreditRequest) -> Result<TransactionRecord> {
        self.metrics.operation_started(OperationKind::Credit);
        let result = async {
            let (account, amount) = request.validate()?;
            self.record_movement(
                NewTransaction::credit(account, amount),
                &[(account, amount.credit_delta())],
            )
            .await
        }
        .await;
        self.observe(OperationKind::Credit, result)
    }

    /// Remove funds from an account.
    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn debit(&self, caller: &Caller, request: DebitRequest) -> Result<TransactionRecord> {
        self.metrics.operation_started(OperationKind::Debit);
        let result = async {
            let (account, amount) = request.validate()?;
            self.advisory_check(account, amount).await?;
            self.record_movement(
                NewTransaction::debit(account, amount),
                &[(account, amount.debit_delta())],
            )
            .await
        }
        .await;
        self.observe(OperationKind::Debit, result)
    }

    /// Move funds between two accounts.
    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn transfer(
        &self,
        caller: &Caller,
        request: TransferRequest,
    ) -> Result<TransactionRecord> {
        self.metrics.operation_started(OperationKind::Transfer);
        let result = async {
            let transfer = request.validate()?;
            self.advisory_check(transfer.source, transfer.amount).await?;
            self.record_movement(
                NewTransaction::transfer(transfer.source, transfer.dest, transfer.amount)?,
                &[
                    (transfer.source, transfer.amount.debit_delta()),
                    (transfer.dest, transfer.amount.credit_delta()),
                ],
            )
            .await
        }
        .await;
        self.observe(OperationKind::Transfer, result)
    }

    /// Reverse a completed transaction with compensating deltas.
    ///
    /// History is never deleted; the compensation appends ordinary history
    /// rows carrying the original transaction id.
    #[instrument(skip(self, caller), fields(caller = %caller))]
    pub async fn rollback(
        &self,
        caller: &Caller,
        transaction_id: TransactionId,
    ) -> Result<TransactionRecord> {
        self.metrics.operation_started(OperationKind::Rollback);
        let result = self.compensate(transaction_id).await;
        self.observe(OperationKind::Rollback, result)
    }

    /// Fetch a transaction record.
    pub async fn transaction(&self, id: TransactionId) -> Result<TransactionRecord> {
        self.engine
            .store()
            .transaction(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))
    }

    /// Transactions touching an account, newest first. The limit is clamped
    /// to the configured maximum page size.
    pub async fn transactions_for_account(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<TransactionRecord>> {
        let page = Page::new(limit, offset).clamped(self.max_page_limit);
        self.engine
            .store()
            .transactions_for_account(account_id, page)
            .await
    }

    /// Fast-reject a debit the current balance cannot cover.
    ///
    /// Racy by nature; the locked check in `apply_delta` is what enforces
    /// non-negative balances.
    async fn advisory_check(&self, account_id: AccountId, amount: Amount) -> Result<()> {
        if !self.config.advisory_precheck {
            return Ok(());
        }

        let balance = self.engine.store().get_or_create_balance(account_id).await?;
        if balance.has_sufficient_funds(amount.value()) {
            return Ok(());
        }

        self.metrics.insufficient_funds(true);
        debug!(
            account_id = %account_id,
            available = %balance.amount,
            amount = %amount,
            "Advisory balance check rejected request"
        );
        Err(LedgerError::InsufficientFunds {
            account_id,
            required: amount.value(),
            available: balance.amount,
        })
    }

    /// Insert a transaction, apply its deltas and complete it in one unit.
    async fn record_movement(
        &self,
        new: NewTransaction,
        deltas: &[(AccountId, Decimal)],
    ) -> Result<TransactionRecord> {
        let accounts: Vec<AccountId> = deltas.iter().map(|&(account, _)| account).collect();
        let _guard = self.guard.acquire_many(&accounts).await;

        let mut unit = self.engine.begin().await?;
        let mut record = unit
            .insert_transaction(new, TransactionStatus::Pending)
            .await?;

        self.engine.lock_accounts(unit.as_mut(), &accounts).await?;
        for &(account, delta) in deltas {
            self.apply(unit.as_mut(), account, delta, record.id).await?;
        }

        unit.update_transaction_status(record.id, TransactionStatus::Completed)
            .await?;
        record.transition_to(TransactionStatus::Completed)?;
        unit.commit().await?;

        info!(
            transaction_id = %record.id,
            tx_type = %record.tx_type,
            amount = %record.amount,
            "Transaction completed"
        );
        Ok(record)
    }

    async fn compensate(&self, id: TransactionId) -> Result<TransactionRecord> {
        // Unlocked read to learn which accounts to guard. The status is
        // re-checked under the record lock below.
        let snapshot = self.transaction(id).await?;
        let _guard = self.guard.acquire_many(&snapshot.involved_accounts()).await;

        let mut unit = self.engine.begin().await?;
        let mut record = unit
            .lock_transaction(id)
            .await?
            .ok_or(LedgerError::TransactionNotFound(id))?;

        match record.status {
            TransactionStatus::Completed => {}
            TransactionStatus::RolledBack => return Err(LedgerError::AlreadyRolledBack(id)),
            from => {
                return Err(LedgerError::InvalidTransition {
                    from,
                    to: TransactionStatus::RolledBack,
                })
            }
        }

        let deltas = record.compensating_deltas()?;
        self.engine
            .lock_accounts(unit.as_mut(), &record.involved_accounts())
            .await?;
        for (account, delta) in deltas {
            self.apply(unit.as_mut(), account, delta, id).await?;
        }

        unit.update_transaction_status(id, TransactionStatus::RolledBack)
            .await?;
        record.transition_to(TransactionStatus::RolledBack)?;
        unit.commit().await?;

        info!(
            transaction_id = %id,
            tx_type = %record.tx_type,
            amount = %record.amount,
            "Transaction rolled back"
        );
        Ok(record)
    }

    async fn apply(
        &self,
        unit: &mut dyn UnitOfWork,
        account_id: AccountId,
        delta: Decimal,
        transaction_id: TransactionId,
    ) -> Result<()> {
        match self
            .engine
            .apply_delta(unit, account_id, delta, Some(transaction_id))
            .await
        {
            Ok(_) => Ok(()),
            Err(e @ LedgerError::InsufficientFunds { .. }) => {
                self.metrics.insufficient_funds(false);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn observe(
        &self,
        kind: OperationKind,
        result: Result<TransactionRecord>,
    ) -> Result<TransactionRecord> {
        match &result {
            Ok(_) => self.metrics.operation_succeeded(kind),
            Err(e) => {
                self.metrics.operation_failed(kind);
                if e.is_client_error() {
                    debug!(operation = kind.as_str(), error = %e, "Operation rejected");
                } else {
                    error!(operation = kind.as_str(), error = %e, "Operation failed");
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardConfig;
    use crate::metrics::Metrics;
    use ledgercore_common::{Role, TransactionType};
    use ledgercore_ledger::{HistoryPolicy, LedgerStore, MemoryStore};
    use rust_decimal_macros::dec;

    fn account(id: i64) -> AccountId {
        AccountId::new(id).unwrap()
    }

    fn caller() -> Caller {
        Caller::new("user-1", Role::User)
    }

    fn setup(config: OrchestratorConfig) -> (Arc<MemoryStore>, TransactionOrchestrator) {
        let store = Arc::new(MemoryStore::new());
        let engine = Arc::new(LedgerEngine::new(store.clone(), config.history_policy));
        let guard = Arc::new(AccountGuard::new(&GuardConfig::default()));
        let orchestrator =
            TransactionOrchestrator::new(engine, guard, config, Arc::new(Metrics::new()));
        (store, orchestrator)
    }

    async fn balance(store: &MemoryStore, id: i64) -> Decimal {
        store.get_or_create_balance(account(id)).await.unwrap().amount
    }

    #[tokio::test]
    async fn test_credit_completes() {
        let (store, orch) = setup(OrchestratorConfig::default());

        let record = orch
            .credit(&caller(), CreditRequest::new(1, dec!(100)))
            .await
            .unwrap();

        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(record.tx_type, TransactionType::Credit);
        assert_eq!(record.dest_account, Some(account(1)));
        assert_eq!(record.source_account, None);
        assert_eq!(balance(&store, 1).await, dec!(100));
        assert_eq!(orch.transaction(record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_validation_rejected_before_unit() {
        let (store, orch) = setup(OrchestratorConfig::default());

        let err = orch
            .credit(&caller(), CreditRequest::new(1, dec!(-5)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation { .. }));

        let err = orch
            .transfer(&caller(), TransferRequest::new(2, 2, dec!(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation { .. }));

        assert_eq!(store.transaction_count(), 0);
    }

    #[tokio::test]
    async fn test_debit_insufficient_authoritative() {
        let (store, orch) = setup(OrchestratorConfig {
            advisory_precheck: false,
            ..Default::default()
        });
        orch.credit(&caller(), CreditRequest::new(1, dec!(10)))
            .await
            .unwrap();

        let err = orch
            .debit(&caller(), DebitRequest::new(1, dec!(10.01)))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance(&store, 1).await, dec!(10));
        assert_eq!(store.transaction_count(), 1);
        let snapshot = orch.metrics.snapshot();
        assert_eq!(snapshot.insufficient_funds_authoritative, 1);
        assert_eq!(snapshot.insufficient_funds_advisory, 0);
    }

    #[tokio::test]
    async fn test_debit_insufficient_advisory() {
        let (store, orch) = setup(OrchestratorConfig::default());

        let err = orch
            .debit(&caller(), DebitRequest::new(1, dec!(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(store.transaction_count(), 0);
        assert_eq!(orch.metrics.snapshot().insufficient_funds_advisory, 1);
    }

    #[tokio::test]
    async fn test_transfer_moves_funds() {
        let (store, orch) = setup(OrchestratorConfig::default());
        orch.credit(&caller(), CreditRequest::new(7, dec!(50)))
            .await
            .unwrap();

        let record = orch
            .transfer(&caller(), TransferRequest::new(7, 3, dec!(20.50)))
            .await
            .unwrap();

        assert_eq!(record.status, TransactionStatus::Completed);
        assert_eq!(balance(&store, 7).await, dec!(29.50));
        assert_eq!(balance(&store, 3).await, dec!(20.50));

        let listed = orch
            .transactions_for_account(account(3), 10, 0)
            .await
            .unwrap();
        assert_eq!(listed, vec![record]);
    }

    #[tokio::test]
    async fn test_transaction_listing_clamped_to_configured_page() {
        let (_, orch) = setup(OrchestratorConfig::default());
        let orch = orch.with_max_page_limit(2);
        for _ in 0..3 {
            orch.credit(&caller(), CreditRequest::new(5, dec!(1)))
                .await
                .unwrap();
        }

        let first = orch
            .transactions_for_account(account(5), 10, 0)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let rest = orch
            .transactions_for_account(account(5), 10, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_transfer() {
        let (store, orch) = setup(OrchestratorConfig::default());
        orch.credit(&caller(), CreditRequest::new(1, dec!(40)))
            .await
            .unwrap();
        let transfer = orch
            .transfer(&caller(), TransferRequest::new(1, 2, dec!(15)))
            .await
            .unwrap();

        let rolled_back = orch.rollback(&caller(), transfer.id).await.unwrap();

        assert_eq!(rolled_back.status, TransactionStatus::RolledBack);
        assert_eq!(balance(&store, 1).await, dec!(40));
        assert_eq!(balance(&store, 2).await, dec!(0));
        // credit + transfer (2 rows) + compensation (2 rows)
        assert_eq!(store.history_len(), 5);
    }

    #[tokio::test]
    async fn test_rollback_blocked_by_spent_funds() {
        let (store, orch) = setup(OrchestratorConfig::default());
        let credit = orch
            .credit(&caller(), CreditRequest::new(1, dec!(40)))
            .await
            .unwrap();
        orch.debit(&caller(), DebitRequest::new(1, dec!(30)))
            .await
            .unwrap();

        let err = orch.rollback(&caller(), credit.id).await.unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(balance(&store, 1).await, dec!(10));
        assert_eq!(
            orch.transaction(credit.id).await.unwrap().status,
            TransactionStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_rollback_unknown_transaction() {
        let (_store, orch) = setup(OrchestratorConfig::default());
        let err = orch
            .rollback(&caller(), TransactionId::from_raw(99))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn test_history_failure_aborts_under_atomic_policy() {
        let (store, orch) = setup(OrchestratorConfig::default());
        store.fail_history_appends(true);

        let err = orch
            .credit(&caller(), CreditRequest::new(1, dec!(10)))
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Storage(_)));
        assert_eq!(store.transaction_count(), 0);
        store.fail_history_appends(false);
        assert_eq!(balance(&store, 1).await, dec!(0));
    }

    #[tokio::test]
    async fn test_execute_dispatches() {
        let (_store, orch) = setup(OrchestratorConfig {
            history_policy: HistoryPolicy::Atomic,
            advisory_precheck: true,
        });

        let credit = orch
            .execute(&caller(), Operation::Credit(CreditRequest::new(4, dec!(5))))
            .await
            .unwrap();
        let rollback = orch
            .execute(
                &caller(),
                Operation::Rollback {
                    transaction_id: credit.id,
                },
            )
            .await
            .unwrap();

        assert_eq!(rollback.id, credit.id);
        assert_eq!(rollback.status, TransactionStatus::RolledBack);
        let snapshot = orch.metrics.snapshot();
        assert_eq!(snapshot.credits.succeeded, 1);
        assert_eq!(snapshot.rollbacks.succeeded, 1);
    }
}
