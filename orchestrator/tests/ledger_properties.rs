//! Integration tests for orchestrator + reader over the in-memory store

use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use ledgercore_common::{
    AccountId, Caller, CreditRequest, DebitRequest, LedgerError, ManualClock, Role,
    TransactionStatus, TransferRequest,
};
use ledgercore_ledger::{HistoryPolicy, LedgerStore, MemoryStore, Page};
use ledgercore_orchestrator::{GuardConfig, LedgerConfig, LedgerService, OrchestratorConfig};

fn account(id: i64) -> AccountId {
    AccountId::new(id).unwrap()
}

fn caller() -> Caller {
    Caller::new("merchant-7", Role::Merchant)
}

fn create_service(store: &Arc<MemoryStore>, config: LedgerConfig) -> LedgerService {
    LedgerService::new(store.clone(), config, "integration".to_string())
}

/// Config with the advisory pre-check off, so every insufficient-funds
/// rejection comes from the locked check inside the unit.
fn authoritative_only() -> LedgerConfig {
    LedgerConfig {
        orchestrator: OrchestratorConfig {
            advisory_precheck: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn balance(store: &MemoryStore, id: i64) -> Decimal {
    store.get_or_create_balance(account(id)).await.unwrap().amount
}

async fn history_len(store: &MemoryStore, id: i64) -> usize {
    store
        .history(account(id), Page::new(1000, 0))
        .await
        .unwrap()
        .len()
}

#[tokio::test]
async fn test_reconcile_detects_forced_history_failure() {
    let store = Arc::new(MemoryStore::new());
    let service = create_service(
        &store,
        LedgerConfig {
            orchestrator: OrchestratorConfig {
                history_policy: HistoryPolicy::BestEffort,
                ..Default::default()
            },
            ..Default::default()
        },
    );
    let orch = service.orchestrator();
    let reader = service.reader();

    orch.credit(&caller(), CreditRequest::new(1, dec!(100)))
        .await
        .unwrap();
    orch.credit(&caller(), CreditRequest::new(2, dec!(8)))
        .await
        .unwrap();
    assert!(reader.reconcile(account(1)).await.unwrap().is_consistent());

    store.fail_history_appends(true);
    orch.debit(&caller(), DebitRequest::new(1, dec!(25)))
        .await
        .unwrap();
    store.fail_history_appends(false);

    let report = reader.reconcile(account(1)).await.unwrap();
    assert!(!report.is_consistent());
    assert_eq!(report.stored, dec!(75));
    assert_eq!(report.derived, dec!(100));
    assert_eq!(service.metrics().history_append_failures, 1);

    let mismatches = reader.reconcile_all().await.unwrap();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].account_id, account(1));
    assert_eq!(mismatches[0].drift(), dec!(-25));
}

#[tokio::test]
async fn test_debit_beyond_balance_leaves_state_unchanged() {
    for config in [LedgerConfig::default(), authoritative_only()] {
        let store = Arc::new(MemoryStore::new());
        let service = create_service(&store, config);
        let orch = service.orchestrator();

        orch.credit(&caller(), CreditRequest::new(1, dec!(50)))
            .await
            .unwrap();
        let transactions_before = store.transaction_count();

        let err = orch
            .debit(&caller(), DebitRequest::new(1, dec!(50.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        let err = orch
            .transfer(&caller(), TransferRequest::new(1, 2, dec!(60)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

        assert_eq!(balance(&store, 1).await, dec!(50));
        assert_eq!(balance(&store, 2).await, dec!(0));
        assert_eq!(history_len(&store, 1).await, 1);
        assert_eq!(history_len(&store, 2).await, 0);
        assert_eq!(store.transaction_count(), transactions_before);
    }
}

#[tokio::test]
async fn test_transfer_is_all_or_nothing() {
    let store = Arc::new(MemoryStore::new());
    let service = create_service(&store, authoritative_only());
    let orch = service.orchestrator();

    orch.credit(&caller(), CreditRequest::new(10, dec!(100)))
        .await
        .unwrap();
    let before = store.transaction_count();

    // Success: both sides move, exactly one completed record.
    let record = orch
        .transfer(&caller(), TransferRequest::new(10, 20, dec!(30)))
        .await
        .unwrap();
    assert_eq!(record.status, TransactionStatus::Completed);
    assert_eq!(store.transaction_count(), before + 1);
    assert_eq!(balance(&store, 10).await, dec!(70));
    assert_eq!(balance(&store, 20).await, dec!(30));

    // Failure on the debit side: nothing moves, no record.
    let err = orch
        .transfer(&caller(), TransferRequest::new(20, 10, dec!(30.01)))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    assert_eq!(store.transaction_count(), before + 1);
    assert_eq!(balance(&store, 10).await, dec!(70));
    assert_eq!(balance(&store, 20).await, dec!(30));

    // Failure after both deltas were staged: the whole unit is discarded.
    store.fail_history_appends(true);
    let err = orch
        .transfer(&caller(), TransferRequest::new(10, 20, dec!(5)))
        .await
        .unwrap_err();
    store.fail_history_appends(false);
    assert!(matches!(err, LedgerError::Storage(_)));
    assert_eq!(store.transaction_count(), before + 1);
    assert_eq!(balance(&store, 10).await, dec!(70));
    assert_eq!(balance(&store, 20).await, dec!(30));
}

#[tokio::test]
async fn test_rollback_restores_balance_once() {
    let store = Arc::new(MemoryStore::new());
    let service = create_service(&store, LedgerConfig::default());
    let orch = service.orchestrator();
    let reader = service.reader();

    orch.credit(&caller(), CreditRequest::new(1, dec!(12.50)))
        .await
        .unwrap();
    let credit = orch
        .credit(&caller(), CreditRequest::new(1, dec!(100)))
        .await
        .unwrap();
    assert_eq!(balance(&store, 1).await, dec!(112.50));

    let rolled_back = orch.rollback(&caller(), credit.id).await.unwrap();
    assert_eq!(rolled_back.status, TransactionStatus::RolledBack);
    assert_eq!(balance(&store, 1).await, dec!(12.50));

    // History is kept; the compensation is an extra row.
    let history = reader.get_history(account(1), None, 0).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].change_amount, dec!(-100));
    assert_eq!(history[0].transaction_id, Some(credit.id));
    assert!(reader.reconcile(account(1)).await.unwrap().is_consistent());

    let err = orch.rollback(&caller(), credit.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyRolledBack(id) if id == credit.id));
    assert_eq!(balance(&store, 1).await, dec!(12.50));
    assert_eq!(
        orch.transaction(credit.id).await.unwrap().status,
        TransactionStatus::RolledBack
    );
}

#[tokio::test]
async fn test_rollback_debit_and_transfer() {
    let store = Arc::new(MemoryStore::new());
    let service = create_service(&store, LedgerConfig::default());
    let orch = service.orchestrator();

    orch.credit(&caller(), CreditRequest::new(1, dec!(100)))
        .await
        .unwrap();
    let debit = orch
        .debit(&caller(), DebitRequest::new(1, dec!(40)))
        .await
        .unwrap();
    let transfer = orch
        .transfer(&caller(), TransferRequest::new(1, 2, dec!(10)))
        .await
        .unwrap();

    orch.rollback(&caller(), debit.id).await.unwrap();
    assert_eq!(balance(&store, 1).await, dec!(90));

    orch.rollback(&caller(), transfer.id).await.unwrap();
    assert_eq!(balance(&store, 1).await, dec!(100));
    assert_eq!(balance(&store, 2).await, dec!(0));
}

async fn run_concurrent_debits(guard: GuardConfig) {
    const ATTEMPTS: usize = 20;
    const AFFORDABLE: usize = 7;
    let amount = dec!(15);

    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(create_service(
        &store,
        LedgerConfig {
            guard,
            ..Default::default()
        },
    ));
    let start = amount * Decimal::from(AFFORDABLE as u64);
    service
        .orchestrator()
        .credit(&caller(), CreditRequest::new(1, start))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..ATTEMPTS {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let caller = Caller::new(format!("user-{i}"), Role::User);
            service
                .orchestrator()
                .debit(&caller, DebitRequest::new(1, amount))
                .await
        }));
    }

    let mut succeeded = 0;
    let mut insufficient = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(LedgerError::InsufficientFunds { .. }) => insufficient += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, AFFORDABLE);
    assert_eq!(insufficient, ATTEMPTS - AFFORDABLE);
    assert_eq!(balance(&store, 1).await, Decimal::ZERO);
    assert!(service.reader().reconcile(account(1)).await.unwrap().is_consistent());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_with_guard() {
    run_concurrent_debits(GuardConfig::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_debits_without_guard() {
    run_concurrent_debits(GuardConfig {
        enabled: false,
        shards: 1,
    })
    .await;
}

async fn run_opposite_transfers(guard: GuardConfig) {
    let store = Arc::new(MemoryStore::new());
    let service = Arc::new(create_service(
        &store,
        LedgerConfig {
            guard,
            ..Default::default()
        },
    ));
    for id in [3, 4] {
        service
            .orchestrator()
            .credit(&caller(), CreditRequest::new(id, dec!(1000)))
            .await
            .unwrap();
    }

    let mut tasks = Vec::new();
    for i in 0..40 {
        let service = service.clone();
        tasks.push(tokio::spawn(async move {
            let (from, to) = if i % 2 == 0 { (3, 4) } else { (4, 3) };
            service
                .orchestrator()
                .transfer(&caller(), TransferRequest::new(from, to, dec!(1)))
                .await
        }));
    }

    let all = async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    };
    tokio::time::timeout(std::time::Duration::from_secs(10), all)
        .await
        .expect("opposite transfers deadlocked");

    assert_eq!(balance(&store, 3).await, dec!(1000));
    assert_eq!(balance(&store, 4).await, dec!(1000));
    assert_eq!(store.row_lock_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_do_not_deadlock_with_guard() {
    run_opposite_transfers(GuardConfig::default()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposite_transfers_do_not_deadlock_without_guard() {
    // Only the sorted row-lock order prevents a cycle here.
    run_opposite_transfers(GuardConfig {
        enabled: false,
        shards: 1,
    })
    .await;
}

#[tokio::test]
async fn test_get_balance_unknown_account() {
    let store = Arc::new(MemoryStore::new());
    let service = create_service(&store, LedgerConfig::default());

    let balance = service.reader().get_balance(account(404)).await.unwrap();

    assert_eq!(balance.amount, Decimal::ZERO);
    assert_eq!(balance.account_id, account(404));
    assert_eq!(store.account_ids().await.unwrap(), vec![account(404)]);
}

#[tokio::test]
async fn test_balance_at_time_between_entries() {
    let t1 = Utc::now();
    let clock = Arc::new(ManualClock::new(t1));
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let service = create_service(&store, LedgerConfig::default());
    let orch = service.orchestrator();
    let reader = service.reader();

    orch.credit(&caller(), CreditRequest::new(1, dec!(10)))
        .await
        .unwrap();
    clock.advance(Duration::minutes(1));
    let t2 = t1 + Duration::minutes(1);
    orch.credit(&caller(), CreditRequest::new(1, dec!(20)))
        .await
        .unwrap();
    clock.advance(Duration::minutes(1));
    let t3 = t2 + Duration::minutes(1);
    orch.debit(&caller(), DebitRequest::new(1, dec!(5)))
        .await
        .unwrap();

    let a = account(1);
    assert_eq!(
        reader.get_balance_at_time(a, t1 - Duration::seconds(1)).await.unwrap(),
        Decimal::ZERO
    );
    assert_eq!(reader.get_balance_at_time(a, t1).await.unwrap(), dec!(10));
    assert_eq!(reader.get_balance_at_time(a, t2).await.unwrap(), dec!(30));
    assert_eq!(
        reader
            .get_balance_at_time(a, t3 - Duration::milliseconds(1))
            .await
            .unwrap(),
        dec!(30)
    );
    assert_eq!(reader.get_balance_at_time(a, t3).await.unwrap(), dec!(25));
}
