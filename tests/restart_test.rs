//! Restart recovery end to end: trade, snapshot, simulated crash,
//! reload, reconcile against exchange truth, and replay protection.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal_macros::dec;

use algoledger::broker::{BrokerAdapter, OrderStatus, PaperBroker};
use algoledger::capital::{CapitalEngine, Tier};
use algoledger::execution::{EntryRequest, ExecutionConfig, ExecutionCoordinator};
use algoledger::ledger::{OrderId, PendingOrder, PositionLedger};
use algoledger::reconcile::{
    ClassifyConfig, DiscrepancyKind, RestartManager, RestartStatus, SnapshotStore,
    SystemStateSnapshot, TradingState,
};
use algoledger::record::MemoryRecorder;
use algoledger::types::{ContainerId, OrderKind, OrderSide, PositionSide};

fn restart_manager(path: &std::path::Path) -> RestartManager {
    RestartManager::new(SnapshotStore::new(path), ClassifyConfig::default())
}

/// Build a snapshot from live components the way the worker does after
/// each state change.
async fn snapshot_from(
    ledger: &Arc<PositionLedger>,
    broker: &Arc<PaperBroker>,
    last_signal_id: &str,
) -> SystemStateSnapshot {
    let mut snapshot = SystemStateSnapshot::empty(TradingState::Running);
    snapshot.positions = ledger.all_positions();
    snapshot.pending_orders = ledger.pending_orders();
    snapshot.balances = broker.get_balances().await.unwrap();
    snapshot.last_signal_id = Some(last_signal_id.to_string());
    snapshot
}

#[tokio::test]
async fn restart_after_clean_shutdown_reconciles_clean() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    // --- First process lifetime: open a position, persist. ---
    let broker = Arc::new(PaperBroker::new());
    broker.fund_usd(dec!(10000)).await;
    broker.set_price("BTC-USD", dec!(50000)).await;

    let engine = CapitalEngine::default();
    let container = engine
        .create_container("alice", dec!(5000), Tier::Professional)
        .unwrap();
    let ledger = Arc::new(PositionLedger::new());
    let coordinator = ExecutionCoordinator::new(
        broker.clone() as Arc<dyn BrokerAdapter>,
        ledger.clone(),
        Arc::new(MemoryRecorder::new()),
        ExecutionConfig::default(),
    );

    coordinator
        .register_entry(
            &container,
            EntryRequest {
                symbol: "BTC-USD".to_string(),
                side: PositionSide::Long,
                quantity: dec!(0.01),
                price: dec!(50000),
                stop_loss: None,
                reason: "entry".to_string(),
            },
        )
        .await
        .unwrap();

    let manager = restart_manager(&state_path);
    manager
        .save_state(&snapshot_from(&ledger, &broker, "sig-100").await)
        .unwrap();

    // --- Second process lifetime over the same state file. ---
    let manager = restart_manager(&state_path);
    let (loaded, restarted) = manager.load_state().unwrap();
    assert!(restarted);
    assert_eq!(loaded.unwrap().positions.len(), 1);

    // Trading is gated until reconciliation runs.
    assert!(manager.assert_reconciliation_complete().is_err());

    let report = manager.reconcile_with_exchange(
        &broker.get_positions().await.unwrap(),
        &broker.get_balances().await.unwrap(),
        &broker.get_open_orders().await.unwrap(),
    );
    assert_eq!(report.status, RestartStatus::Clean);
    assert!(manager.assert_reconciliation_complete().is_ok());

    // The signal acted on before the restart is rejected; new ones pass.
    assert!(!manager.prevent_duplicate("sig-100"));
    assert!(manager.prevent_duplicate("sig-101"));
}

#[tokio::test]
async fn restart_detects_position_sold_during_downtime() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let broker = Arc::new(PaperBroker::new());
    broker.fund_usd(dec!(10000)).await;
    broker.set_price("BTC-USD", dec!(50000)).await;

    let ledger = Arc::new(PositionLedger::new());
    let engine = CapitalEngine::default();
    let container = engine
        .create_container("alice", dec!(5000), Tier::Professional)
        .unwrap();
    let coordinator = ExecutionCoordinator::new(
        broker.clone() as Arc<dyn BrokerAdapter>,
        ledger.clone(),
        Arc::new(MemoryRecorder::new()),
        ExecutionConfig::default(),
    );
    coordinator
        .register_entry(
            &container,
            EntryRequest {
                symbol: "BTC-USD".to_string(),
                side: PositionSide::Long,
                quantity: dec!(0.01),
                price: dec!(50000),
                stop_loss: None,
                reason: "entry".to_string(),
            },
        )
        .await
        .unwrap();

    let manager = restart_manager(&state_path);
    manager
        .save_state(&snapshot_from(&ledger, &broker, "sig-1").await)
        .unwrap();

    // While the process was down, the position disappeared exchange-side
    // (manual sale, liquidation...). Only the snapshot remembers it.
    broker.set_position("BTC-USD", dec!(0)).await;
    broker.set_balance("BTC", dec!(0)).await;

    let manager = restart_manager(&state_path);
    manager.load_state().unwrap();
    let report = manager.reconcile_with_exchange(
        &broker.get_positions().await.unwrap(),
        &broker.get_balances().await.unwrap(),
        &broker.get_open_orders().await.unwrap(),
    );

    assert_eq!(report.status, RestartStatus::DiscrepanciesFound);
    let phantom = report
        .discrepancies
        .iter()
        .find(|d| d.symbol == "BTC-USD")
        .expect("phantom position reported");
    assert_eq!(phantom.kind, DiscrepancyKind::PhantomPosition);
}

#[tokio::test]
async fn restart_reports_orders_lost_in_crash() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let mut snapshot = SystemStateSnapshot::empty(TradingState::Running);
    snapshot.pending_orders.push(PendingOrder::new(
        OrderId::new("ord-inflight"),
        ContainerId::new("c1"),
        "ETH-USD",
        OrderSide::Sell,
        OrderKind::Market,
        OrderStatus::Submitted,
    ));
    snapshot.last_signal_id = Some("sig-5".to_string());

    let manager = restart_manager(&state_path);
    manager.save_state(&snapshot).unwrap();

    let manager = restart_manager(&state_path);
    manager.load_state().unwrap();
    // Exchange reports no open orders: the in-flight order vanished
    // without a terminal status.
    let report = manager.reconcile_with_exchange(&[], &HashMap::new(), &[]);

    assert_eq!(report.status, RestartStatus::DiscrepanciesFound);
    assert_eq!(report.orphaned_orders.len(), 1);
    assert_eq!(report.orphaned_orders[0].id.as_str(), "ord-inflight");
    assert_eq!(report.orphaned_orders[0].symbol, "ETH-USD");
}

#[tokio::test]
async fn clean_start_skips_straight_to_trading() {
    let dir = tempfile::tempdir().unwrap();
    let manager = restart_manager(&dir.path().join("state.json"));

    let (loaded, restarted) = manager.load_state().unwrap();
    assert!(loaded.is_none());
    assert!(!restarted);

    let report = manager.reconcile_with_exchange(&[], &HashMap::new(), &[]);
    assert_eq!(report.status, RestartStatus::CleanStart);
    assert!(manager.assert_reconciliation_complete().is_ok());
    assert!(manager.prevent_duplicate("sig-1"));
}
