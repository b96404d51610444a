//! Restart reconciliation.
//!
//! On process start the snapshot file is loaded once; its presence means
//! the process is restarting over previously live state. The loaded
//! snapshot (not live state) is then compared against freshly fetched
//! exchange truth before any trading is allowed, and the last processed
//! signal id guards against replaying a signal that was already acted on
//! before the crash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

use super::snapshot::{SnapshotError, SnapshotStore, SystemStateSnapshot};
use super::watchdog::{classify_discrepancies, ClassifyConfig, Discrepancy};
use crate::broker::{BrokerPosition, OpenOrder};
use crate::ledger::PendingOrder;

/// Errors from the restart path.
#[derive(Error, Debug)]
pub enum RestartError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Trading was requested before restart reconciliation completed.
    #[error("Restart reconciliation has not run since process start; trading is blocked")]
    NotReconciled,
}

/// Outcome of a restart reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartStatus {
    /// No snapshot on disk: nothing to reconcile.
    CleanStart,
    /// Snapshot matched exchange truth.
    Clean,
    /// Snapshot and exchange truth disagree.
    DiscrepanciesFound,
}

impl std::fmt::Display for RestartStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CleanStart => write!(f, "CLEAN_START"),
            Self::Clean => write!(f, "CLEAN"),
            Self::DiscrepanciesFound => write!(f, "DISCREPANCIES_FOUND"),
        }
    }
}

/// Structured report from restart reconciliation, suitable for logging
/// or forwarding to an operator channel.
#[derive(Debug, Clone)]
pub struct RestartReport {
    pub status: RestartStatus,
    pub discrepancies: Vec<Discrepancy>,
    /// Pending orders from the snapshot absent from the exchange's
    /// open-order list without a terminal status ever recorded.
    pub orphaned_orders: Vec<PendingOrder>,
    pub warnings: Vec<String>,
}

/// Persists and reloads the system snapshot around restarts, and gates
/// trading on reconciliation having run.
pub struct RestartManager {
    store: SnapshotStore,
    classify: ClassifyConfig,
    loaded: Mutex<Option<SystemStateSnapshot>>,
    restart_detected: AtomicBool,
    reconciled: AtomicBool,
}

impl RestartManager {
    #[must_use]
    pub fn new(store: SnapshotStore, classify: ClassifyConfig) -> Self {
        Self {
            store,
            classify,
            loaded: Mutex::new(None),
            restart_detected: AtomicBool::new(false),
            reconciled: AtomicBool::new(false),
        }
    }

    /// Persist the snapshot. Called after every state-changing operation.
    pub fn save_state(&self, snapshot: &SystemStateSnapshot) -> Result<(), SnapshotError> {
        self.store.save(snapshot)
    }

    /// Load the snapshot once at process start.
    ///
    /// Presence of a snapshot file implies a restart; absence implies a
    /// clean start.
    pub fn load_state(&self) -> Result<(Option<SystemStateSnapshot>, bool), SnapshotError> {
        let snapshot = self.store.load()?;
        let restart = snapshot.is_some();
        self.restart_detected.store(restart, Ordering::SeqCst);
        *self.loaded.lock().expect("restart mutex poisoned") = snapshot.clone();

        if restart {
            warn!(
                path = %self.store.path().display(),
                "Snapshot found on disk; restart detected, reconciliation required before trading"
            );
        } else {
            info!("No snapshot on disk; clean start");
        }
        Ok((snapshot, restart))
    }

    #[must_use]
    pub fn restart_detected(&self) -> bool {
        self.restart_detected.load(Ordering::SeqCst)
    }

    /// Compare the *loaded* snapshot against freshly fetched exchange
    /// truth. Must run (and be checked via
    /// [`assert_reconciliation_complete`](Self::assert_reconciliation_complete))
    /// before any new entries are enabled.
    pub fn reconcile_with_exchange(
        &self,
        exchange_positions: &[BrokerPosition],
        exchange_balances: &HashMap<String, Decimal>,
        exchange_open_orders: &[OpenOrder],
    ) -> RestartReport {
        let loaded = self.loaded.lock().expect("restart mutex poisoned").clone();

        let report = match loaded {
            None => {
                self.reconciled.store(true, Ordering::SeqCst);
                info!("Clean start; nothing to reconcile");
                RestartReport {
                    status: RestartStatus::CleanStart,
                    discrepancies: Vec::new(),
                    orphaned_orders: Vec::new(),
                    warnings: Vec::new(),
                }
            }
            Some(snapshot) => {
                let mut warnings = Vec::new();

                // Exchange truth in symbol space, with implied prices from
                // the exchange's own valuations.
                let mut exchange: HashMap<String, Decimal> = HashMap::new();
                let mut prices: HashMap<String, Decimal> = HashMap::new();
                for p in exchange_positions {
                    exchange.insert(p.symbol.clone(), p.quantity);
                    if !p.quantity.is_zero() {
                        prices.insert(p.symbol.clone(), p.usd_value / p.quantity);
                    }
                }
                for (asset, qty) in exchange_balances {
                    if asset == "USD" || qty.is_zero() {
                        continue;
                    }
                    exchange.entry(format!("{asset}-USD")).or_insert(*qty);
                }

                let internal: HashMap<String, Decimal> = snapshot
                    .positions
                    .iter()
                    .map(|p| (p.symbol.clone(), p.remaining_quantity()))
                    .collect();
                // Value snapshot-only symbols at their entry price so a
                // phantom position is not lost to the dust filter.
                for p in &snapshot.positions {
                    if !p.entry_price.is_zero() {
                        prices.entry(p.symbol.clone()).or_insert(p.entry_price);
                    }
                }
                for symbol in internal.keys() {
                    if !prices.contains_key(symbol) {
                        warnings.push(format!("no price available for {symbol}"));
                    }
                }

                let discrepancies =
                    classify_discrepancies(&exchange, &internal, &prices, &self.classify);

                let open_ids: Vec<&str> = exchange_open_orders
                    .iter()
                    .map(|o| o.order_id.as_str())
                    .collect();
                let orphaned_orders: Vec<PendingOrder> = snapshot
                    .pending_orders
                    .iter()
                    .filter(|o| !o.is_terminal() && !open_ids.contains(&o.id.as_str()))
                    .cloned()
                    .collect();

                for o in &orphaned_orders {
                    warn!(
                        order_id = %o.id,
                        symbol = %o.symbol,
                        status = %o.status,
                        "Pending order from snapshot missing from exchange open orders"
                    );
                }

                let status = if discrepancies.is_empty() && orphaned_orders.is_empty() {
                    RestartStatus::Clean
                } else {
                    RestartStatus::DiscrepanciesFound
                };

                self.reconciled.store(true, Ordering::SeqCst);
                info!(
                    status = %status,
                    discrepancies = discrepancies.len(),
                    orphaned_orders = orphaned_orders.len(),
                    "Restart reconciliation complete"
                );

                RestartReport {
                    status,
                    discrepancies,
                    orphaned_orders,
                    warnings,
                }
            }
        };
        report
    }

    /// Idempotency guard: false if this signal id was the last one acted
    /// on before the restart, true otherwise.
    #[must_use]
    pub fn prevent_duplicate(&self, signal_id: &str) -> bool {
        let loaded = self.loaded.lock().expect("restart mutex poisoned");
        match loaded.as_ref().and_then(|s| s.last_signal_id.as_deref()) {
            Some(last) if last == signal_id => {
                warn!(signal_id = signal_id, "Duplicate signal rejected after restart");
                false
            }
            _ => true,
        }
    }

    /// Errors unless reconciliation has run since this process started.
    /// Callers must check this before enabling any new entries; the
    /// reconcile-then-trade ordering is mandatory.
    pub fn assert_reconciliation_complete(&self) -> Result<(), RestartError> {
        if self.reconciled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RestartError::NotReconciled)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OrderStatus;
    use crate::ledger::{OrderId, Position};
    use crate::reconcile::snapshot::TradingState;
    use crate::reconcile::DiscrepancyKind;
    use crate::types::{ContainerId, OrderKind, OrderSide, PositionSide};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn manager(dir: &tempfile::TempDir) -> RestartManager {
        RestartManager::new(
            SnapshotStore::new(dir.path().join("state.json")),
            ClassifyConfig::default(),
        )
    }

    fn snapshot_with_btc() -> SystemStateSnapshot {
        let mut snapshot = SystemStateSnapshot::empty(TradingState::Running);
        snapshot.positions.push(Position::new(
            ContainerId::new("c1"),
            "BTC-USD",
            PositionSide::Long,
            dec!(0.01),
            dec!(50000),
            None,
        ));
        snapshot.last_signal_id = Some("sig-9".to_string());
        snapshot
    }

    #[test]
    fn test_clean_start_path() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let (snapshot, restart) = manager.load_state().unwrap();
        assert!(snapshot.is_none());
        assert!(!restart);

        assert!(manager.assert_reconciliation_complete().is_err());
        let report = manager.reconcile_with_exchange(&[], &HashMap::new(), &[]);
        assert_eq!(report.status, RestartStatus::CleanStart);
        assert!(manager.assert_reconciliation_complete().is_ok());
    }

    #[test]
    fn test_restart_clean_when_exchange_matches() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.save_state(&snapshot_with_btc()).unwrap();

        let (_, restart) = manager.load_state().unwrap();
        assert!(restart);

        let positions = vec![BrokerPosition {
            symbol: "BTC-USD".to_string(),
            quantity: dec!(0.01),
            usd_value: dec!(500),
        }];
        let report = manager.reconcile_with_exchange(&positions, &HashMap::new(), &[]);
        assert_eq!(report.status, RestartStatus::Clean);
        assert!(report.discrepancies.is_empty());
    }

    #[test]
    fn test_restart_detects_phantom_after_crash() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.save_state(&snapshot_with_btc()).unwrap();
        manager.load_state().unwrap();

        // A zero-quantity listing carries no exchange price; the delta is
        // valued at the snapshot's entry price instead.
        let report = manager.reconcile_with_exchange(
            &[BrokerPosition {
                symbol: "BTC-USD".to_string(),
                quantity: dec!(0),
                usd_value: dec!(0),
            }],
            &HashMap::new(),
            &[],
        );
        assert_eq!(report.status, RestartStatus::DiscrepanciesFound);
        assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::PhantomPosition);
        assert_eq!(report.discrepancies[0].usd_value, dec!(500));

        let report = manager.reconcile_with_exchange(
            &[BrokerPosition {
                symbol: "BTC-USD".to_string(),
                quantity: dec!(0.001),
                usd_value: dec!(50),
            }],
            &HashMap::new(),
            &[],
        );
        assert_eq!(report.status, RestartStatus::DiscrepanciesFound);
        assert_eq!(report.discrepancies[0].kind, DiscrepancyKind::PartialFillUntracked);
    }

    #[test]
    fn test_orphaned_orders_detected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);

        let mut snapshot = snapshot_with_btc();
        snapshot.pending_orders.push(PendingOrder::new(
            OrderId::new("ord-lost"),
            ContainerId::new("c1"),
            "BTC-USD",
            OrderSide::Sell,
            OrderKind::Market,
            OrderStatus::Submitted,
        ));
        manager.save_state(&snapshot).unwrap();
        manager.load_state().unwrap();

        let positions = vec![BrokerPosition {
            symbol: "BTC-USD".to_string(),
            quantity: dec!(0.01),
            usd_value: dec!(500),
        }];
        // The exchange lists a different open order; ours is orphaned.
        let open_orders = vec![OpenOrder {
            order_id: "ord-other".to_string(),
            symbol: "BTC-USD".to_string(),
            created_at: Utc::now(),
            value_usd: dec!(100),
        }];
        let report = manager.reconcile_with_exchange(&positions, &HashMap::new(), &open_orders);
        assert_eq!(report.status, RestartStatus::DiscrepanciesFound);
        assert_eq!(report.orphaned_orders.len(), 1);
        assert_eq!(report.orphaned_orders[0].id.as_str(), "ord-lost");
    }

    #[test]
    fn test_duplicate_signal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.save_state(&snapshot_with_btc()).unwrap();
        manager.load_state().unwrap();

        assert!(!manager.prevent_duplicate("sig-9"));
        assert!(manager.prevent_duplicate("sig-10"));
    }

    #[test]
    fn test_duplicate_guard_on_clean_start() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(&dir);
        manager.load_state().unwrap();
        assert!(manager.prevent_duplicate("sig-1"));
    }
}
