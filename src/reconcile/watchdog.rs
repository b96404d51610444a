//! Reconciliation watchdog.
//!
//! Periodically diffs broker truth against the ledger, classifies the
//! mismatches and, only when explicitly enabled, drives corrective
//! action. The default posture is alert-only: the watchdog must never
//! silently move money.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::broker::{BrokerAdapter, BrokerError};
use crate::capital::TradingContainer;
use crate::ledger::{Position, PositionLedger};
use crate::record::{TradeEvent, TradeEventKind, TradeRecorder};
use crate::types::{ContainerId, OrderKind, OrderSide, PositionSide};

/// Classified ledger-vs-exchange mismatch for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscrepancyKind {
    /// Exchange holds it, the ledger does not.
    OrphanedAsset,
    /// The ledger holds it, the exchange does not.
    PhantomPosition,
    /// Both hold it with a small size difference.
    SizeMismatch,
    /// Exchange-only holding on a known airdrop/fork ticker.
    AirdropDetected,
    /// Both hold it and the difference exceeds the partial-fill bound.
    PartialFillUntracked,
}

impl std::fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OrphanedAsset => write!(f, "ORPHANED_ASSET"),
            Self::PhantomPosition => write!(f, "PHANTOM_POSITION"),
            Self::SizeMismatch => write!(f, "SIZE_MISMATCH"),
            Self::AirdropDetected => write!(f, "AIRDROP_DETECTED"),
            Self::PartialFillUntracked => write!(f, "PARTIAL_FILL_UNTRACKED"),
        }
    }
}

/// What to do about a discrepancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationAction {
    /// Bring the holding into the ledger at the current price.
    Adopt,
    /// Market-sell the exchange-side holding.
    Liquidate,
    /// Correct the ledger to exchange truth.
    Adjust,
    /// Log and do nothing.
    AlertOnly,
}

impl std::fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Adopt => write!(f, "ADOPT"),
            Self::Liquidate => write!(f, "LIQUIDATE"),
            Self::Adjust => write!(f, "ADJUST"),
            Self::AlertOnly => write!(f, "ALERT_ONLY"),
        }
    }
}

/// One detected mismatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Discrepancy {
    pub symbol: String,
    pub kind: DiscrepancyKind,
    pub exchange_balance: Decimal,
    pub internal_balance: Decimal,
    /// USD value of the balance delta.
    pub usd_value: Decimal,
    pub recommended: ReconciliationAction,
    /// What was actually done. Stays `AlertOnly` unless auto-actions are
    /// enabled and the correction succeeded.
    pub action_taken: ReconciliationAction,
    pub detected_at: DateTime<Utc>,
}

/// Thresholds for classification.
#[derive(Debug, Clone)]
pub struct ClassifyConfig {
    /// Deltas below this USD value are ignored entirely.
    pub dust_threshold_usd: Decimal,
    /// Orphaned value at or above this is worth adopting.
    pub adopt_threshold_usd: Decimal,
    /// Orphaned value at or above this (but under adopt) is liquidated.
    pub liquidate_threshold_usd: Decimal,
    /// Relative size difference separating SIZE_MISMATCH from
    /// PARTIAL_FILL_UNTRACKED.
    pub relative_diff_threshold: Decimal,
    /// Tickers known to appear from airdrops/forks.
    pub known_airdrop_tickers: HashSet<String>,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            dust_threshold_usd: dec!(1),
            adopt_threshold_usd: dec!(100),
            liquidate_threshold_usd: dec!(10),
            relative_diff_threshold: dec!(0.10),
            known_airdrop_tickers: ["FLR-USD", "SGB-USD"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Interval between periodic passes.
    pub interval: Duration,
    /// Corrective actions run only when true; otherwise everything is
    /// alert-only regardless of classification.
    pub enable_auto_actions: bool,
    /// How long detected discrepancies are retained for inspection.
    pub retention: Duration,
    pub classify: ClassifyConfig,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            enable_auto_actions: false,
            retention: Duration::from_secs(24 * 3600),
            classify: ClassifyConfig::default(),
        }
    }
}

/// Classify the mismatch between exchange balances and internal
/// positions, both keyed by symbol. Pure: two calls on unchanged inputs
/// produce the same discrepancy set.
pub fn classify_discrepancies(
    exchange: &HashMap<String, Decimal>,
    internal: &HashMap<String, Decimal>,
    prices: &HashMap<String, Decimal>,
    config: &ClassifyConfig,
) -> Vec<Discrepancy> {
    let mut symbols: Vec<&String> = exchange.keys().chain(internal.keys()).collect();
    symbols.sort();
    symbols.dedup();

    let mut discrepancies = Vec::new();
    for symbol in symbols {
        let exchange_qty = exchange.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let internal_qty = internal.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let delta = exchange_qty - internal_qty;
        if delta.is_zero() {
            continue;
        }

        let price = prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let usd_value = delta.abs() * price;
        if usd_value < config.dust_threshold_usd {
            continue;
        }

        let (kind, recommended) = if exchange_qty > Decimal::ZERO && internal_qty.is_zero() {
            if config.known_airdrop_tickers.contains(symbol) {
                (DiscrepancyKind::AirdropDetected, ReconciliationAction::Adopt)
            } else if usd_value >= config.adopt_threshold_usd {
                (DiscrepancyKind::OrphanedAsset, ReconciliationAction::Adopt)
            } else if usd_value >= config.liquidate_threshold_usd {
                (DiscrepancyKind::OrphanedAsset, ReconciliationAction::Liquidate)
            } else {
                (DiscrepancyKind::OrphanedAsset, ReconciliationAction::AlertOnly)
            }
        } else if internal_qty > Decimal::ZERO && exchange_qty.is_zero() {
            (DiscrepancyKind::PhantomPosition, ReconciliationAction::Adjust)
        } else {
            let relative = delta.abs() / internal_qty.max(exchange_qty);
            if relative > config.relative_diff_threshold {
                (
                    DiscrepancyKind::PartialFillUntracked,
                    ReconciliationAction::Adjust,
                )
            } else {
                (DiscrepancyKind::SizeMismatch, ReconciliationAction::Adjust)
            }
        };

        discrepancies.push(Discrepancy {
            symbol: symbol.clone(),
            kind,
            exchange_balance: exchange_qty,
            internal_balance: internal_qty,
            usd_value,
            recommended,
            action_taken: ReconciliationAction::AlertOnly,
            detected_at: Utc::now(),
        });
    }
    discrepancies
}

/// Periodic ledger-vs-exchange auditor.
pub struct ReconciliationWatchdog {
    config: WatchdogConfig,
    ledger: Arc<PositionLedger>,
    recorder: Arc<dyn TradeRecorder>,
    history: RwLock<Vec<Discrepancy>>,
}

impl ReconciliationWatchdog {
    #[must_use]
    pub fn new(
        config: WatchdogConfig,
        ledger: Arc<PositionLedger>,
        recorder: Arc<dyn TradeRecorder>,
    ) -> Self {
        Self {
            config,
            ledger,
            recorder,
            history: RwLock::new(Vec::new()),
        }
    }

    /// Classify and log the mismatch between the given exchange balances
    /// and internal positions for one container. Does not touch the
    /// ledger or the broker.
    pub fn reconcile(
        &self,
        exchange_balances: &HashMap<String, Decimal>,
        internal_positions: &HashMap<String, Decimal>,
        prices: &HashMap<String, Decimal>,
        container_id: &ContainerId,
    ) -> Vec<Discrepancy> {
        let discrepancies = classify_discrepancies(
            exchange_balances,
            internal_positions,
            prices,
            &self.config.classify,
        );

        for d in &discrepancies {
            warn!(
                container = %container_id,
                symbol = %d.symbol,
                kind = %d.kind,
                exchange = %d.exchange_balance,
                internal = %d.internal_balance,
                usd_value = %d.usd_value,
                recommended = %d.recommended,
                "Discrepancy detected"
            );
        }
        discrepancies
    }

    /// One full pass for a container: fetch broker truth, classify, and
    /// (only if enabled) execute corrective actions.
    pub async fn run_once(
        &self,
        container: &Arc<TradingContainer>,
        broker: &Arc<dyn BrokerAdapter>,
    ) -> Result<Vec<Discrepancy>, BrokerError> {
        let balances = broker.get_balances().await?;

        // Exchange balances arrive keyed by asset; compare in symbol
        // space against the ledger's quote pairs.
        let mut exchange: HashMap<String, Decimal> = HashMap::new();
        for (asset, qty) in &balances {
            if asset == "USD" || qty.is_zero() {
                continue;
            }
            exchange.insert(format!("{asset}-USD"), *qty);
        }

        let internal = self.ledger.internal_balances(container.id());

        let mut prices = HashMap::new();
        for symbol in exchange.keys().chain(internal.keys()) {
            if prices.contains_key(symbol) {
                continue;
            }
            match broker.get_current_price(symbol).await {
                Ok(price) => {
                    prices.insert(symbol.clone(), price);
                }
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "No price during reconciliation");
                }
            }
        }

        let mut discrepancies = self.reconcile(&exchange, &internal, &prices, container.id());

        if self.config.enable_auto_actions {
            for d in &mut discrepancies {
                self.apply_action(d, container, broker, &prices).await;
            }
        }

        self.resolve_stale_pending_orders(container, broker).await?;

        self.record_history(&discrepancies).await;
        Ok(discrepancies)
    }

    /// Clear pending orders that no longer appear in the exchange's
    /// open-order list. Their financial effect, if any, has just been
    /// captured by the balance diff above, so the record is resolved
    /// rather than left dangling.
    async fn resolve_stale_pending_orders(
        &self,
        container: &Arc<TradingContainer>,
        broker: &Arc<dyn BrokerAdapter>,
    ) -> Result<(), BrokerError> {
        let open_orders = broker.get_open_orders().await?;
        for pending in self.ledger.pending_orders() {
            if &pending.container != container.id() || pending.is_terminal() {
                continue;
            }
            let still_open = open_orders
                .iter()
                .any(|o| o.order_id == pending.id.as_str());
            if !still_open {
                warn!(
                    order_id = %pending.id,
                    symbol = %pending.symbol,
                    last_status = %pending.status,
                    "Pending order absent from exchange; resolved by reconciliation"
                );
                self.ledger
                    .update_pending_order(&pending.id, crate::broker::OrderStatus::Cancelled);
            }
        }
        Ok(())
    }

    /// Execute the recommended action for one discrepancy, under the same
    /// per-symbol close lock as live exits.
    async fn apply_action(
        &self,
        d: &mut Discrepancy,
        container: &Arc<TradingContainer>,
        broker: &Arc<dyn BrokerAdapter>,
        prices: &HashMap<String, Decimal>,
    ) {
        if d.recommended == ReconciliationAction::AlertOnly {
            return;
        }

        // Never race a live exit: skip this round if the symbol is mid-close.
        let guard = match self
            .ledger
            .locks()
            .try_acquire_close(container.id(), &d.symbol)
        {
            Some(g) => g,
            None => {
                info!(
                    symbol = %d.symbol,
                    recommended = %d.recommended,
                    "Symbol locked by live exit; deferring corrective action"
                );
                return;
            }
        };

        let applied = match d.recommended {
            ReconciliationAction::Adopt => self.adopt(d, container, prices).await,
            ReconciliationAction::Liquidate => self.liquidate(d, broker).await,
            ReconciliationAction::Adjust => self.adjust(d, container).await,
            ReconciliationAction::AlertOnly => false,
        };
        drop(guard);

        if applied {
            d.action_taken = d.recommended;
            self.recorder
                .record(TradeEvent::new(
                    TradeEventKind::Reconciliation,
                    container.id().clone(),
                    d.symbol.clone(),
                    OrderSide::Sell,
                    (d.exchange_balance - d.internal_balance).abs(),
                    prices.get(&d.symbol).copied().unwrap_or(Decimal::ZERO),
                    None,
                    d.recommended.to_string(),
                ))
                .await;
        }
    }

    async fn adopt(
        &self,
        d: &Discrepancy,
        container: &Arc<TradingContainer>,
        prices: &HashMap<String, Decimal>,
    ) -> bool {
        let Some(price) = prices.get(&d.symbol).copied() else {
            warn!(symbol = %d.symbol, "Cannot adopt without a price");
            return false;
        };
        let size_usd = d.exchange_balance * price;
        if let Err(reason) = container.can_open_position(size_usd) {
            warn!(symbol = %d.symbol, reason = reason, "Adoption denied by container quota");
            return false;
        }
        if container.allocate_capital(size_usd).is_err() {
            return false;
        }
        let position = Position::new(
            container.id().clone(),
            d.symbol.clone(),
            PositionSide::Long,
            d.exchange_balance,
            price,
            None,
        );
        match self.ledger.insert_position(position) {
            Ok(()) => {
                info!(symbol = %d.symbol, quantity = %d.exchange_balance, "Orphaned asset adopted");
                true
            }
            Err(e) => {
                container.release_capital(size_usd, true);
                warn!(symbol = %d.symbol, error = %e, "Adoption failed");
                false
            }
        }
    }

    async fn liquidate(&self, d: &Discrepancy, broker: &Arc<dyn BrokerAdapter>) -> bool {
        match broker
            .place_order(&d.symbol, OrderSide::Sell, OrderKind::Market, d.exchange_balance)
            .await
        {
            Ok(ack) => {
                info!(
                    symbol = %d.symbol,
                    order_id = %ack.order_id,
                    quantity = %d.exchange_balance,
                    "Orphaned asset liquidated"
                );
                true
            }
            Err(e) => {
                error!(symbol = %d.symbol, error = %e, "Liquidation failed");
                false
            }
        }
    }

    async fn adjust(&self, d: &Discrepancy, container: &Arc<TradingContainer>) -> bool {
        if d.kind == DiscrepancyKind::PhantomPosition {
            match self.ledger.remove_position(container.id(), &d.symbol) {
                Ok(position) => {
                    container.release_capital(position.remaining_size_usd(), true);
                    warn!(symbol = %d.symbol, "Phantom position cleared from ledger");
                    true
                }
                Err(_) => false,
            }
        } else {
            let before = self.ledger.get_position(container.id(), &d.symbol);
            match self
                .ledger
                .adjust_quantity(container.id(), &d.symbol, d.exchange_balance)
            {
                Ok(after) => {
                    if let Some(before) = before {
                        let freed = before.remaining_size_usd() - after.remaining_size_usd();
                        if freed > Decimal::ZERO {
                            container.release_capital(freed, false);
                        }
                    }
                    true
                }
                Err(e) => {
                    warn!(symbol = %d.symbol, error = %e, "Adjust failed");
                    false
                }
            }
        }
    }

    /// Discrepancies seen within the retention window.
    pub async fn history(&self) -> Vec<Discrepancy> {
        self.history.read().await.clone()
    }

    async fn record_history(&self, new: &[Discrepancy]) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::hours(24));
        let mut history = self.history.write().await;
        history.extend_from_slice(new);
        history.retain(|d| d.detected_at >= cutoff);
    }

    /// Spawn the periodic pass. Returns the task handle for shutdown.
    pub fn start_periodic(
        self: Arc<Self>,
        container: Arc<TradingContainer>,
        broker: Arc<dyn BrokerAdapter>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately; skip it so startup
            // reconciliation stays with the restart manager.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_once(&container, &broker).await {
                    Ok(discrepancies) if !discrepancies.is_empty() => {
                        info!(
                            container = %container.id(),
                            count = discrepancies.len(),
                            "Periodic reconciliation found discrepancies"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        // Broker failure degrades to alert-only; trading
                        // is not blocked by a failed audit pass.
                        error!(container = %container.id(), error = %e, "Reconciliation pass failed");
                    }
                }
            }
        })
    }
}
