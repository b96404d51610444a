//! Per-(container × broker) trading worker.
//!
//! Consumes strategy signals from a channel, enforces the
//! reconcile-before-trade gate and the duplicate-signal guard, routes
//! entries through the capital checks and exits through the close lock,
//! and persists a snapshot after every state-changing operation.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::BrokerAdapter;
use crate::capital::TradingContainer;
use crate::emergency::SymbolResolver;
use crate::execution::{EntryRequest, ExecutionCoordinator, ExecutionError, ExitOutcome};
use crate::ledger::PositionLedger;
use crate::reconcile::{RestartError, RestartManager, SystemStateSnapshot, TradingState};
use crate::resilience::CircuitBreaker;
use crate::signal::{StopPolicy, TradeSignal};

use super::supervisor::RestartPolicy;

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Interval between stop-evaluation cycles.
    pub tick_interval: Duration,
    /// Consecutive broker failures before the breaker opens.
    pub breaker_threshold: u32,
    /// How long the breaker stays open before probing.
    pub breaker_cooldown: Duration,
    pub stop_policy: StopPolicy,
    /// Backoff applied between cycles while the broker is unhealthy.
    pub backoff: RestartPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
            stop_policy: StopPolicy::default(),
            backoff: RestartPolicy::default(),
        }
    }
}

/// Fatal worker errors; recoverable broker failures are absorbed by the
/// breaker and retried on later cycles.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Restart(#[from] RestartError),
}

/// One tenant's trading loop against one broker.
pub struct TradingWorker {
    container: Arc<TradingContainer>,
    broker: Arc<dyn BrokerAdapter>,
    coordinator: Arc<ExecutionCoordinator>,
    restart: Arc<RestartManager>,
    resolver: Arc<SymbolResolver>,
    breaker: CircuitBreaker,
    config: WorkerConfig,
    last_signal_id: Option<String>,
    last_trade_id: Option<String>,
    consecutive_cycle_failures: u32,
}

impl TradingWorker {
    #[must_use]
    pub fn new(
        container: Arc<TradingContainer>,
        broker: Arc<dyn BrokerAdapter>,
        coordinator: Arc<ExecutionCoordinator>,
        restart: Arc<RestartManager>,
        resolver: Arc<SymbolResolver>,
        config: WorkerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        Self {
            container,
            broker,
            coordinator,
            restart,
            resolver,
            breaker,
            config,
            last_signal_id: None,
            last_trade_id: None,
            consecutive_cycle_failures: 0,
        }
    }

    /// Run until the signal channel closes.
    ///
    /// Errors immediately if restart reconciliation has not completed:
    /// reconcile-then-trade is mandatory, not advisory.
    pub async fn run(
        mut self,
        mut signals: mpsc::Receiver<TradeSignal>,
    ) -> Result<(), WorkerError> {
        self.restart.assert_reconciliation_complete()?;
        info!(
            container = %self.container.id(),
            tick_secs = self.config.tick_interval.as_secs(),
            "Trading worker started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        loop {
            tokio::select! {
                maybe_signal = signals.recv() => {
                    match maybe_signal {
                        Some(signal) => self.handle_signal(signal).await,
                        None => {
                            info!(container = %self.container.id(), "Signal channel closed; worker stopping");
                            return Ok(());
                        }
                    }
                }
                _ = ticker.tick() => {
                    self.evaluate_stops().await;
                    self.apply_backoff().await;
                }
            }
        }
    }

    async fn handle_signal(&mut self, signal: TradeSignal) {
        // Replay guard across restarts, then within this session.
        if !self.restart.prevent_duplicate(&signal.signal_id) {
            return;
        }
        if self.last_signal_id.as_deref() == Some(signal.signal_id.as_str()) {
            warn!(signal_id = %signal.signal_id, "Duplicate signal within session; skipped");
            return;
        }
        if !self.container.consume_api_call() {
            warn!(
                container = %self.container.id(),
                signal_id = %signal.signal_id,
                "API quota exhausted; signal dropped"
            );
            return;
        }
        if !self.breaker.allow_request() {
            warn!(
                container = %self.container.id(),
                signal_id = %signal.signal_id,
                "Broker circuit open; signal dropped"
            );
            return;
        }

        let price = match self.resolver.resolve_price(&self.broker, &signal.symbol).await {
            Ok(p) => p,
            Err(e) => {
                self.breaker.record_failure();
                warn!(symbol = %signal.symbol, error = %e, "No price for signal; skipped");
                return;
            }
        };
        if price.is_zero() {
            warn!(symbol = %signal.symbol, "Zero price; signal skipped");
            return;
        }

        let quantity = signal.size_usd / price;
        let request = EntryRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            quantity,
            price,
            stop_loss: signal.stop_loss,
            reason: signal.reason.clone(),
        };

        match self.coordinator.register_entry(&self.container, request).await {
            Ok(position) => {
                self.breaker.record_success();
                self.last_signal_id = Some(signal.signal_id.clone());
                self.last_trade_id = Some(format!("entry-{}", signal.signal_id));
                info!(
                    container = %self.container.id(),
                    symbol = %position.symbol,
                    quantity = %position.quantity,
                    price = %price,
                    signal_id = %signal.signal_id,
                    "Entry filled"
                );
                self.persist_snapshot().await;
            }
            Err(ExecutionError::Broker(e)) => {
                self.breaker.record_failure();
                warn!(signal_id = %signal.signal_id, error = %e, "Entry failed at broker");
            }
            Err(ExecutionError::OutcomeUnknown { symbol }) => {
                self.breaker.record_failure();
                // The pending order is already tracked; reconciliation
                // owns it from here.
                warn!(symbol = %symbol, "Entry outcome unknown; deferred to reconciliation");
                self.persist_snapshot().await;
            }
            Err(e) => {
                // Local rejections (quota, duplicate position) are normal
                // outcomes, not broker health events.
                info!(signal_id = %signal.signal_id, reason = %e, "Entry rejected");
            }
        }
    }

    /// Evaluate the stop predicate over this container's open positions.
    async fn evaluate_stops(&mut self) {
        let mut cycle_failed = false;

        for position in self
            .coordinator
            .ledger()
            .positions_for_container(self.container.id())
        {
            if self.resolver.is_excluded(&position.symbol) {
                continue;
            }
            if !self.breaker.allow_request() {
                return;
            }

            let price = match self.resolver.resolve_price(&self.broker, &position.symbol).await {
                Ok(p) => p,
                Err(_) => {
                    self.breaker.record_failure();
                    cycle_failed = true;
                    continue;
                }
            };
            self.breaker.record_success();

            if !self.config.stop_policy.should_stop(&position, price) {
                continue;
            }
            info!(
                container = %self.container.id(),
                symbol = %position.symbol,
                price = %price,
                "Stop triggered"
            );

            match self
                .coordinator
                .try_close(&self.container, &position.symbol, price, Decimal::ONE, "stop loss")
                .await
            {
                Ok(ExitOutcome::AlreadyInProgress) => {
                    // Another path is closing it; success-no-op.
                }
                Ok(_) => {
                    self.last_trade_id = Some(format!("stop-{}", position.symbol));
                    self.persist_snapshot().await;
                }
                Err(ExecutionError::Broker(e)) => {
                    self.breaker.record_failure();
                    cycle_failed = true;
                    error!(symbol = %position.symbol, error = %e, "Stop exit failed; will retry");
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "Stop exit not completed");
                }
            }
        }

        if cycle_failed {
            self.consecutive_cycle_failures += 1;
        } else {
            self.consecutive_cycle_failures = 0;
        }
    }

    /// Sleep with jittered exponential backoff while the broker is
    /// unhealthy, so a dead venue is not hammered every tick.
    async fn apply_backoff(&self) {
        if self.consecutive_cycle_failures == 0 {
            return;
        }
        let delay = self
            .config
            .backoff
            .calculate_delay(self.consecutive_cycle_failures.saturating_sub(1));
        warn!(
            container = %self.container.id(),
            failures = self.consecutive_cycle_failures,
            delay_ms = delay.as_millis() as u64,
            "Backing off after failed cycle"
        );
        tokio::time::sleep(delay).await;
    }

    /// Write the system snapshot after a state-changing operation.
    async fn persist_snapshot(&self) {
        let snapshot = build_snapshot(
            self.coordinator.ledger(),
            TradingState::Running,
            &self.broker,
            self.last_trade_id.clone(),
            self.last_signal_id.clone(),
        )
        .await;
        if let Err(e) = self.restart.save_state(&snapshot) {
            error!(error = %e, "Snapshot save failed");
        }
    }
}

/// Assemble a snapshot from the ledger and current broker balances.
pub(crate) async fn build_snapshot(
    ledger: &Arc<PositionLedger>,
    trading_state: TradingState,
    broker: &Arc<dyn BrokerAdapter>,
    last_trade_id: Option<String>,
    last_signal_id: Option<String>,
) -> SystemStateSnapshot {
    let mut snapshot = SystemStateSnapshot::empty(trading_state);
    snapshot.positions = ledger.all_positions();
    snapshot.pending_orders = ledger.pending_orders();
    snapshot.last_trade_id = last_trade_id;
    snapshot.last_signal_id = last_signal_id;
    if let Ok(balances) = broker.get_balances().await {
        snapshot.balances = balances;
    }
    snapshot
}
