//! Atomic, idempotent position entry/exit against a broker.
//!
//! # Locking
//!
//! Exits for one (container, symbol) are serialized by the ledger's
//! close lock. `execute_exit` takes the [`CloseGuard`] by value, so the
//! compiler enforces that the lock is held and that both gates are
//! cleared when the call returns, whatever path it took out.
//!
//! # Timeouts
//!
//! Broker calls run under a bounded timeout. A timed-out exit order is
//! recorded as a pending order with unknown status and left for the
//! reconciliation watchdog; it is never guessed as success or failure.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::broker::{BrokerAdapter, BrokerError, OrderStatus};
use crate::capital::TradingContainer;
use crate::ledger::{CloseGuard, LedgerError, OrderId, PendingOrder, Position, PositionLedger};
use crate::record::{TradeEvent, TradeEventKind, TradeRecorder};
use crate::types::{ContainerId, OrderKind, PositionSide};

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    /// Deadline for a single broker call.
    pub broker_timeout: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            broker_timeout: Duration::from_secs(10),
        }
    }
}

/// Errors surfaced by the coordinator.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Quota denied: {0}")]
    QuotaDenied(String),

    #[error("Broker call failed: {0}")]
    Broker(#[from] BrokerError),

    /// The broker call timed out; the order outcome is unknown and has
    /// been handed to reconciliation. The position is unchanged.
    #[error("Order outcome unknown for {symbol}; deferred to reconciliation")]
    OutcomeUnknown { symbol: String },

    /// The broker acknowledged the order but did not confirm a fill; the
    /// position is unchanged until the fill is observed.
    #[error("Order {order_id} unconfirmed (status {status})")]
    Unconfirmed { order_id: String, status: String },
}

/// Result of a granted exit.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitOutcome {
    /// Position fully closed and removed from the ledger.
    Closed { pnl: Decimal },
    /// Position partially closed; this fraction of the original remains.
    Reduced { remaining: Decimal, pnl: Decimal },
    /// Another close was already in progress; nothing was done. Not an
    /// error: callers treat it as success-no-op and do not retry
    /// immediately.
    AlreadyInProgress,
}

/// Parameters for a new entry.
#[derive(Debug, Clone)]
pub struct EntryRequest {
    pub symbol: String,
    pub side: PositionSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub stop_loss: Option<Decimal>,
    pub reason: String,
}

/// Enforces at-most-once execution of closes and quota-checked entries.
pub struct ExecutionCoordinator {
    broker: Arc<dyn BrokerAdapter>,
    ledger: Arc<PositionLedger>,
    recorder: Arc<dyn TradeRecorder>,
    config: ExecutionConfig,
}

impl ExecutionCoordinator {
    #[must_use]
    pub fn new(
        broker: Arc<dyn BrokerAdapter>,
        ledger: Arc<PositionLedger>,
        recorder: Arc<dyn TradeRecorder>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            broker,
            ledger,
            recorder,
            config,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    /// Try to start a close for (container, symbol).
    ///
    /// Fails closed: `None` means a close or an unconfirmed exit order is
    /// already in flight and the caller must not proceed.
    #[must_use]
    pub fn acquire_close_lock(
        &self,
        container: &ContainerId,
        symbol: &str,
    ) -> Option<CloseGuard> {
        self.ledger.locks().try_acquire_close(container, symbol)
    }

    /// Close `fraction` of the remaining position under an already-held
    /// lock.
    ///
    /// The exit quantity is always derived from the ledger's own
    /// remaining quantity, never from caller-supplied state. On a
    /// confirmed full exit the position is deleted from the ledger before
    /// this function returns. The guard is consumed; both gates are clear
    /// on return regardless of outcome.
    pub async fn execute_exit(
        &self,
        guard: CloseGuard,
        container: &Arc<TradingContainer>,
        price: Decimal,
        fraction: Decimal,
        reason: &str,
    ) -> Result<ExitOutcome, ExecutionError> {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(LedgerError::InvalidFraction(fraction).into());
        }

        let symbol = guard.symbol().to_string();
        let container_id = guard.container().clone();
        debug_assert_eq!(
            &container_id,
            container.id(),
            "guard and container must refer to the same tenant"
        );
        let position = self
            .ledger
            .get_position(&container_id, &symbol)
            .ok_or_else(|| LedgerError::PositionNotFound {
                container: container_id.clone(),
                symbol: symbol.clone(),
            })?;

        let exit_qty = position.remaining_quantity() * fraction;
        let exit_side = position.side.exit_side();

        guard.mark_exit_order_active();

        let ack = match timeout(
            self.config.broker_timeout,
            self.broker
                .place_order(&symbol, exit_side, OrderKind::Market, exit_qty),
        )
        .await
        {
            Err(_elapsed) => {
                // Outcome unknown: neither success nor failure. Track the
                // attempt for reconciliation and leave the position alone.
                warn!(
                    container = %container_id,
                    symbol = %symbol,
                    quantity = %exit_qty,
                    timeout_ms = self.config.broker_timeout.as_millis() as u64,
                    "Exit order timed out; outcome unknown"
                );
                self.ledger.add_pending_order(PendingOrder::new(
                    OrderId::new(format!("unconfirmed-{}", uuid::Uuid::new_v4())),
                    container_id,
                    symbol.clone(),
                    exit_side,
                    OrderKind::Market,
                    OrderStatus::Unknown,
                ));
                return Err(ExecutionError::OutcomeUnknown { symbol });
            }
            Ok(Err(e)) => {
                error!(
                    container = %container_id,
                    symbol = %symbol,
                    quantity = %exit_qty,
                    error = %e,
                    "Exit order failed; position remains open"
                );
                return Err(e.into());
            }
            Ok(Ok(ack)) => ack,
        };

        match ack.status {
            OrderStatus::Filled => {}
            OrderStatus::Submitted | OrderStatus::Unknown => {
                // Acknowledged but not confirmed: track it and let the
                // watchdog resolve the fill.
                self.ledger.add_pending_order(PendingOrder::new(
                    OrderId::new(ack.order_id.clone()),
                    container_id,
                    symbol.clone(),
                    exit_side,
                    OrderKind::Market,
                    ack.status,
                ));
                return Err(ExecutionError::Unconfirmed {
                    order_id: ack.order_id,
                    status: ack.status.to_string(),
                });
            }
            OrderStatus::Cancelled | OrderStatus::Rejected => {
                return Err(ExecutionError::Broker(BrokerError::Rejected(format!(
                    "exit order {} {}",
                    ack.order_id, ack.status
                ))));
            }
        }

        // Confirmed fill: mutate ledger and capital before returning.
        let pnl = position.realized_pnl(price, exit_qty);
        let released_usd = position.remaining_size_usd() * fraction;
        let full_exit = PositionLedger::is_full_exit(position.remaining, fraction);

        let outcome = if full_exit {
            // Synchronous removal: the symbol is gone from the ledger
            // before this call returns, not after the next balance poll.
            self.ledger.remove_position(&container_id, &symbol)?;
            container.release_capital(released_usd, true);
            ExitOutcome::Closed { pnl }
        } else {
            let updated = self
                .ledger
                .apply_partial_exit(&container_id, &symbol, fraction)?;
            container.release_capital(released_usd, false);
            ExitOutcome::Reduced {
                remaining: updated.remaining,
                pnl,
            }
        };

        container.record_trade(pnl, pnl >= Decimal::ZERO);
        self.recorder
            .record(TradeEvent::new(
                TradeEventKind::Exit,
                container_id.clone(),
                symbol.clone(),
                exit_side,
                exit_qty,
                price,
                Some(pnl),
                reason,
            ))
            .await;

        info!(
            container = %container_id,
            symbol = %symbol,
            quantity = %exit_qty,
            price = %price,
            pnl = %pnl,
            full_exit = full_exit,
            reason = reason,
            "Exit confirmed"
        );
        Ok(outcome)
    }

    /// Acquire-then-exit convenience. Lock contention is a normal
    /// "already in progress" outcome, not an error.
    pub async fn try_close(
        &self,
        container: &Arc<TradingContainer>,
        symbol: &str,
        price: Decimal,
        fraction: Decimal,
        reason: &str,
    ) -> Result<ExitOutcome, ExecutionError> {
        match self.acquire_close_lock(container.id(), symbol) {
            Some(guard) => {
                self.execute_exit(guard, container, price, fraction, reason)
                    .await
            }
            None => Ok(ExitOutcome::AlreadyInProgress),
        }
    }

    /// Open a new position for a container.
    ///
    /// Rejections (existing position, quota denial) happen before any
    /// broker call. Capital is reserved before submission and rolled back
    /// if the order does not confirm.
    pub async fn register_entry(
        &self,
        container: &Arc<TradingContainer>,
        request: EntryRequest,
    ) -> Result<Position, ExecutionError> {
        let container_id = container.id().clone();
        if self.ledger.has_position(&container_id, &request.symbol) {
            return Err(LedgerError::PositionExists {
                container: container_id,
                symbol: request.symbol,
            }
            .into());
        }

        let size_usd = request.quantity * request.price;
        container
            .can_open_position(size_usd)
            .map_err(ExecutionError::QuotaDenied)?;
        container
            .allocate_capital(size_usd)
            .map_err(ExecutionError::QuotaDenied)?;

        let entry_side = request.side.entry_side();
        let placed = timeout(
            self.config.broker_timeout,
            self.broker
                .place_order(&request.symbol, entry_side, OrderKind::Market, request.quantity),
        )
        .await;

        let ack = match placed {
            Err(_elapsed) => {
                container.release_capital(size_usd, true);
                self.ledger.add_pending_order(PendingOrder::new(
                    OrderId::new(format!("unconfirmed-{}", uuid::Uuid::new_v4())),
                    container_id.clone(),
                    request.symbol.clone(),
                    entry_side,
                    OrderKind::Market,
                    OrderStatus::Unknown,
                ));
                warn!(
                    container = %container_id,
                    symbol = %request.symbol,
                    "Entry order timed out; outcome unknown"
                );
                return Err(ExecutionError::OutcomeUnknown {
                    symbol: request.symbol,
                });
            }
            Ok(Err(e)) => {
                container.release_capital(size_usd, true);
                warn!(
                    container = %container_id,
                    symbol = %request.symbol,
                    error = %e,
                    "Entry order failed"
                );
                return Err(e.into());
            }
            Ok(Ok(ack)) => ack,
        };

        if ack.status != OrderStatus::Filled {
            container.release_capital(size_usd, true);
            self.ledger.add_pending_order(PendingOrder::new(
                OrderId::new(ack.order_id.clone()),
                container_id.clone(),
                request.symbol.clone(),
                entry_side,
                OrderKind::Market,
                ack.status,
            ));
            return Err(ExecutionError::Unconfirmed {
                order_id: ack.order_id,
                status: ack.status.to_string(),
            });
        }

        let position = Position::new(
            container_id.clone(),
            request.symbol.clone(),
            request.side,
            request.quantity,
            request.price,
            request.stop_loss,
        );
        self.ledger.insert_position(position.clone())?;

        self.recorder
            .record(TradeEvent::new(
                TradeEventKind::Entry,
                container_id,
                request.symbol,
                entry_side,
                request.quantity,
                request.price,
                None,
                request.reason,
            ))
            .await;

        Ok(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use crate::capital::{CapitalEngine, Tier};
    use crate::record::MemoryRecorder;
    use rust_decimal_macros::dec;

    struct Fixture {
        coordinator: ExecutionCoordinator,
        broker: Arc<PaperBroker>,
        container: Arc<TradingContainer>,
    }

    async fn fixture() -> Fixture {
        let broker = Arc::new(PaperBroker::new());
        broker.fund_usd(dec!(100000)).await;
        broker.set_price("BTC-USD", dec!(50000)).await;

        let engine = CapitalEngine::default();
        let container = engine
            .create_container("alice", dec!(5000), Tier::Professional)
            .unwrap();

        let coordinator = ExecutionCoordinator::new(
            broker.clone() as Arc<dyn BrokerAdapter>,
            Arc::new(PositionLedger::new()),
            Arc::new(MemoryRecorder::new()),
            ExecutionConfig::default(),
        );
        Fixture {
            coordinator,
            broker,
            container,
        }
    }

    async fn open_btc(fx: &Fixture) -> Position {
        fx.coordinator
            .register_entry(
                &fx.container,
                EntryRequest {
                    symbol: "BTC-USD".to_string(),
                    side: PositionSide::Long,
                    quantity: dec!(0.01),
                    price: dec!(50000),
                    stop_loss: None,
                    reason: "test entry".to_string(),
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_partial_then_full_exit_scenario() {
        let fx = fixture().await;
        open_btc(&fx).await;
        assert_eq!(fx.broker.order_call_count(), 1);
        assert_eq!(fx.container.available_capital(), dec!(4500));

        // Half out.
        let outcome = fx
            .coordinator
            .try_close(&fx.container, "BTC-USD", dec!(50000), dec!(0.5), "take profit")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ExitOutcome::Reduced {
                remaining: dec!(0.5),
                pnl: dec!(0)
            }
        );
        let position = fx
            .coordinator
            .ledger()
            .get_position(fx.container.id(), "BTC-USD")
            .unwrap();
        assert_eq!(position.remaining, dec!(0.5));
        assert_eq!(fx.container.available_capital(), dec!(4750));

        // All the way out: position gone before the call returns.
        let outcome = fx
            .coordinator
            .try_close(&fx.container, "BTC-USD", dec!(50000), dec!(1), "flatten")
            .await
            .unwrap();
        assert!(matches!(outcome, ExitOutcome::Closed { .. }));
        assert!(fx
            .coordinator
            .ledger()
            .get_position(fx.container.id(), "BTC-USD")
            .is_none());
        assert!(fx
            .coordinator
            .ledger()
            .locks()
            .gates_clear(fx.container.id(), "BTC-USD"));
        assert_eq!(fx.broker.order_call_count(), 3);
        assert_eq!(fx.container.available_capital(), dec!(5000));
    }

    #[tokio::test]
    async fn test_contended_close_is_noop() {
        let fx = fixture().await;
        open_btc(&fx).await;

        let _held = fx
            .coordinator
            .acquire_close_lock(fx.container.id(), "BTC-USD")
            .unwrap();
        let outcome = fx
            .coordinator
            .try_close(&fx.container, "BTC-USD", dec!(50000), dec!(1), "stop")
            .await
            .unwrap();
        assert_eq!(outcome, ExitOutcome::AlreadyInProgress);
        // Only the entry hit the broker.
        assert_eq!(fx.broker.order_call_count(), 1);
    }

    #[tokio::test]
    async fn test_broker_failure_releases_gates_and_keeps_position() {
        let fx = fixture().await;
        open_btc(&fx).await;
        fx.broker.set_fail_orders(true);

        let result = fx
            .coordinator
            .try_close(&fx.container, "BTC-USD", dec!(50000), dec!(1), "stop")
            .await;
        assert!(matches!(result, Err(ExecutionError::Broker(_))));

        // Position intact, gates clear, capital untouched.
        assert!(fx
            .coordinator
            .ledger()
            .has_position(fx.container.id(), "BTC-USD"));
        assert!(fx
            .coordinator
            .ledger()
            .locks()
            .gates_clear(fx.container.id(), "BTC-USD"));
        assert_eq!(fx.container.available_capital(), dec!(4500));

        // Retryable on the next cycle once the broker recovers.
        fx.broker.set_fail_orders(false);
        let outcome = fx
            .coordinator
            .try_close(&fx.container, "BTC-USD", dec!(50000), dec!(1), "stop")
            .await
            .unwrap();
        assert!(matches!(outcome, ExitOutcome::Closed { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_entry_rejected_before_broker() {
        let fx = fixture().await;
        open_btc(&fx).await;
        let calls_before = fx.broker.order_call_count();

        let result = fx
            .coordinator
            .register_entry(
                &fx.container,
                EntryRequest {
                    symbol: "BTC-USD".to_string(),
                    side: PositionSide::Long,
                    quantity: dec!(0.01),
                    price: dec!(50000),
                    stop_loss: None,
                    reason: "dup".to_string(),
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(ExecutionError::Ledger(LedgerError::PositionExists { .. }))
        ));
        assert_eq!(fx.broker.order_call_count(), calls_before);
    }

    #[tokio::test]
    async fn test_quota_denied_before_broker() {
        let fx = fixture().await;
        fx.broker.set_price("ETH-USD", dec!(3000)).await;

        // 10 ETH = $30k > $5k container allocation.
        let result = fx
            .coordinator
            .register_entry(
                &fx.container,
                EntryRequest {
                    symbol: "ETH-USD".to_string(),
                    side: PositionSide::Long,
                    quantity: dec!(10),
                    price: dec!(3000),
                    stop_loss: None,
                    reason: "too big".to_string(),
                },
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::QuotaDenied(_))));
        assert_eq!(fx.broker.order_call_count(), 0);
    }

    #[tokio::test]
    async fn test_entry_failure_rolls_back_capital() {
        let fx = fixture().await;
        fx.broker.set_fail_orders(true);

        let result = fx
            .coordinator
            .register_entry(
                &fx.container,
                EntryRequest {
                    symbol: "BTC-USD".to_string(),
                    side: PositionSide::Long,
                    quantity: dec!(0.01),
                    price: dec!(50000),
                    stop_loss: None,
                    reason: "entry".to_string(),
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(fx.container.available_capital(), dec!(5000));
        assert_eq!(fx.container.snapshot().open_positions, 0);
    }
}
