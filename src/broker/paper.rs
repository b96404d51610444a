//! In-memory paper broker.
//!
//! Simulated execution backend for paper trading and tests. Fills market
//! orders instantly at the injected price, keeps balances/positions in
//! memory, and exposes fail-switches so tests can exercise the engine's
//! failure paths without a live venue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::{BrokerAdapter, BrokerError, BrokerPosition, OpenOrder, OrderAck, OrderStatus};
use crate::types::{OrderKind, OrderSide};

#[derive(Debug, Default)]
struct PaperBook {
    /// Asset ticker -> balance in base units.
    balances: HashMap<String, Decimal>,
    /// Symbol -> open quantity.
    positions: HashMap<String, Decimal>,
    /// Symbol -> last price.
    prices: HashMap<String, Decimal>,
    /// Orders still open on the simulated venue.
    open_orders: Vec<OpenOrder>,
}

/// Paper trading broker with instant fills.
pub struct PaperBroker {
    book: RwLock<PaperBook>,
    /// When set, all order placements fail with a network error.
    fail_orders: AtomicBool,
    /// When set, all price fetches fail.
    fail_prices: AtomicBool,
    /// Total `place_order` invocations (including failed ones).
    order_calls: AtomicU64,
}

impl PaperBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            book: RwLock::new(PaperBook::default()),
            fail_orders: AtomicBool::new(false),
            fail_prices: AtomicBool::new(false),
            order_calls: AtomicU64::new(0),
        }
    }

    /// Seed a USD cash balance.
    pub async fn fund_usd(&self, amount: Decimal) {
        let mut book = self.book.write().await;
        *book.balances.entry("USD".to_string()).or_insert(Decimal::ZERO) += amount;
    }

    /// Set the simulated price for a symbol.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        let mut book = self.book.write().await;
        book.prices.insert(symbol.to_string(), price);
    }

    /// Seed an exchange-side position (for reconciliation scenarios).
    pub async fn set_position(&self, symbol: &str, quantity: Decimal) {
        let mut book = self.book.write().await;
        if quantity.is_zero() {
            book.positions.remove(symbol);
        } else {
            book.positions.insert(symbol.to_string(), quantity);
        }
    }

    /// Seed an asset balance directly.
    pub async fn set_balance(&self, asset: &str, quantity: Decimal) {
        let mut book = self.book.write().await;
        book.balances.insert(asset.to_string(), quantity);
    }

    /// Make subsequent order placements fail (or recover).
    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent price fetches fail (or recover).
    pub fn set_fail_prices(&self, fail: bool) {
        self.fail_prices.store(fail, Ordering::SeqCst);
    }

    /// Number of `place_order` calls seen so far.
    #[must_use]
    pub fn order_call_count(&self) -> u64 {
        self.order_calls.load(Ordering::SeqCst)
    }

    /// Base asset of a symbol like "BTC-USD" -> "BTC".
    fn base_asset(symbol: &str) -> &str {
        symbol.split('-').next().unwrap_or(symbol)
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, BrokerError> {
        let book = self.book.read().await;
        Ok(book.balances.clone())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError> {
        let book = self.book.read().await;
        Ok(book
            .positions
            .iter()
            .map(|(symbol, qty)| {
                let price = book.prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
                BrokerPosition {
                    symbol: symbol.clone(),
                    quantity: *qty,
                    usd_value: *qty * price,
                }
            })
            .collect())
    }

    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError> {
        let book = self.book.read().await;
        Ok(book.open_orders.clone())
    }

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, BrokerError> {
        if self.fail_prices.load(Ordering::SeqCst) {
            return Err(BrokerError::PriceUnavailable(symbol.to_string()));
        }
        let book = self.book.read().await;
        book.prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::PriceUnavailable(symbol.to_string()))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        size: Decimal,
    ) -> Result<OrderAck, BrokerError> {
        self.order_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(BrokerError::Network("paper broker forced failure".to_string()));
        }
        if size <= Decimal::ZERO {
            return Err(BrokerError::Rejected(format!("Invalid size: {}", size)));
        }
        if kind != OrderKind::Market {
            // Paper venue only fills market orders; resting orders are not simulated.
            return Err(BrokerError::Unsupported("non-market orders"));
        }

        let mut book = self.book.write().await;
        let price = book
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BrokerError::PriceUnavailable(symbol.to_string()))?;
        let notional = size * price;
        let base = Self::base_asset(symbol).to_string();

        match side {
            OrderSide::Buy => {
                let cash = book.balances.entry("USD".to_string()).or_insert(Decimal::ZERO);
                if *cash < notional {
                    return Err(BrokerError::Rejected(format!(
                        "Insufficient USD: have {}, need {}",
                        cash, notional
                    )));
                }
                *cash -= notional;
                *book.positions.entry(symbol.to_string()).or_insert(Decimal::ZERO) += size;
                *book.balances.entry(base).or_insert(Decimal::ZERO) += size;
            }
            OrderSide::Sell => {
                let held = book
                    .positions
                    .get(symbol)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                if held < size {
                    return Err(BrokerError::Rejected(format!(
                        "Insufficient {}: have {}, need {}",
                        symbol, held, size
                    )));
                }
                let remaining = held - size;
                if remaining.is_zero() {
                    book.positions.remove(symbol);
                } else {
                    book.positions.insert(symbol.to_string(), remaining);
                }
                let bal = book.balances.entry(base).or_insert(Decimal::ZERO);
                *bal = (*bal - size).max(Decimal::ZERO);
                *book.balances.entry("USD".to_string()).or_insert(Decimal::ZERO) += notional;
            }
        }

        let order_id = Uuid::new_v4().to_string();
        debug!(
            order_id = %order_id,
            symbol = symbol,
            side = %side,
            size = %size,
            price = %price,
            "Paper order filled"
        );

        Ok(OrderAck {
            order_id,
            status: OrderStatus::Filled,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<bool, BrokerError> {
        let mut book = self.book.write().await;
        let before = book.open_orders.len();
        book.open_orders.retain(|o| o.order_id != order_id);
        let cancelled = book.open_orders.len() < before;
        if cancelled {
            info!(order_id = order_id, "Paper order cancelled");
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_buy_then_sell_round_trip() {
        let broker = PaperBroker::new();
        broker.fund_usd(dec!(1000)).await;
        broker.set_price("BTC-USD", dec!(50000)).await;

        let ack = broker
            .place_order("BTC-USD", OrderSide::Buy, OrderKind::Market, dec!(0.01))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);

        let positions = broker.get_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, dec!(0.01));

        broker
            .place_order("BTC-USD", OrderSide::Sell, OrderKind::Market, dec!(0.01))
            .await
            .unwrap();
        assert!(broker.get_positions().await.unwrap().is_empty());

        let balances = broker.get_balances().await.unwrap();
        assert_eq!(balances["USD"], dec!(1000));
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected() {
        let broker = PaperBroker::new();
        broker.fund_usd(dec!(10)).await;
        broker.set_price("BTC-USD", dec!(50000)).await;

        let result = broker
            .place_order("BTC-USD", OrderSide::Buy, OrderKind::Market, dec!(0.01))
            .await;
        assert!(matches!(result, Err(BrokerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_fail_switch_and_counter() {
        let broker = PaperBroker::new();
        broker.set_price("ETH-USD", dec!(3000)).await;
        broker.set_fail_orders(true);

        let result = broker
            .place_order("ETH-USD", OrderSide::Buy, OrderKind::Market, dec!(1))
            .await;
        assert!(matches!(result, Err(BrokerError::Network(_))));
        assert_eq!(broker.order_call_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_returns_false() {
        let broker = PaperBroker::new();
        assert!(!broker.cancel_order("no-such-order").await.unwrap());
    }

    #[tokio::test]
    async fn test_close_position_default_impl() {
        let broker = PaperBroker::new();
        broker.set_price("ETH-USD", dec!(3000)).await;
        broker.set_position("ETH-USD", dec!(2)).await;

        let ack = broker.close_position("ETH-USD").await.unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert!(broker.get_positions().await.unwrap().is_empty());
    }
}
