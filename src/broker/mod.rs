//! Broker Abstraction Layer
//!
//! Exchange-agnostic capability interface consumed by the execution
//! coordinator, the reconciliation watchdog and the emergency protocols.
//! New exchanges are added by implementing [`BrokerAdapter`] fully; an
//! operation a venue cannot support returns [`BrokerError::Unsupported`]
//! instead of being probed at runtime.

mod paper;

pub use paper::PaperBroker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use thiserror::Error;

use crate::types::{OrderKind, OrderSide};

/// Errors returned by broker adapters.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Transport-level failure (connection reset, DNS, 5xx).
    #[error("Network error: {0}")]
    Network(String),

    /// The call did not complete within the caller's deadline. The order
    /// state is unknown; callers must not treat this as success or failure.
    #[error("Broker call timed out after {0}ms")]
    Timeout(u64),

    /// The exchange rejected the request (insufficient funds, bad params).
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// Missing or invalid credentials/settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The venue does not implement this capability.
    #[error("Operation not supported by this broker: {0}")]
    Unsupported(&'static str),

    /// No price available for the symbol.
    #[error("No price for symbol: {0}")]
    PriceUnavailable(String),

    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// True if the failure is worth retrying on the next cycle.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::Network(_) | BrokerError::Timeout(_) | BrokerError::PriceUnavailable(_)
        )
    }
}

/// A position as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerPosition {
    pub symbol: String,
    pub quantity: Decimal,
    pub usd_value: Decimal,
}

/// An open order as reported by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub created_at: DateTime<Utc>,
    pub value_usd: Decimal,
}

/// Terminal/non-terminal status of a placed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Submitted,
    Filled,
    Cancelled,
    Rejected,
    /// The adapter could not determine the outcome (e.g. timeout mid-call).
    Unknown,
}

impl OrderStatus {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Filled => write!(f, "filled"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rejected => write!(f, "rejected"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Acknowledgement returned by `place_order`.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Core capability interface over exchange APIs.
///
/// One implementation per venue. All methods are explicit: the engine never
/// probes for optional methods at runtime.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Asset balances (base currency units) keyed by asset ticker.
    async fn get_balances(&self) -> Result<HashMap<String, Decimal>, BrokerError>;

    /// Open positions with exchange-side USD valuation.
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>, BrokerError>;

    /// Orders currently open on the exchange.
    async fn get_open_orders(&self) -> Result<Vec<OpenOrder>, BrokerError>;

    /// Latest traded price for a symbol.
    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, BrokerError>;

    /// Place an order. `size` is in base currency units.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: OrderKind,
        size: Decimal,
    ) -> Result<OrderAck, BrokerError>;

    /// Cancel an open order. Returns true if the exchange accepted the cancel.
    async fn cancel_order(&self, order_id: &str) -> Result<bool, BrokerError>;

    /// Convenience: close the full exchange-side position for a symbol.
    ///
    /// Default implementation looks the position up and market-sells it;
    /// venues with a native close endpoint override this.
    async fn close_position(&self, symbol: &str) -> Result<OrderAck, BrokerError> {
        let positions = self.get_positions().await?;
        let position = positions
            .iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| BrokerError::Rejected(format!("No open position for {}", symbol)))?;
        self.place_order(symbol, OrderSide::Sell, OrderKind::Market, position.quantity)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BrokerError::Network("reset".into()).is_retryable());
        assert!(BrokerError::Timeout(5000).is_retryable());
        assert!(!BrokerError::Rejected("insufficient funds".into()).is_retryable());
        assert!(!BrokerError::Unsupported("margin").is_retryable());
    }

    #[test]
    fn test_order_status_terminal() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Submitted.is_terminal());
        assert!(!OrderStatus::Unknown.is_terminal());
    }
}
