//! Ledger record types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::OrderStatus;
use crate::types::{ContainerId, OrderKind, OrderSide, PositionSide, EXIT_EPSILON};

/// Type-safe order identifier.
///
/// Newtype wrapper so order ids cannot be mixed with other strings at
/// compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(String);

impl OrderId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let s: String = id.into();
        debug_assert!(!s.is_empty(), "OrderId cannot be empty");
        Self(s)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// An open position as tracked by the ledger.
///
/// Created on a confirmed entry fill. `remaining` is the fraction of the
/// original quantity still open (1.0 = full size) and decreases
/// monotonically across partial exits; the record is removed from the
/// ledger synchronously with the confirmed full exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Owning container
    pub container: ContainerId,
    /// Trading symbol (e.g., "BTC-USD")
    pub symbol: String,
    /// Position direction
    pub side: PositionSide,
    /// Original fill quantity in base currency
    pub quantity: Decimal,
    /// Entry price
    pub entry_price: Decimal,
    /// Original size in quote currency
    pub size_usd: Decimal,
    /// Optional stop-loss price
    pub stop_loss: Option<Decimal>,
    /// Fraction of the original quantity still open
    pub remaining: Decimal,
    /// When the entry fill was confirmed
    pub opened_at: DateTime<Utc>,
    /// Last mutation (partial exit, reconciliation adjust)
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Create a freshly filled, full-size position.
    #[must_use]
    pub fn new(
        container: ContainerId,
        symbol: impl Into<String>,
        side: PositionSide,
        quantity: Decimal,
        entry_price: Decimal,
        stop_loss: Option<Decimal>,
    ) -> Self {
        let now = Utc::now();
        Self {
            container,
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            size_usd: quantity * entry_price,
            stop_loss,
            remaining: Decimal::ONE,
            opened_at: now,
            updated_at: now,
        }
    }

    /// Quantity still open, in base units.
    #[must_use]
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity * self.remaining
    }

    /// Quote-currency size still open.
    #[must_use]
    pub fn remaining_size_usd(&self) -> Decimal {
        self.size_usd * self.remaining
    }

    /// True once the remaining fraction is within epsilon of zero.
    #[must_use]
    pub fn is_flat(&self) -> bool {
        self.remaining <= EXIT_EPSILON
    }

    /// Realized PnL for exiting `quantity` base units at `exit_price`.
    #[must_use]
    pub fn realized_pnl(&self, exit_price: Decimal, quantity: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (exit_price - self.entry_price) * quantity,
            PositionSide::Short => (self.entry_price - exit_price) * quantity,
        }
    }
}

/// An order submitted to a broker whose terminal status has not yet been
/// observed.
///
/// Exists from submission until filled/cancelled/rejected is recorded;
/// orphaned if it disappears from exchange-side open-order listings
/// without a terminal status ever being seen locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: OrderId,
    pub container: ContainerId,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub submitted_at: DateTime<Utc>,
    /// Last status reported by the broker; `Unknown` after a timed-out call.
    #[serde(with = "order_status_serde")]
    pub status: OrderStatus,
}

impl PendingOrder {
    #[must_use]
    pub fn new(
        id: OrderId,
        container: ContainerId,
        symbol: impl Into<String>,
        side: OrderSide,
        kind: OrderKind,
        status: OrderStatus,
    ) -> Self {
        Self {
            id,
            container,
            symbol: symbol.into(),
            side,
            kind,
            submitted_at: Utc::now(),
            status,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

mod order_status_serde {
    use crate::broker::OrderStatus;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(status: &OrderStatus, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&status.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<OrderStatus, D::Error> {
        let raw = String::deserialize(d)?;
        Ok(match raw.as_str() {
            "submitted" => OrderStatus::Submitted,
            "filled" => OrderStatus::Filled,
            "cancelled" => OrderStatus::Cancelled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::Unknown,
        })
    }
}
