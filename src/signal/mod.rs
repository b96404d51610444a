//! Strategy Engine boundary.
//!
//! Signals are produced by an external strategy engine; this module
//! defines the wire shape the core consumes and the stop-loss trigger
//! predicate evaluated against open positions.

mod stop;

pub use stop::{StopCondition, StopPolicy, TriggerCombination};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{ContainerId, PositionSide};

/// A trade signal from the strategy engine.
///
/// `signal_id` is the idempotency key: after a restart, a signal whose
/// id matches the last processed one in the snapshot is rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeSignal {
    pub signal_id: String,
    pub container: ContainerId,
    pub symbol: String,
    pub side: PositionSide,
    /// Requested position size in quote currency.
    pub size_usd: Decimal,
    pub stop_loss: Option<Decimal>,
    pub reason: String,
}
