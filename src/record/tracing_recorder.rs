//! Structured-log recorder backend.

use async_trait::async_trait;
use tracing::info;

use super::recorder::{TradeEvent, TradeRecorder};

/// Emits every trade event as a structured tracing line, suitable for
/// log aggregation without any extra storage backend.
#[derive(Debug, Default, Clone)]
pub struct TracingRecorder;

impl TracingRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TradeRecorder for TracingRecorder {
    async fn record(&self, event: TradeEvent) {
        info!(
            target: "trade_record",
            trade_id = %event.trade_id,
            kind = %event.kind,
            container = %event.container,
            symbol = %event.symbol,
            side = %event.side,
            quantity = %event.quantity,
            price = %event.price,
            pnl = ?event.pnl,
            reason = %event.reason,
            "Trade recorded"
        );
    }
}
