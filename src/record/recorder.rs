//! Recorder trait and event type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::types::{ContainerId, OrderSide};

/// What kind of event is being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeEventKind {
    Entry,
    Exit,
    /// Ledger correction driven by the reconciliation watchdog.
    Reconciliation,
}

impl std::fmt::Display for TradeEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry => write!(f, "entry"),
            Self::Exit => write!(f, "exit"),
            Self::Reconciliation => write!(f, "reconciliation"),
        }
    }
}

/// A single recorded fill or correction.
#[derive(Debug, Clone)]
pub struct TradeEvent {
    pub trade_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: TradeEventKind,
    pub container: ContainerId,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
    pub pnl: Option<Decimal>,
    pub reason: String,
}

impl TradeEvent {
    #[must_use]
    pub fn new(
        kind: TradeEventKind,
        container: ContainerId,
        symbol: impl Into<String>,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
        pnl: Option<Decimal>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            trade_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            container,
            symbol: symbol.into(),
            side,
            quantity,
            price,
            pnl,
            reason: reason.into(),
        }
    }
}

/// Pluggable recording backend.
#[async_trait]
pub trait TradeRecorder: Send + Sync {
    async fn record(&self, event: TradeEvent);
}

/// In-memory recorder for tests and dry runs.
#[derive(Default)]
pub struct MemoryRecorder {
    events: tokio::sync::Mutex<Vec<TradeEvent>>,
}

impl MemoryRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<TradeEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl TradeRecorder for MemoryRecorder {
    async fn record(&self, event: TradeEvent) {
        self.events.lock().await.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_memory_recorder_collects_events() {
        let recorder = MemoryRecorder::new();
        recorder
            .record(TradeEvent::new(
                TradeEventKind::Entry,
                ContainerId::new("c1"),
                "BTC-USD",
                OrderSide::Buy,
                dec!(0.01),
                dec!(50000),
                None,
                "signal",
            ))
            .await;

        let events = recorder.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, TradeEventKind::Entry);
        assert!(!events[0].trade_id.is_empty());
    }
}
