//! Trade Recording Module
//!
//! Pluggable `TradeRecorder` trait for recording confirmed fills and
//! reconciliation actions. The engine records through a trait object so
//! backends can be swapped without touching execution code.

mod recorder;
mod tracing_recorder;

pub use recorder::{MemoryRecorder, TradeEvent, TradeEventKind, TradeRecorder};
pub use tracing_recorder::TracingRecorder;
