//! Position Ledger Module
//!
//! The internal source of truth for what the system believes it owns:
//! open positions, in-flight orders, and the per-(container, symbol)
//! close locks that serialize exits.
//!
//! # Architecture
//!
//! - `PositionLedger` - sharded book of positions and pending orders
//! - `SymbolLockTable` / `CloseGuard` - two-gate mutual exclusion per
//!   (container, symbol), released on every path via RAII
//! - Core types - `Position`, `PendingOrder`, `OrderId`

mod book;
mod lock;
mod position;

pub use book::{LedgerError, PositionLedger};
pub use lock::{CloseGuard, SymbolLockTable};
pub use position::{OrderId, PendingOrder, Position};
