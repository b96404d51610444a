//! Execution Coordination Module
//!
//! Serializes position entries and exits against the broker, pairing
//! every ledger mutation 1:1 with capital accounting and guaranteeing
//! close-lock release on every path.

mod coordinator;

pub use coordinator::{
    EntryRequest, ExecutionConfig, ExecutionCoordinator, ExecutionError, ExitOutcome,
};
