//! Reconciliation Module
//!
//! Detects and resolves drift between broker truth and the internal
//! ledger, both continuously (watchdog) and across process restarts
//! (restart manager + state snapshot).
//!
//! # Architecture
//!
//! - `snapshot` - atomic persistence of the full trading state
//! - `watchdog` - periodic ledger-vs-exchange diff with classified
//!   discrepancies and (opt-in) corrective actions
//! - `restart` - load-once restart detection, snapshot-vs-exchange
//!   reconciliation and duplicate-signal rejection

mod restart;
mod snapshot;
mod watchdog;

pub use restart::{RestartError, RestartManager, RestartReport, RestartStatus};
pub use snapshot::{SnapshotError, SnapshotStore, SystemStateSnapshot, TradingState};
pub use watchdog::{
    classify_discrepancies, ClassifyConfig, Discrepancy, DiscrepancyKind, ReconciliationAction,
    ReconciliationWatchdog, WatchdogConfig,
};
