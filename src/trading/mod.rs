//! Trading Workers Module
//!
//! One long-lived worker per (container × broker) pair, so one venue's
//! outage or rate-limit never blocks another tenant's loop, plus the
//! supervisor that spawns and monitors them.

mod supervisor;
mod worker;

pub use supervisor::{RestartPolicy, WorkerSupervisor};
pub use worker::{TradingWorker, WorkerConfig, WorkerError};
