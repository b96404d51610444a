//! System state snapshot persistence.
//!
//! The snapshot is written after every state-changing operation and read
//! once at process start. Writes go temp-file → fsync → rename so a
//! crash mid-write leaves either the old file or the new one on disk,
//! never a torn mix.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ledger::{PendingOrder, Position};

/// Errors from snapshot persistence.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Overall trading mode captured in the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingState {
    Running,
    Paused,
    Halted,
}

impl std::fmt::Display for TradingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

/// Point-in-time serialization of trading state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub trading_state: TradingState,
    pub positions: Vec<Position>,
    /// Asset ticker -> balance in base units.
    pub balances: HashMap<String, Decimal>,
    pub pending_orders: Vec<PendingOrder>,
    pub last_trade_id: Option<String>,
    /// Idempotency key of the most recently processed signal.
    pub last_signal_id: Option<String>,
}

impl SystemStateSnapshot {
    /// Empty snapshot in the given mode.
    #[must_use]
    pub fn empty(trading_state: TradingState) -> Self {
        Self {
            timestamp: Utc::now(),
            trading_state,
            positions: Vec::new(),
            balances: HashMap::new(),
            pending_orders: Vec::new(),
            last_trade_id: None,
            last_signal_id: None,
        }
    }
}

/// File-backed snapshot store with atomic writes.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if a snapshot file exists (a previous process ran here).
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Persist atomically: write to a temp file, fsync, then rename.
    /// POSIX guarantees the rename is atomic on the same filesystem.
    pub fn save(&self, snapshot: &SystemStateSnapshot) -> Result<(), SnapshotError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let temp_path = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;

        debug!(
            path = %self.path.display(),
            positions = snapshot.positions.len(),
            pending_orders = snapshot.pending_orders.len(),
            "Snapshot saved"
        );
        Ok(())
    }

    /// Load the snapshot if present. A corrupt file is treated as absent
    /// (logged at WARN) so a restart can still proceed through the
    /// exchange-truth reconciliation path.
    pub fn load(&self) -> Result<Option<SystemStateSnapshot>, SnapshotError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&data) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Snapshot file corrupt; treating as absent"
                );
                Ok(None)
            }
        }
    }
}
