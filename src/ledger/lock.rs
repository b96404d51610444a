//! Per-symbol close locks.
//!
//! Every (container, symbol) pair carries two independent gates:
//! *closing-in-progress* blocks a second close attempt, and
//! *active-exit-order* blocks a second exit order while one is
//! unconfirmed. Both must be clear for a close to begin, and both are
//! released on every exit path. Release is tied to `CloseGuard`'s `Drop`
//! impl so an early return, a broker error or a panic unwind all clear
//! the gates.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::types::ContainerId;

type LockKey = (ContainerId, String);

#[derive(Debug, Default)]
struct Gates {
    closing_in_progress: bool,
    active_exit_order: bool,
}

/// Sharded table of close-lock gates keyed by (container, symbol).
#[derive(Default)]
pub struct SymbolLockTable {
    gates: Arc<DashMap<LockKey, Gates>>,
}

impl SymbolLockTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to start a close for (container, symbol).
    ///
    /// Fails closed: returns `None` if either gate is already set. On
    /// success the closing-in-progress gate is set and the returned guard
    /// owns both gates until dropped.
    ///
    /// The test-and-set runs under the map's shard lock, so two
    /// concurrent callers can never both acquire.
    pub fn try_acquire_close(
        &self,
        container: &ContainerId,
        symbol: &str,
    ) -> Option<CloseGuard> {
        let key = (container.clone(), symbol.to_string());
        let mut entry = self.gates.entry(key.clone()).or_default();
        if entry.closing_in_progress || entry.active_exit_order {
            debug!(
                container = %container,
                symbol = symbol,
                "Close lock contended, not granted"
            );
            return None;
        }
        entry.closing_in_progress = true;
        drop(entry);

        Some(CloseGuard {
            gates: Arc::clone(&self.gates),
            key,
        })
    }

    /// True if both gates are clear for (container, symbol).
    #[must_use]
    pub fn gates_clear(&self, container: &ContainerId, symbol: &str) -> bool {
        let key = (container.clone(), symbol.to_string());
        match self.gates.get(&key) {
            Some(g) => !g.closing_in_progress && !g.active_exit_order,
            None => true,
        }
    }
}

/// RAII proof that the close lock for one (container, symbol) is held.
///
/// Holding a `CloseGuard` is the only way to call
/// [`crate::execution::ExecutionCoordinator::execute_exit`], which makes
/// "exit without the lock" unrepresentable. Dropping the guard clears
/// both gates.
pub struct CloseGuard {
    gates: Arc<DashMap<LockKey, Gates>>,
    key: LockKey,
}

impl CloseGuard {
    /// Mark that an exit order is now in flight for this symbol.
    ///
    /// The gate stays set until the guard drops, blocking any new close
    /// even if the closing flag were somehow cleared independently.
    pub fn mark_exit_order_active(&self) {
        if let Some(mut entry) = self.gates.get_mut(&self.key) {
            entry.active_exit_order = true;
        }
    }

    #[must_use]
    pub fn container(&self) -> &ContainerId {
        &self.key.0
    }

    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.key.1
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        // Remove the entry entirely rather than zeroing flags, so the
        // table does not grow with every symbol ever traded.
        self.gates.remove(&self.key);
        debug!(
            container = %self.key.0,
            symbol = %self.key.1,
            "Close lock released"
        );
    }
}
