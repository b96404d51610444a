//! The position book.
//!
//! Sharded map of open positions and pending orders. Mutations that race
//! with exits are serialized by the caller holding the per-symbol
//! [`CloseGuard`](super::CloseGuard); the book itself only guarantees
//! per-entry consistency.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::lock::SymbolLockTable;
use super::position::{OrderId, PendingOrder, Position};
use crate::broker::OrderStatus;
use crate::types::{ContainerId, EXIT_EPSILON};

/// Errors from ledger mutations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// A position already exists for this (container, symbol).
    #[error("Position already open for {container}/{symbol}")]
    PositionExists {
        container: ContainerId,
        symbol: String,
    },

    /// No position found for this (container, symbol).
    #[error("No open position for {container}/{symbol}")]
    PositionNotFound {
        container: ContainerId,
        symbol: String,
    },

    /// Exit fraction outside (0, 1].
    #[error("Exit fraction {0} outside (0, 1]")]
    InvalidFraction(Decimal),
}

/// Internal record of positions and in-flight orders.
///
/// A symbol has at most one open position per container. Positions are
/// created on confirmed entry fills, shrunk on partial exits, and removed
/// synchronously with the confirmed full exit.
pub struct PositionLedger {
    positions: DashMap<(ContainerId, String), Position>,
    pending_orders: DashMap<OrderId, PendingOrder>,
    locks: Arc<SymbolLockTable>,
}

impl PositionLedger {
    #[must_use]
    pub fn new() -> Self {
        Self {
            positions: DashMap::new(),
            pending_orders: DashMap::new(),
            locks: Arc::new(SymbolLockTable::new()),
        }
    }

    /// The lock table serializing closes against this book.
    #[must_use]
    pub fn locks(&self) -> &Arc<SymbolLockTable> {
        &self.locks
    }

    // --- Positions ---

    /// Record a confirmed entry fill. Rejects duplicates.
    pub fn insert_position(&self, position: Position) -> Result<(), LedgerError> {
        let key = (position.container.clone(), position.symbol.clone());
        if self.positions.contains_key(&key) {
            return Err(LedgerError::PositionExists {
                container: key.0,
                symbol: key.1,
            });
        }
        info!(
            container = %position.container,
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            entry_price = %position.entry_price,
            "Position opened"
        );
        self.positions.insert(key, position);
        Ok(())
    }

    #[must_use]
    pub fn get_position(&self, container: &ContainerId, symbol: &str) -> Option<Position> {
        self.positions
            .get(&(container.clone(), symbol.to_string()))
            .map(|p| p.clone())
    }

    #[must_use]
    pub fn has_position(&self, container: &ContainerId, symbol: &str) -> bool {
        self.positions
            .contains_key(&(container.clone(), symbol.to_string()))
    }

    /// Remove a position outright (confirmed full exit, or a phantom
    /// correction). Returns the removed record.
    pub fn remove_position(
        &self,
        container: &ContainerId,
        symbol: &str,
    ) -> Result<Position, LedgerError> {
        self.positions
            .remove(&(container.clone(), symbol.to_string()))
            .map(|(_, p)| {
                info!(container = %container, symbol = symbol, "Position removed from ledger");
                p
            })
            .ok_or_else(|| LedgerError::PositionNotFound {
                container: container.clone(),
                symbol: symbol.to_string(),
            })
    }

    /// Shrink a position after a confirmed partial exit.
    ///
    /// `fraction` is the fraction of the *remaining* size that was closed;
    /// the new remaining fraction is `remaining × (1 − fraction)`. Returns
    /// the updated position. Full closes must go through
    /// [`remove_position`](Self::remove_position) instead.
    pub fn apply_partial_exit(
        &self,
        container: &ContainerId,
        symbol: &str,
        fraction: Decimal,
    ) -> Result<Position, LedgerError> {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(LedgerError::InvalidFraction(fraction));
        }
        let key = (container.clone(), symbol.to_string());
        let mut entry = self
            .positions
            .get_mut(&key)
            .ok_or_else(|| LedgerError::PositionNotFound {
                container: container.clone(),
                symbol: symbol.to_string(),
            })?;
        entry.remaining *= Decimal::ONE - fraction;
        entry.updated_at = Utc::now();
        debug!(
            container = %container,
            symbol = symbol,
            fraction = %fraction,
            remaining = %entry.remaining,
            "Partial exit applied"
        );
        Ok(entry.clone())
    }

    /// Overwrite a position's open quantity from exchange truth
    /// (reconciliation ADJUST). The remaining fraction is rescaled so
    /// `remaining_quantity()` equals `exchange_quantity`.
    pub fn adjust_quantity(
        &self,
        container: &ContainerId,
        symbol: &str,
        exchange_quantity: Decimal,
    ) -> Result<Position, LedgerError> {
        let key = (container.clone(), symbol.to_string());
        let mut entry = self
            .positions
            .get_mut(&key)
            .ok_or_else(|| LedgerError::PositionNotFound {
                container: container.clone(),
                symbol: symbol.to_string(),
            })?;
        let old = entry.remaining_quantity();
        if entry.quantity.is_zero() {
            entry.quantity = exchange_quantity;
            entry.remaining = Decimal::ONE;
        } else {
            entry.remaining = exchange_quantity / entry.quantity;
        }
        entry.updated_at = Utc::now();
        warn!(
            container = %container,
            symbol = symbol,
            old_quantity = %old,
            new_quantity = %exchange_quantity,
            "Position quantity adjusted to exchange truth"
        );
        Ok(entry.clone())
    }

    /// All positions owned by a container.
    #[must_use]
    pub fn positions_for_container(&self, container: &ContainerId) -> Vec<Position> {
        self.positions
            .iter()
            .filter(|e| &e.key().0 == container)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Every open position across all containers.
    #[must_use]
    pub fn all_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    /// Open-position count for a container, skipping symbols the caller
    /// excludes (delisted / permanent dust).
    #[must_use]
    pub fn open_position_count(
        &self,
        container: &ContainerId,
        excluded: &dyn Fn(&str) -> bool,
    ) -> usize {
        self.positions
            .iter()
            .filter(|e| &e.key().0 == container && !excluded(&e.key().1))
            .count()
    }

    /// Total remaining quote-currency exposure for a container, skipping
    /// excluded symbols.
    #[must_use]
    pub fn container_exposure(
        &self,
        container: &ContainerId,
        excluded: &dyn Fn(&str) -> bool,
    ) -> Decimal {
        self.positions
            .iter()
            .filter(|e| &e.key().0 == container && !excluded(&e.key().1))
            .map(|e| e.value().remaining_size_usd())
            .sum()
    }

    /// Internal balances per symbol for a container, as reconciliation
    /// input (symbol -> remaining base quantity).
    #[must_use]
    pub fn internal_balances(&self, container: &ContainerId) -> HashMap<String, Decimal> {
        self.positions
            .iter()
            .filter(|e| &e.key().0 == container)
            .map(|e| (e.key().1.clone(), e.value().remaining_quantity()))
            .collect()
    }

    // --- Pending orders ---

    /// Track a newly submitted order.
    pub fn add_pending_order(&self, order: PendingOrder) {
        debug!(order_id = %order.id, symbol = %order.symbol, status = %order.status, "Pending order tracked");
        self.pending_orders.insert(order.id.clone(), order);
    }

    /// Record a status update; terminal statuses drop the order from the
    /// book. Returns the updated order if it was known.
    pub fn update_pending_order(&self, id: &OrderId, status: OrderStatus) -> Option<PendingOrder> {
        if status.is_terminal() {
            let removed = self.pending_orders.remove(id).map(|(_, mut o)| {
                o.status = status;
                o
            });
            if let Some(ref o) = removed {
                debug!(order_id = %id, status = %status, symbol = %o.symbol, "Pending order resolved");
            }
            removed
        } else {
            let mut entry = self.pending_orders.get_mut(id)?;
            entry.status = status;
            Some(entry.clone())
        }
    }

    /// All orders still awaiting a terminal status.
    #[must_use]
    pub fn pending_orders(&self) -> Vec<PendingOrder> {
        self.pending_orders
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    /// True if nothing is open or in flight (useful for shutdown checks).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty() && self.pending_orders.is_empty()
    }

    /// Remaining-fraction check used by the coordinator to decide
    /// full-vs-partial: a fraction that leaves less than epsilon open is a
    /// full close.
    #[must_use]
    pub fn is_full_exit(remaining_before: Decimal, fraction: Decimal) -> bool {
        fraction >= Decimal::ONE - EXIT_EPSILON
            || remaining_before * (Decimal::ONE - fraction) <= EXIT_EPSILON
    }
}

impl Default for PositionLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OrderKind, OrderSide, PositionSide};
    use rust_decimal_macros::dec;

    fn position(container: &str, symbol: &str) -> Position {
        Position::new(
            ContainerId::new(container),
            symbol,
            PositionSide::Long,
            dec!(0.01),
            dec!(50000),
            None,
        )
    }

    #[test]
    fn test_duplicate_position_rejected() {
        let ledger = PositionLedger::new();
        ledger.insert_position(position("c1", "BTC-USD")).unwrap();

        let err = ledger
            .insert_position(position("c1", "BTC-USD"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::PositionExists { .. }));

        // Same symbol under a different container is fine.
        ledger.insert_position(position("c2", "BTC-USD")).unwrap();
    }

    #[test]
    fn test_partial_exit_arithmetic() {
        let ledger = PositionLedger::new();
        let c = ContainerId::new("c1");
        ledger.insert_position(position("c1", "BTC-USD")).unwrap();

        let p = ledger.apply_partial_exit(&c, "BTC-USD", dec!(0.5)).unwrap();
        assert_eq!(p.remaining, dec!(0.5));
        assert_eq!(p.remaining_quantity(), dec!(0.005));

        let p = ledger.apply_partial_exit(&c, "BTC-USD", dec!(0.5)).unwrap();
        assert_eq!(p.remaining, dec!(0.25));
    }

    #[test]
    fn test_invalid_fraction_rejected() {
        let ledger = PositionLedger::new();
        let c = ContainerId::new("c1");
        ledger.insert_position(position("c1", "BTC-USD")).unwrap();

        assert!(matches!(
            ledger.apply_partial_exit(&c, "BTC-USD", dec!(0)),
            Err(LedgerError::InvalidFraction(_))
        ));
        assert!(matches!(
            ledger.apply_partial_exit(&c, "BTC-USD", dec!(1.5)),
            Err(LedgerError::InvalidFraction(_))
        ));
    }

    #[test]
    fn test_adjust_quantity_rescales_remaining() {
        let ledger = PositionLedger::new();
        let c = ContainerId::new("c1");
        ledger.insert_position(position("c1", "ETH-USD")).unwrap();

        let p = ledger.adjust_quantity(&c, "ETH-USD", dec!(0.003)).unwrap();
        assert_eq!(p.remaining_quantity(), dec!(0.003));
    }

    #[test]
    fn test_full_exit_boundary() {
        assert!(PositionLedger::is_full_exit(dec!(1), dec!(1)));
        assert!(PositionLedger::is_full_exit(dec!(0.5), dec!(1)));
        assert!(PositionLedger::is_full_exit(dec!(0.0000005), dec!(0.5)));
        assert!(!PositionLedger::is_full_exit(dec!(1), dec!(0.5)));
    }

    #[test]
    fn test_exposure_excludes_flagged_symbols() {
        let ledger = PositionLedger::new();
        let c = ContainerId::new("c1");
        ledger.insert_position(position("c1", "BTC-USD")).unwrap();
        ledger.insert_position(position("c1", "DEAD-USD")).unwrap();

        let none = |_: &str| false;
        let dead_only = |s: &str| s == "DEAD-USD";
        assert_eq!(ledger.open_position_count(&c, &none), 2);
        assert_eq!(ledger.open_position_count(&c, &dead_only), 1);
        assert_eq!(ledger.container_exposure(&c, &dead_only), dec!(500));
    }

    #[test]
    fn test_pending_order_lifecycle() {
        let ledger = PositionLedger::new();
        let id = OrderId::new("ord-1");
        ledger.add_pending_order(PendingOrder::new(
            id.clone(),
            ContainerId::new("c1"),
            "BTC-USD",
            OrderSide::Sell,
            OrderKind::Market,
            OrderStatus::Submitted,
        ));
        assert_eq!(ledger.pending_orders().len(), 1);

        let resolved = ledger.update_pending_order(&id, OrderStatus::Filled).unwrap();
        assert_eq!(resolved.status, OrderStatus::Filled);
        assert!(ledger.pending_orders().is_empty());
    }
}
