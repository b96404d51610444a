//! Container registry and global capital accounting.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::info;

use super::container::{Tier, TradingContainer};
use crate::types::ContainerId;

/// Errors from container management.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapitalError {
    #[error("Container already exists for user {0}")]
    ContainerExists(String),

    #[error("Global container cap ({0}) reached")]
    ContainerCapReached(usize),

    #[error("No container for user {0}")]
    ContainerNotFound(String),

    #[error("Allocated capital must be positive, got {0}")]
    InvalidAllocation(Decimal),
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct CapitalEngineConfig {
    /// Maximum number of tenant containers.
    pub max_containers: usize,
    /// Total capital under management, used for allocation percentages.
    pub total_capital_usd: Decimal,
}

impl Default for CapitalEngineConfig {
    fn default() -> Self {
        Self {
            max_containers: 100,
            total_capital_usd: Decimal::ZERO,
        }
    }
}

/// Registry of per-tenant containers.
///
/// Capital changes in one container are never visible to or derivable
/// from another container's state; the engine only aggregates for
/// reporting.
pub struct CapitalEngine {
    config: CapitalEngineConfig,
    containers: DashMap<String, Arc<TradingContainer>>,
    total_capital: Mutex<Decimal>,
}

impl CapitalEngine {
    #[must_use]
    pub fn new(config: CapitalEngineConfig) -> Self {
        let total = config.total_capital_usd;
        Self {
            config,
            containers: DashMap::new(),
            total_capital: Mutex::new(total),
        }
    }

    /// Create a container for a user. Rejects a duplicate user and
    /// respects the global container cap.
    pub fn create_container(
        &self,
        user_id: &str,
        allocated_usd: Decimal,
        tier: Tier,
    ) -> Result<Arc<TradingContainer>, CapitalError> {
        if allocated_usd <= Decimal::ZERO {
            return Err(CapitalError::InvalidAllocation(allocated_usd));
        }
        if self.containers.len() >= self.config.max_containers {
            return Err(CapitalError::ContainerCapReached(self.config.max_containers));
        }

        let container = Arc::new(TradingContainer::new(
            ContainerId::new(format!("container-{user_id}")),
            user_id,
            allocated_usd,
            tier,
        ));

        // Entry API keeps the exists-check and insert atomic.
        match self.containers.entry(user_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(CapitalError::ContainerExists(user_id.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(Arc::clone(&container));
            }
        }

        self.rescale_percentages();
        info!(
            user = user_id,
            container = %container.id(),
            allocated = %allocated_usd,
            tier = %tier,
            "Container created"
        );
        Ok(container)
    }

    /// Look up a user's container.
    pub fn container_for_user(&self, user_id: &str) -> Result<Arc<TradingContainer>, CapitalError> {
        self.containers
            .get(user_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| CapitalError::ContainerNotFound(user_id.to_string()))
    }

    /// Find a container by its id.
    #[must_use]
    pub fn container_by_id(&self, id: &ContainerId) -> Option<Arc<TradingContainer>> {
        self.containers
            .iter()
            .find(|e| e.value().id() == id)
            .map(|e| Arc::clone(e.value()))
    }

    /// All registered containers.
    #[must_use]
    pub fn containers(&self) -> Vec<Arc<TradingContainer>> {
        self.containers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.containers.len()
    }

    /// Update total capital under management. Rescales allocation
    /// percentages for reporting; absolute per-container caps and
    /// allocations are unchanged.
    pub fn update_total_capital(&self, total_usd: Decimal) {
        {
            let mut total = self.total_capital.lock().expect("capital mutex poisoned");
            *total = total_usd;
        }
        self.rescale_percentages();
        info!(total_capital = %total_usd, "Total capital updated");
    }

    #[must_use]
    pub fn total_capital(&self) -> Decimal {
        *self.total_capital.lock().expect("capital mutex poisoned")
    }

    /// Reset daily accumulators on every container (day boundary).
    pub fn reset_daily_all(&self) {
        for entry in self.containers.iter() {
            entry.value().reset_daily();
        }
    }

    fn rescale_percentages(&self) {
        let total = self.total_capital();
        for entry in self.containers.iter() {
            let pct = if total.is_zero() {
                Decimal::ZERO
            } else {
                entry.value().allocated_capital() / total * Decimal::ONE_HUNDRED
            };
            entry.value().set_allocation_pct(pct);
        }
    }
}

impl Default for CapitalEngine {
    fn default() -> Self {
        Self::new(CapitalEngineConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_duplicate_user_rejected() {
        let engine = CapitalEngine::default();
        engine
            .create_container("alice", dec!(1000), Tier::Standard)
            .unwrap();
        let err = engine
            .create_container("alice", dec!(500), Tier::Starter)
            .unwrap_err();
        assert_eq!(err, CapitalError::ContainerExists("alice".to_string()));
    }

    #[test]
    fn test_container_cap() {
        let engine = CapitalEngine::new(CapitalEngineConfig {
            max_containers: 1,
            total_capital_usd: dec!(10000),
        });
        engine
            .create_container("alice", dec!(1000), Tier::Standard)
            .unwrap();
        let err = engine
            .create_container("bob", dec!(1000), Tier::Standard)
            .unwrap_err();
        assert_eq!(err, CapitalError::ContainerCapReached(1));
    }

    #[test]
    fn test_cross_container_isolation() {
        let engine = CapitalEngine::default();
        let a = engine
            .create_container("alice", dec!(1000), Tier::Standard)
            .unwrap();
        let b = engine
            .create_container("bob", dec!(1000), Tier::Standard)
            .unwrap();

        a.allocate_capital(dec!(400)).unwrap();
        assert_eq!(a.available_capital(), dec!(600));
        assert_eq!(b.available_capital(), dec!(1000));

        a.record_trade(dec!(-600), false);
        assert_eq!(b.status(), super::super::ContainerStatus::Active);
    }

    #[test]
    fn test_update_total_capital_rescales_pct_only() {
        let engine = CapitalEngine::new(CapitalEngineConfig {
            max_containers: 10,
            total_capital_usd: dec!(10000),
        });
        let a = engine
            .create_container("alice", dec!(2500), Tier::Standard)
            .unwrap();
        assert_eq!(a.snapshot().allocation_pct, dec!(25));

        engine.update_total_capital(dec!(5000));
        assert_eq!(a.snapshot().allocation_pct, dec!(50));
        // Absolute numbers unchanged.
        assert_eq!(a.allocated_capital(), dec!(2500));
        assert_eq!(a.available_capital(), dec!(2500));
    }
}
