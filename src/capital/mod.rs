//! Capital Isolation Module
//!
//! Partitions total capital into per-tenant trading containers with
//! independent quotas, exposure limits and daily-loss circuit breakers.
//! One tenant's overdraft or halt can never bleed into another's
//! accounting.

mod container;
mod engine;

pub use container::{ContainerSnapshot, ContainerStatus, Tier, TierLimits, TradingContainer};
pub use engine::{CapitalEngine, CapitalEngineConfig, CapitalError};
