//! Per-tenant trading container.
//!
//! All capital accounting for one tenant happens under the container's
//! own mutex; the critical sections are synchronous and never held
//! across an await.

use std::collections::HashSet;
use std::sync::Mutex;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::ContainerId;

/// Subscription tier mapping to a fixed quota table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Starter,
    Standard,
    Professional,
}

impl Tier {
    /// Quota table for this tier. A tenant can never exceed these limits
    /// regardless of strategy signals.
    #[must_use]
    pub fn limits(&self) -> TierLimits {
        match self {
            Tier::Starter => TierLimits {
                max_positions: 3,
                max_position_usd: Decimal::new(500, 0),
                max_daily_loss: Decimal::new(50, 0),
                api_calls_per_day: 5_000,
            },
            Tier::Standard => TierLimits {
                max_positions: 10,
                max_position_usd: Decimal::new(5_000, 0),
                max_daily_loss: Decimal::new(500, 0),
                api_calls_per_day: 50_000,
            },
            Tier::Professional => TierLimits {
                max_positions: 50,
                max_position_usd: Decimal::new(100_000, 0),
                max_daily_loss: Decimal::new(10_000, 0),
                api_calls_per_day: 500_000,
            },
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Starter => write!(f, "starter"),
            Tier::Standard => write!(f, "standard"),
            Tier::Professional => write!(f, "professional"),
        }
    }
}

/// Hard limits attached to a tier.
#[derive(Debug, Clone, PartialEq)]
pub struct TierLimits {
    pub max_positions: usize,
    pub max_position_usd: Decimal,
    /// Daily loss (positive number) at which the circuit breaker trips.
    pub max_daily_loss: Decimal,
    pub api_calls_per_day: u64,
}

/// Container lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// Trading allowed
    Active,
    /// Manually paused by an operator
    Suspended,
    /// Daily-loss circuit breaker tripped; no new entries until reset
    Halted,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Suspended => write!(f, "suspended"),
            Self::Halted => write!(f, "halted"),
        }
    }
}

#[derive(Debug)]
struct Accounting {
    status: ContainerStatus,
    allocated_capital: Decimal,
    available_capital: Decimal,
    /// Share of the engine's total capital, for reporting only.
    allocation_pct: Decimal,
    open_positions: usize,
    realized_pnl: Decimal,
    /// Losses accumulated today, as a positive number.
    daily_loss: Decimal,
    wins: u32,
    losses: u32,
    api_calls_today: u64,
    brokers: HashSet<String>,
}

/// Point-in-time view of a container's accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSnapshot {
    pub status: ContainerStatus,
    pub allocated_capital: Decimal,
    pub available_capital: Decimal,
    pub equity: Decimal,
    pub allocation_pct: Decimal,
    pub open_positions: usize,
    pub realized_pnl: Decimal,
    pub daily_loss: Decimal,
    pub wins: u32,
    pub losses: u32,
}

/// Per-tenant capital and risk isolation unit.
///
/// Invariant: `available_capital = allocated_capital − Σ(open position
/// sizes)`, maintained atomically under the container's mutex by pairing
/// every ledger entry/exit with exactly one allocate/release.
#[derive(Debug)]
pub struct TradingContainer {
    id: ContainerId,
    user_id: String,
    tier: Tier,
    limits: TierLimits,
    accounting: Mutex<Accounting>,
}

impl TradingContainer {
    #[must_use]
    pub fn new(id: ContainerId, user_id: impl Into<String>, allocated: Decimal, tier: Tier) -> Self {
        Self {
            id,
            user_id: user_id.into(),
            tier,
            limits: tier.limits(),
            accounting: Mutex::new(Accounting {
                status: ContainerStatus::Active,
                allocated_capital: allocated,
                available_capital: allocated,
                allocation_pct: Decimal::ZERO,
                open_positions: 0,
                realized_pnl: Decimal::ZERO,
                daily_loss: Decimal::ZERO,
                wins: 0,
                losses: 0,
                api_calls_today: 0,
                brokers: HashSet::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[must_use]
    pub fn tier(&self) -> Tier {
        self.tier
    }

    #[must_use]
    pub fn limits(&self) -> &TierLimits {
        &self.limits
    }

    /// Ordered admission check for a new position of `size_usd`.
    ///
    /// Checks, in order: status, position count, per-position cap,
    /// available capital, daily-loss accumulator. Returns the first
    /// failing check as a reason string; runs before any broker call.
    pub fn can_open_position(&self, size_usd: Decimal) -> Result<(), String> {
        let acc = self.accounting.lock().expect("container mutex poisoned");

        if acc.status != ContainerStatus::Active {
            return Err(format!("container is {}", acc.status));
        }
        if acc.open_positions >= self.limits.max_positions {
            return Err(format!(
                "position count {} at tier cap {}",
                acc.open_positions, self.limits.max_positions
            ));
        }
        if size_usd > self.limits.max_position_usd {
            return Err(format!(
                "size {} exceeds per-position cap {}",
                size_usd, self.limits.max_position_usd
            ));
        }
        if size_usd > acc.available_capital {
            return Err(format!(
                "size {} exceeds available capital {}",
                size_usd, acc.available_capital
            ));
        }
        if acc.daily_loss >= self.limits.max_daily_loss {
            return Err(format!(
                "daily loss {} at cap {}",
                acc.daily_loss, self.limits.max_daily_loss
            ));
        }
        Ok(())
    }

    /// Reserve capital for a confirmed entry. Call exactly once per open,
    /// paired 1:1 with the ledger insert.
    pub fn allocate_capital(&self, size_usd: Decimal) -> Result<(), String> {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        if size_usd > acc.available_capital {
            return Err(format!(
                "allocation {} exceeds available capital {}",
                size_usd, acc.available_capital
            ));
        }
        acc.available_capital -= size_usd;
        acc.open_positions += 1;
        info!(
            container = %self.id,
            size_usd = %size_usd,
            available = %acc.available_capital,
            open_positions = acc.open_positions,
            "Capital allocated"
        );
        Ok(())
    }

    /// Return capital after a confirmed exit. Call exactly once per close,
    /// paired 1:1 with the ledger removal. Partial exits release the
    /// closed share and keep the position slot occupied.
    pub fn release_capital(&self, size_usd: Decimal, position_closed: bool) {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        acc.available_capital += size_usd;
        // Clamp: a reconciliation adjust may release against a rescaled
        // allocation; available can never exceed allocated.
        if acc.available_capital > acc.allocated_capital {
            acc.available_capital = acc.allocated_capital;
        }
        if position_closed && acc.open_positions > 0 {
            acc.open_positions -= 1;
        }
        info!(
            container = %self.id,
            released = %size_usd,
            available = %acc.available_capital,
            open_positions = acc.open_positions,
            "Capital released"
        );
    }

    /// Record realized PnL from a closed (or partially closed) trade and
    /// drive the daily-loss circuit breaker.
    pub fn record_trade(&self, pnl: Decimal, won: bool) -> ContainerStatus {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        acc.realized_pnl += pnl;
        if won {
            acc.wins += 1;
        } else {
            acc.losses += 1;
        }
        if pnl < Decimal::ZERO {
            acc.daily_loss += -pnl;
            if acc.daily_loss >= self.limits.max_daily_loss
                && acc.status == ContainerStatus::Active
            {
                acc.status = ContainerStatus::Halted;
                error!(
                    container = %self.id,
                    daily_loss = %acc.daily_loss,
                    max_daily_loss = %self.limits.max_daily_loss,
                    "DAILY LOSS LIMIT BREACHED - container halted"
                );
            } else if acc.daily_loss >= self.limits.max_daily_loss / Decimal::TWO {
                warn!(
                    container = %self.id,
                    daily_loss = %acc.daily_loss,
                    "Daily loss past half of cap"
                );
            }
        }
        acc.status
    }

    /// Count one upstream API call against the daily quota. Returns false
    /// once the tier budget is exhausted.
    pub fn consume_api_call(&self) -> bool {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        if acc.api_calls_today >= self.limits.api_calls_per_day {
            return false;
        }
        acc.api_calls_today += 1;
        true
    }

    /// Attach a broker to this container.
    pub fn connect_broker(&self, broker: impl Into<String>) {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        acc.brokers.insert(broker.into());
    }

    #[must_use]
    pub fn connected_brokers(&self) -> Vec<String> {
        let acc = self.accounting.lock().expect("container mutex poisoned");
        acc.brokers.iter().cloned().collect()
    }

    /// Reset the daily accumulators at the day boundary; a halt caused by
    /// the daily-loss breaker is lifted.
    pub fn reset_daily(&self) {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        let previous = acc.daily_loss;
        acc.daily_loss = Decimal::ZERO;
        acc.api_calls_today = 0;
        if acc.status == ContainerStatus::Halted {
            acc.status = ContainerStatus::Active;
        }
        info!(container = %self.id, previous_daily_loss = %previous, "Daily counters reset");
    }

    /// Operator pause/unpause.
    pub fn set_suspended(&self, suspended: bool) {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        acc.status = if suspended {
            ContainerStatus::Suspended
        } else {
            ContainerStatus::Active
        };
        warn!(container = %self.id, status = %acc.status, "Container status changed by operator");
    }

    pub(crate) fn set_allocation_pct(&self, pct: Decimal) {
        let mut acc = self.accounting.lock().expect("container mutex poisoned");
        acc.allocation_pct = pct;
    }

    #[must_use]
    pub fn status(&self) -> ContainerStatus {
        self.accounting
            .lock()
            .expect("container mutex poisoned")
            .status
    }

    #[must_use]
    pub fn available_capital(&self) -> Decimal {
        self.accounting
            .lock()
            .expect("container mutex poisoned")
            .available_capital
    }

    #[must_use]
    pub fn allocated_capital(&self) -> Decimal {
        self.accounting
            .lock()
            .expect("container mutex poisoned")
            .allocated_capital
    }

    /// Consistent view of the whole accounting block.
    #[must_use]
    pub fn snapshot(&self) -> ContainerSnapshot {
        let acc = self.accounting.lock().expect("container mutex poisoned");
        ContainerSnapshot {
            status: acc.status,
            allocated_capital: acc.allocated_capital,
            available_capital: acc.available_capital,
            equity: acc.allocated_capital + acc.realized_pnl,
            allocation_pct: acc.allocation_pct,
            open_positions: acc.open_positions,
            realized_pnl: acc.realized_pnl,
            daily_loss: acc.daily_loss,
            wins: acc.wins,
            losses: acc.losses,
        }
    }
}
