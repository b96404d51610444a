//! Stop-loss trigger predicate.
//!
//! The trigger is an explicit, independently testable predicate over an
//! open position and the current price. Multiple threshold conditions
//! combine with OR by default (any condition fires the stop);
//! configuration can switch the combination to AND for strategies that
//! want confluence before bailing out.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ledger::Position;
use crate::types::PositionSide;

/// A single stop threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StopCondition {
    /// Price crosses the position's own stop-loss level (no-op if the
    /// position has none).
    PriceLevel,
    /// Adverse move from entry exceeds this fraction (0.05 = 5%).
    AdverseMove(Decimal),
    /// Unrealized loss on the remaining size exceeds this USD amount.
    UnrealizedLossUsd(Decimal),
}

impl StopCondition {
    fn is_met(&self, position: &Position, price: Decimal) -> bool {
        match self {
            StopCondition::PriceLevel => match (position.stop_loss, position.side) {
                (Some(stop), PositionSide::Long) => price <= stop,
                (Some(stop), PositionSide::Short) => price >= stop,
                (None, _) => false,
            },
            StopCondition::AdverseMove(fraction) => {
                if position.entry_price.is_zero() {
                    return false;
                }
                let change = (price - position.entry_price) / position.entry_price;
                match position.side {
                    PositionSide::Long => -change >= *fraction,
                    PositionSide::Short => change >= *fraction,
                }
            }
            StopCondition::UnrealizedLossUsd(limit) => {
                let pnl = position.realized_pnl(price, position.remaining_quantity());
                pnl < Decimal::ZERO && -pnl >= *limit
            }
        }
    }
}

/// How multiple conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCombination {
    /// Any condition fires the stop (default).
    Any,
    /// Every condition must fire.
    All,
}

/// The stop-loss predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopPolicy {
    pub conditions: Vec<StopCondition>,
    pub combination: TriggerCombination,
}

impl StopPolicy {
    #[must_use]
    pub fn new(conditions: Vec<StopCondition>, combination: TriggerCombination) -> Self {
        Self {
            conditions,
            combination,
        }
    }

    /// Price-level stop only, OR combination.
    #[must_use]
    pub fn price_level_only() -> Self {
        Self::new(vec![StopCondition::PriceLevel], TriggerCombination::Any)
    }

    /// True if the position should be stopped out at `price`.
    #[must_use]
    pub fn should_stop(&self, position: &Position, price: Decimal) -> bool {
        if self.conditions.is_empty() {
            return false;
        }
        match self.combination {
            TriggerCombination::Any => self
                .conditions
                .iter()
                .any(|c| c.is_met(position, price)),
            TriggerCombination::All => self
                .conditions
                .iter()
                .all(|c| c.is_met(position, price)),
        }
    }
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self::price_level_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ContainerId;
    use rust_decimal_macros::dec;

    fn long_with_stop() -> Position {
        Position::new(
            ContainerId::new("c1"),
            "BTC-USD",
            PositionSide::Long,
            dec!(0.01),
            dec!(50000),
            Some(dec!(48000)),
        )
    }

    #[test]
    fn test_price_level_stop() {
        let policy = StopPolicy::price_level_only();
        let position = long_with_stop();

        assert!(!policy.should_stop(&position, dec!(49000)));
        assert!(policy.should_stop(&position, dec!(48000)));
        assert!(policy.should_stop(&position, dec!(47000)));
    }

    #[test]
    fn test_short_price_level_stop() {
        let mut position = long_with_stop();
        position.side = PositionSide::Short;
        position.stop_loss = Some(dec!(52000));

        let policy = StopPolicy::price_level_only();
        assert!(!policy.should_stop(&position, dec!(51000)));
        assert!(policy.should_stop(&position, dec!(52000)));
    }

    #[test]
    fn test_or_combination_any_condition_fires() {
        let policy = StopPolicy::new(
            vec![
                StopCondition::PriceLevel,
                StopCondition::AdverseMove(dec!(0.10)),
            ],
            TriggerCombination::Any,
        );
        let position = long_with_stop();

        // 3% down: neither the level (48000) nor the 10% move.
        assert!(!policy.should_stop(&position, dec!(48500)));
        // Level hit fires alone.
        assert!(policy.should_stop(&position, dec!(47900)));

        // 12% adverse move fires alone even without a stop level.
        let mut no_level = long_with_stop();
        no_level.stop_loss = None;
        assert!(policy.should_stop(&no_level, dec!(44000)));
    }

    #[test]
    fn test_and_combination_needs_all() {
        let policy = StopPolicy::new(
            vec![
                StopCondition::PriceLevel,
                StopCondition::UnrealizedLossUsd(dec!(30)),
            ],
            TriggerCombination::All,
        );
        let position = long_with_stop();

        // Level hit but loss only $21: not enough under AND.
        assert!(!policy.should_stop(&position, dec!(47900)));
        // Level hit and loss $40.
        assert!(policy.should_stop(&position, dec!(46000)));
    }

    #[test]
    fn test_empty_policy_never_stops() {
        let policy = StopPolicy::new(vec![], TriggerCombination::Any);
        assert!(!policy.should_stop(&long_with_stop(), dec!(1)));
    }
}
