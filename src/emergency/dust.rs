//! Dust-to-USD recovery pipeline.
//!
//! Four phases: Identify positions below the dust threshold, Convert
//! each to USD by market sell (or simulate in dry-run), Verify that the
//! USD cash balance strictly increased, then Resume trading through the
//! recovery controller. A partial conversion failure still verifies what
//! succeeded; a total failure reports failure and does not resume.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;
use tracing::{info, warn};

use super::resolution::SymbolResolver;
use crate::broker::{BrokerAdapter, BrokerError};
use crate::capital::TradingContainer;
use crate::ledger::PositionLedger;
use crate::types::OrderKind;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct DustConfig {
    /// Positions valued below this are dust.
    pub dust_threshold_usd: Decimal,
    /// Simulate conversions instead of selling; verification is skipped.
    pub dry_run: bool,
}

impl Default for DustConfig {
    fn default() -> Self {
        Self {
            dust_threshold_usd: dec!(5),
            dry_run: true,
        }
    }
}

/// Errors terminating the pipeline.
#[derive(Error, Debug)]
pub enum DustError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Every identified conversion failed; trading is not resumed.
    #[error("All {attempted} dust conversions failed")]
    AllConversionsFailed { attempted: usize },

    /// Conversions reported success but USD cash did not increase.
    #[error("Dust verification failed: USD {before} before, {after} after")]
    VerificationFailed { before: Decimal, after: Decimal },
}

/// External controller that re-enables trading after recovery.
#[async_trait]
pub trait RecoveryController: Send + Sync {
    async fn resume_trading(&self);
}

/// Outcome of one pipeline run.
#[derive(Debug, Clone)]
pub struct DustReport {
    /// (symbol, usd value) of positions identified as dust.
    pub identified: Vec<(String, Decimal)>,
    pub converted: Vec<String>,
    pub failed: Vec<String>,
    pub usd_before: Decimal,
    pub usd_after: Decimal,
    /// False only in dry-run, where verification is skipped.
    pub verified: bool,
    pub resumed: bool,
}

/// Dust recovery pipeline.
pub struct DustPipeline {
    config: DustConfig,
    ledger: Arc<PositionLedger>,
    resolver: Arc<SymbolResolver>,
}

impl DustPipeline {
    #[must_use]
    pub fn new(
        config: DustConfig,
        ledger: Arc<PositionLedger>,
        resolver: Arc<SymbolResolver>,
    ) -> Self {
        Self {
            config,
            ledger,
            resolver,
        }
    }

    /// Run Identify → Convert → Verify → Resume for one container.
    pub async fn run(
        &self,
        container: &Arc<TradingContainer>,
        broker: &Arc<dyn BrokerAdapter>,
        controller: &Arc<dyn RecoveryController>,
    ) -> Result<DustReport, DustError> {
        let usd_before = self.usd_balance(broker).await?;

        // Phase 1: Identify.
        let mut identified = Vec::new();
        for position in self.ledger.positions_for_container(container.id()) {
            let price = match self.resolver.resolve_price(broker, &position.symbol).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(symbol = %position.symbol, error = %e, "No price; skipping dust scan for symbol");
                    continue;
                }
            };
            let value = position.remaining_quantity() * price;
            if value < self.config.dust_threshold_usd {
                identified.push((position.symbol.clone(), value));
            }
        }
        info!(
            container = %container.id(),
            count = identified.len(),
            dry_run = self.config.dry_run,
            "Dust scan complete"
        );

        if identified.is_empty() {
            controller.resume_trading().await;
            return Ok(DustReport {
                identified,
                converted: Vec::new(),
                failed: Vec::new(),
                usd_before,
                usd_after: usd_before,
                verified: !self.config.dry_run,
                resumed: true,
            });
        }

        // Phase 2: Convert.
        let mut converted = Vec::new();
        let mut failed = Vec::new();
        for (symbol, value) in &identified {
            if self.config.dry_run {
                info!(symbol = %symbol, value = %value, "Dry run: would convert dust to USD");
                converted.push(symbol.clone());
                continue;
            }
            match self.convert_one(container, broker, symbol).await {
                Ok(()) => converted.push(symbol.clone()),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Dust conversion failed");
                    self.resolver.mark_liquidation_failed(symbol);
                    failed.push(symbol.clone());
                }
            }
        }

        if converted.is_empty() {
            return Err(DustError::AllConversionsFailed {
                attempted: identified.len(),
            });
        }

        // Phase 3: Verify (against whatever succeeded; skipped in dry-run).
        let usd_after = if self.config.dry_run {
            usd_before
        } else {
            let after = self.usd_balance(broker).await?;
            if after <= usd_before {
                return Err(DustError::VerificationFailed {
                    before: usd_before,
                    after,
                });
            }
            after
        };

        // Phase 4: Resume.
        controller.resume_trading().await;
        info!(
            container = %container.id(),
            converted = converted.len(),
            failed = failed.len(),
            recovered_usd = %(usd_after - usd_before),
            "Dust pipeline complete; trading resumed"
        );

        Ok(DustReport {
            identified,
            converted,
            failed,
            usd_before,
            usd_after,
            verified: !self.config.dry_run,
            resumed: true,
        })
    }

    /// Sell one dust position under the same close lock as live exits.
    async fn convert_one(
        &self,
        container: &Arc<TradingContainer>,
        broker: &Arc<dyn BrokerAdapter>,
        symbol: &str,
    ) -> Result<(), BrokerError> {
        let guard = self
            .ledger
            .locks()
            .try_acquire_close(container.id(), symbol)
            .ok_or_else(|| {
                BrokerError::Other(format!("close already in progress for {symbol}"))
            })?;

        let position = self
            .ledger
            .get_position(container.id(), symbol)
            .ok_or_else(|| BrokerError::Other(format!("no ledger position for {symbol}")))?;

        guard.mark_exit_order_active();
        broker
            .place_order(
                symbol,
                position.side.exit_side(),
                OrderKind::Market,
                position.remaining_quantity(),
            )
            .await?;

        if self.ledger.remove_position(container.id(), symbol).is_ok() {
            container.release_capital(position.remaining_size_usd(), true);
        }
        Ok(())
    }

    async fn usd_balance(&self, broker: &Arc<dyn BrokerAdapter>) -> Result<Decimal, BrokerError> {
        Ok(broker
            .get_balances()
            .await?
            .get("USD")
            .copied()
            .unwrap_or(Decimal::ZERO))
    }
}
