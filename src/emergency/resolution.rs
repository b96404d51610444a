//! Symbol price resolution and delisting state machine.
//!
//! A price fetch that fails goes through alternate ticker spellings and
//! then a USD-bridge estimate through a major pair. Symbols that keep
//! failing are marked delisted and drop out of exposure accounting;
//! a delisted symbol whose liquidation also fails is permanent dust.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerAdapter, BrokerError};

/// Per-symbol resolution state.
///
/// Transitions: `Ok → Unknown` on the first failed fetch, `Unknown →
/// Delisted` after the configured run of consecutive failures, and
/// `Delisted → PermanentDust` on a confirmed failed liquidation. Any
/// successful fetch resets a non-terminal state to `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetResolutionState {
    Ok,
    Unknown,
    Delisted,
    PermanentDust,
}

impl AssetResolutionState {
    /// Delisted and permanent-dust symbols are excluded from exposure
    /// and position-count accounting.
    #[must_use]
    pub fn is_excluded(&self) -> bool {
        matches!(self, Self::Delisted | Self::PermanentDust)
    }
}

impl std::fmt::Display for AssetResolutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Delisted => write!(f, "DELISTED"),
            Self::PermanentDust => write!(f, "PERMANENT_DUST"),
        }
    }
}

/// Resolver configuration.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Consecutive failed fetches before a symbol is delisted.
    pub max_consecutive_failures: u32,
    /// Alternate quote currencies to try ("BTC-USDT" for "BTC-USD").
    pub alternate_quotes: Vec<String>,
    /// Bridge assets for USD estimates (price via BASE-BRIDGE × BRIDGE-USD).
    pub bridge_assets: Vec<String>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            alternate_quotes: vec!["USDT".to_string(), "USDC".to_string()],
            bridge_assets: vec!["BTC".to_string(), "ETH".to_string()],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SymbolRecord {
    state: AssetResolutionState,
    consecutive_failures: u32,
}

impl Default for SymbolRecord {
    fn default() -> Self {
        Self {
            state: AssetResolutionState::Ok,
            consecutive_failures: 0,
        }
    }
}

/// Price resolver with delisting tracking.
pub struct SymbolResolver {
    config: ResolverConfig,
    records: DashMap<String, SymbolRecord>,
}

impl SymbolResolver {
    #[must_use]
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(ResolverConfig::default())
    }

    /// Current state for a symbol.
    #[must_use]
    pub fn state(&self, symbol: &str) -> AssetResolutionState {
        self.records
            .get(symbol)
            .map(|r| r.state)
            .unwrap_or(AssetResolutionState::Ok)
    }

    /// True if the symbol must be excluded from exposure accounting.
    #[must_use]
    pub fn is_excluded(&self, symbol: &str) -> bool {
        self.state(symbol).is_excluded()
    }

    /// Resolve a USD price, trying the direct pair, alternate quote
    /// spellings, then a bridge estimate. A total failure counts toward
    /// the delisting threshold.
    pub async fn resolve_price(
        &self,
        broker: &Arc<dyn BrokerAdapter>,
        symbol: &str,
    ) -> Result<Decimal, BrokerError> {
        match broker.get_current_price(symbol).await {
            Ok(price) => {
                self.record_success(symbol);
                return Ok(price);
            }
            Err(e) => {
                debug!(symbol = symbol, error = %e, "Direct price fetch failed");
            }
        }

        let base = symbol.split('-').next().unwrap_or(symbol);

        for quote in &self.config.alternate_quotes {
            let alternate = format!("{base}-{quote}");
            if alternate == symbol {
                continue;
            }
            if let Ok(price) = broker.get_current_price(&alternate).await {
                info!(
                    symbol = symbol,
                    alternate = %alternate,
                    price = %price,
                    "Price resolved via alternate spelling"
                );
                self.record_success(symbol);
                return Ok(price);
            }
        }

        for bridge in &self.config.bridge_assets {
            if base == bridge {
                continue;
            }
            let leg = format!("{base}-{bridge}");
            let anchor = format!("{bridge}-USD");
            let (Ok(leg_price), Ok(anchor_price)) = (
                broker.get_current_price(&leg).await,
                broker.get_current_price(&anchor).await,
            ) else {
                continue;
            };
            let estimate = leg_price * anchor_price;
            info!(
                symbol = symbol,
                bridge = %bridge,
                estimate = %estimate,
                "Price estimated via USD bridge"
            );
            self.record_success(symbol);
            return Ok(estimate);
        }

        self.record_failure(symbol);
        Err(BrokerError::PriceUnavailable(symbol.to_string()))
    }

    /// A confirmed failed liquidation attempt pushes a delisted symbol
    /// into permanent dust.
    pub fn mark_liquidation_failed(&self, symbol: &str) {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        if record.state == AssetResolutionState::Delisted {
            record.state = AssetResolutionState::PermanentDust;
            error!(symbol = symbol, "Liquidation failed for delisted symbol; marked permanent dust");
        }
    }

    fn record_success(&self, symbol: &str) {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        record.consecutive_failures = 0;
        if record.state == AssetResolutionState::Unknown
            || record.state == AssetResolutionState::Delisted
        {
            info!(symbol = symbol, previous = %record.state, "Symbol resolution recovered");
            record.state = AssetResolutionState::Ok;
        }
    }

    fn record_failure(&self, symbol: &str) {
        let mut record = self.records.entry(symbol.to_string()).or_default();
        if record.state == AssetResolutionState::PermanentDust {
            return;
        }
        record.consecutive_failures += 1;
        if record.consecutive_failures >= self.config.max_consecutive_failures {
            if record.state != AssetResolutionState::Delisted {
                error!(
                    symbol = symbol,
                    failures = record.consecutive_failures,
                    "Symbol delisted after repeated price failures; excluded from exposure"
                );
                record.state = AssetResolutionState::Delisted;
            }
        } else if record.state == AssetResolutionState::Ok {
            warn!(symbol = symbol, "Price unresolved; symbol state now UNKNOWN");
            record.state = AssetResolutionState::Unknown;
        }
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::PaperBroker;
    use rust_decimal_macros::dec;

    fn broker() -> Arc<dyn BrokerAdapter> {
        Arc::new(PaperBroker::new())
    }

    #[tokio::test]
    async fn test_direct_price_resolution() {
        let paper = Arc::new(PaperBroker::new());
        paper.set_price("BTC-USD", dec!(50000)).await;
        let resolver = SymbolResolver::with_defaults();

        let broker: Arc<dyn BrokerAdapter> = paper;
        let price = resolver.resolve_price(&broker, "BTC-USD").await.unwrap();
        assert_eq!(price, dec!(50000));
        assert_eq!(resolver.state("BTC-USD"), AssetResolutionState::Ok);
    }

    #[tokio::test]
    async fn test_alternate_spelling_fallback() {
        let paper = Arc::new(PaperBroker::new());
        paper.set_price("XYZ-USDT", dec!(2.5)).await;
        let resolver = SymbolResolver::with_defaults();

        let broker: Arc<dyn BrokerAdapter> = paper;
        let price = resolver.resolve_price(&broker, "XYZ-USD").await.unwrap();
        assert_eq!(price, dec!(2.5));
    }

    #[tokio::test]
    async fn test_usd_bridge_estimate() {
        let paper = Arc::new(PaperBroker::new());
        paper.set_price("XYZ-BTC", dec!(0.0001)).await;
        paper.set_price("BTC-USD", dec!(50000)).await;
        let resolver = SymbolResolver::with_defaults();

        let broker: Arc<dyn BrokerAdapter> = paper;
        let price = resolver.resolve_price(&broker, "XYZ-USD").await.unwrap();
        assert_eq!(price, dec!(5));
    }

    #[tokio::test]
    async fn test_delisting_after_consecutive_failures() {
        let resolver = SymbolResolver::new(ResolverConfig {
            max_consecutive_failures: 3,
            ..Default::default()
        });
        let broker = broker();

        assert!(resolver.resolve_price(&broker, "GONE-USD").await.is_err());
        assert_eq!(resolver.state("GONE-USD"), AssetResolutionState::Unknown);

        assert!(resolver.resolve_price(&broker, "GONE-USD").await.is_err());
        assert!(resolver.resolve_price(&broker, "GONE-USD").await.is_err());
        assert_eq!(resolver.state("GONE-USD"), AssetResolutionState::Delisted);
        assert!(resolver.is_excluded("GONE-USD"));
    }

    #[tokio::test]
    async fn test_permanent_dust_after_failed_liquidation() {
        let resolver = SymbolResolver::new(ResolverConfig {
            max_consecutive_failures: 1,
            ..Default::default()
        });
        let broker = broker();
        assert!(resolver.resolve_price(&broker, "GONE-USD").await.is_err());
        assert_eq!(resolver.state("GONE-USD"), AssetResolutionState::Delisted);

        resolver.mark_liquidation_failed("GONE-USD");
        assert_eq!(resolver.state("GONE-USD"), AssetResolutionState::PermanentDust);

        // Permanent dust does not recover.
        resolver.record_success("GONE-USD");
        assert_eq!(resolver.state("GONE-USD"), AssetResolutionState::PermanentDust);
    }

    #[tokio::test]
    async fn test_recovery_resets_failure_count() {
        let paper = Arc::new(PaperBroker::new());
        let resolver = SymbolResolver::new(ResolverConfig {
            max_consecutive_failures: 2,
            ..Default::default()
        });

        let broker: Arc<dyn BrokerAdapter> = paper.clone();
        assert!(resolver.resolve_price(&broker, "ABC-USD").await.is_err());

        paper.set_price("ABC-USD", dec!(1)).await;
        assert!(resolver.resolve_price(&broker, "ABC-USD").await.is_ok());
        assert_eq!(resolver.state("ABC-USD"), AssetResolutionState::Ok);

        paper.set_fail_prices(true);
        assert!(resolver.resolve_price(&broker, "ABC-USD").await.is_err());
        // One failure after recovery: not yet delisted.
        assert_eq!(resolver.state("ABC-USD"), AssetResolutionState::Unknown);
    }
}
