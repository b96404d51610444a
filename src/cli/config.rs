//! Scenario file loading for paper-mode commands.
//!
//! A scenario seeds the paper broker with exchange-side truth: asset
//! balances, prices and open positions.

use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors loading a scenario file.
#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("IO error reading scenario: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scenario file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// An exchange-side position seeded into the paper broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioPosition {
    pub symbol: String,
    pub quantity: Decimal,
}

/// Exchange-side truth for paper-mode commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScenarioFile {
    /// Asset ticker -> balance in base units.
    #[serde(default)]
    pub balances: HashMap<String, Decimal>,
    /// Symbol -> price.
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
    #[serde(default)]
    pub positions: Vec<ScenarioPosition>,
}

impl ScenarioFile {
    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}
