//! CLI argument parsing using clap.

mod config;

pub use config::{ScenarioError, ScenarioFile, ScenarioPosition};

use clap::{Parser, Subcommand};

/// AlgoLedger - position lifecycle and reconciliation engine
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub verbose: String,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the paper-trading loop against a scenario
    Run {
        /// Path to the scenario file (balances, prices, positions)
        #[arg(long)]
        scenario: String,
        /// Path to the state snapshot file
        #[arg(long, default_value = "trade_state.json")]
        state_file: String,
        /// Optional JSON file of trade signals to inject
        #[arg(long)]
        signals: Option<String>,
        /// Capital allocated to the local container (USD)
        #[arg(long, default_value_t = 10000.0)]
        capital: f64,
        /// Seconds between stop-evaluation cycles
        #[arg(long, default_value_t = 60)]
        tick_secs: u64,
        /// Enable reconciliation auto-actions (default: alert only)
        #[arg(long, default_value_t = false)]
        auto_actions: bool,
    },

    /// Run one reconciliation pass of a snapshot against a scenario
    Reconcile {
        /// Path to the scenario file representing exchange truth
        #[arg(long)]
        scenario: String,
        /// Path to the state snapshot file
        #[arg(long, default_value = "trade_state.json")]
        state_file: String,
    },

    /// Identify and convert dust positions to USD
    DustSweep {
        /// Path to the scenario file
        #[arg(long)]
        scenario: String,
        /// Path to the state snapshot file
        #[arg(long, default_value = "trade_state.json")]
        state_file: String,
        /// USD value below which a position is dust
        #[arg(long, default_value_t = 5.0)]
        threshold: f64,
        /// Simulate conversions without selling
        #[arg(long, default_value_t = true)]
        dry_run: bool,
    },

    /// Print a summary of the state snapshot file
    Snapshot {
        /// Path to the state snapshot file
        #[arg(long, default_value = "trade_state.json")]
        state_file: String,
    },
}
