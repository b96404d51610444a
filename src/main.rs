use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use algoledger::broker::{BrokerAdapter, PaperBroker};
use algoledger::capital::{CapitalEngine, CapitalEngineConfig, Tier};
use algoledger::cli::{Cli, Commands, ScenarioFile};
use algoledger::emergency::{DustConfig, DustPipeline, RecoveryController, SymbolResolver};
use algoledger::execution::{ExecutionConfig, ExecutionCoordinator};
use algoledger::ledger::PositionLedger;
use algoledger::reconcile::{
    ClassifyConfig, ReconciliationWatchdog, RestartManager, SnapshotStore, WatchdogConfig,
};
use algoledger::record::TracingRecorder;
use algoledger::signal::TradeSignal;
use algoledger::trading::{TradingWorker, WorkerConfig, WorkerSupervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.verbose)),
        )
        .init();

    match cli.command {
        Commands::Run {
            scenario,
            state_file,
            signals,
            capital,
            tick_secs,
            auto_actions,
        } => {
            run_paper(
                &scenario,
                &state_file,
                signals.as_deref(),
                capital,
                tick_secs,
                auto_actions,
            )
            .await?;
        }
        Commands::Reconcile {
            scenario,
            state_file,
        } => {
            run_reconcile(&scenario, &state_file).await?;
        }
        Commands::DustSweep {
            scenario,
            state_file,
            threshold,
            dry_run,
        } => {
            run_dust_sweep(&scenario, &state_file, threshold, dry_run).await?;
        }
        Commands::Snapshot { state_file } => {
            print_snapshot(&state_file)?;
        }
    }

    Ok(())
}

/// Seed a paper broker from a scenario file.
async fn broker_from_scenario(scenario: &ScenarioFile) -> Arc<PaperBroker> {
    let broker = Arc::new(PaperBroker::new());
    for (asset, qty) in &scenario.balances {
        broker.set_balance(asset, *qty).await;
    }
    for (symbol, price) in &scenario.prices {
        broker.set_price(symbol, *price).await;
    }
    for position in &scenario.positions {
        broker.set_position(&position.symbol, position.quantity).await;
    }
    broker
}

/// Mandatory startup ordering: load the snapshot, reconcile the loaded
/// state against broker truth, and only then allow trading.
async fn reconcile_on_start(
    restart: &Arc<RestartManager>,
    broker: &Arc<dyn BrokerAdapter>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (_, restarted) = restart.load_state()?;
    if restarted {
        info!("Restart detected; reconciling snapshot against exchange truth");
    }
    let positions = broker.get_positions().await?;
    let balances = broker.get_balances().await?;
    let open_orders = broker.get_open_orders().await?;
    let report = restart.reconcile_with_exchange(&positions, &balances, &open_orders);
    info!(
        status = %report.status,
        discrepancies = report.discrepancies.len(),
        orphaned_orders = report.orphaned_orders.len(),
        "Startup reconciliation report"
    );
    for warning in &report.warnings {
        warn!(warning = warning.as_str(), "Startup reconciliation warning");
    }
    Ok(())
}

async fn run_paper(
    scenario_path: &str,
    state_file: &str,
    signals_path: Option<&str>,
    capital: f64,
    tick_secs: u64,
    auto_actions: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioFile::load(scenario_path)?;
    let paper = broker_from_scenario(&scenario).await;
    let broker: Arc<dyn BrokerAdapter> = paper;

    let allocated = Decimal::from_f64(capital)
        .ok_or("invalid --capital value")?;
    let engine = CapitalEngine::new(CapitalEngineConfig {
        max_containers: 10,
        total_capital_usd: allocated,
    });
    let container = engine.create_container("local", allocated, Tier::Standard)?;
    container.connect_broker("paper");

    let ledger = Arc::new(PositionLedger::new());
    let recorder = Arc::new(TracingRecorder::new());
    let coordinator = Arc::new(ExecutionCoordinator::new(
        broker.clone(),
        ledger.clone(),
        recorder.clone(),
        ExecutionConfig::default(),
    ));
    let restart = Arc::new(RestartManager::new(
        SnapshotStore::new(state_file),
        ClassifyConfig::default(),
    ));

    reconcile_on_start(&restart, &broker).await?;

    let watchdog = Arc::new(ReconciliationWatchdog::new(
        WatchdogConfig {
            enable_auto_actions: auto_actions,
            ..Default::default()
        },
        ledger.clone(),
        recorder,
    ));
    let watchdog_task = watchdog.start_periodic(container.clone(), broker.clone());

    let (signal_tx, signal_rx) = mpsc::channel::<TradeSignal>(64);
    let worker = TradingWorker::new(
        container,
        broker,
        coordinator,
        restart,
        Arc::new(SymbolResolver::with_defaults()),
        WorkerConfig {
            tick_interval: Duration::from_secs(tick_secs),
            ..Default::default()
        },
    );

    let mut supervisor = WorkerSupervisor::new(Duration::from_millis(500));
    supervisor.spawn_worker("local-paper", worker, signal_rx);

    if let Some(path) = signals_path {
        let raw = std::fs::read_to_string(path)?;
        let signals: Vec<TradeSignal> = serde_json::from_str(&raw)?;
        info!(count = signals.len(), "Injecting signals from file");
        for signal in signals {
            signal_tx.send(signal).await?;
        }
    }

    info!("Paper trading running; press Ctrl-C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
        failures = supervisor.run_to_completion() => {
            warn!(failures = failures, "All workers exited");
        }
    }
    supervisor.shutdown();
    watchdog_task.abort();
    Ok(())
}

async fn run_reconcile(
    scenario_path: &str,
    state_file: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioFile::load(scenario_path)?;
    let paper = broker_from_scenario(&scenario).await;
    let broker: Arc<dyn BrokerAdapter> = paper;

    let restart = Arc::new(RestartManager::new(
        SnapshotStore::new(state_file),
        ClassifyConfig::default(),
    ));
    let (_, restarted) = restart.load_state()?;
    if !restarted {
        warn!("No snapshot found; nothing to reconcile");
    }

    let positions = broker.get_positions().await?;
    let balances = broker.get_balances().await?;
    let open_orders = broker.get_open_orders().await?;
    let report = restart.reconcile_with_exchange(&positions, &balances, &open_orders);

    println!("status: {}", report.status);
    for d in &report.discrepancies {
        println!(
            "  {} {} exchange={} internal={} usd={} -> {}",
            d.kind, d.symbol, d.exchange_balance, d.internal_balance, d.usd_value, d.recommended
        );
    }
    for o in &report.orphaned_orders {
        println!("  orphaned order {} on {} ({})", o.id, o.symbol, o.status);
    }
    Ok(())
}

struct LoggingRecovery;

#[async_trait::async_trait]
impl RecoveryController for LoggingRecovery {
    async fn resume_trading(&self) {
        info!("Recovery controller: trading resumed");
    }
}

async fn run_dust_sweep(
    scenario_path: &str,
    state_file: &str,
    threshold: f64,
    dry_run: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let scenario = ScenarioFile::load(scenario_path)?;
    let paper = broker_from_scenario(&scenario).await;
    let broker: Arc<dyn BrokerAdapter> = paper;

    // Rebuild the ledger from the snapshot so the sweep sees the same
    // positions the engine would.
    let store = SnapshotStore::new(state_file);
    let ledger = Arc::new(PositionLedger::new());
    let engine = CapitalEngine::default();
    let container = engine.create_container(
        "local",
        Decimal::from_f64(1_000_000.0).unwrap_or(Decimal::ONE),
        Tier::Professional,
    )?;
    if let Some(snapshot) = store.load()? {
        for position in snapshot.positions {
            let size = position.remaining_size_usd();
            ledger.insert_position(position)?;
            let _ = container.allocate_capital(size);
        }
    }

    let threshold = Decimal::from_f64(threshold).ok_or("invalid --threshold value")?;
    let pipeline = DustPipeline::new(
        DustConfig {
            dust_threshold_usd: threshold,
            dry_run,
        },
        ledger,
        Arc::new(SymbolResolver::with_defaults()),
    );
    let controller: Arc<dyn RecoveryController> = Arc::new(LoggingRecovery);

    let report = pipeline.run(&container, &broker, &controller).await?;
    println!(
        "identified={} converted={} failed={} recovered_usd={} dry_run={}",
        report.identified.len(),
        report.converted.len(),
        report.failed.len(),
        report.usd_after - report.usd_before,
        dry_run
    );
    Ok(())
}

fn print_snapshot(state_file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let store = SnapshotStore::new(state_file);
    match store.load()? {
        None => println!("no snapshot at {state_file}"),
        Some(snapshot) => {
            println!("timestamp:      {}", snapshot.timestamp);
            println!("trading_state:  {}", snapshot.trading_state);
            println!("positions:      {}", snapshot.positions.len());
            for p in &snapshot.positions {
                println!(
                    "  {} {} qty={} entry={} remaining={}",
                    p.symbol, p.side, p.quantity, p.entry_price, p.remaining
                );
            }
            println!("pending_orders: {}", snapshot.pending_orders.len());
            println!("last_trade_id:  {:?}", snapshot.last_trade_id);
            println!("last_signal_id: {:?}", snapshot.last_signal_id);
        }
    }
    Ok(())
}
