//! Basis Harvester - Main Entry Point

use anyhow::Result;
use basis_harvester::config::Config;
use basis_harvester::exchange::{BinanceGateway, ExchangeGateway};
use basis_harvester::persistence::PositionStore;
use basis_harvester::position::PositionStatus;
use basis_harvester::shutdown::KillSwitch;
use basis_harvester::strategy::{MarketScanner, OrderManager};
use basis_harvester::supervisor::{RunOutcome, Supervisor, EMERGENCY_STOP_ENV};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Basis Harvester CLI
#[derive(Parser)]
#[command(name = "basis-harvester")]
#[command(version, about = "Delta-neutral cash-and-carry funding-rate harvesting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show persisted positions without starting the daemon
    Status {
        /// Path to the SQLite position store
        #[arg(short, long, default_value = "data/positions.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging()?;

    if let Some(Commands::Status { db }) = cli.command {
        return show_status(&db);
    }

    let code = run_daemon().await?;
    std::process::exit(code);
}

async fn run_daemon() -> Result<i32> {
    info!(
        "basis-harvester v{} starting",
        env!("CARGO_PKG_VERSION")
    );

    let config = Config::load()?;
    info!(
        exchange = %config.exchange.name,
        quote = %config.entry.quote_currency,
        min_funding_rate = %config.entry.min_funding_rate,
        min_volume_24h = %config.entry.min_volume_24h,
        min_spread = %config.entry.min_spread,
        notional = %config.entry.notional_per_entry,
        max_open_positions = config.limits.max_open_positions,
        "configuration loaded"
    );

    let gateway: Arc<dyn ExchangeGateway> = match config.exchange.name.as_str() {
        "binance" => Arc::new(BinanceGateway::new(&config.exchange)?),
        other => anyhow::bail!("unsupported exchange {:?}", other),
    };

    let kill = KillSwitch::new();
    if std::env::var(EMERGENCY_STOP_ENV).map(|v| v == "true").unwrap_or(false) {
        kill.engage("EMERGENCY_STOP set at startup");
    }

    let orders = Arc::new(OrderManager::new(
        gateway.clone(),
        &config.entry.quote_currency,
        kill.clone(),
    ));
    let store = PositionStore::open(&config.persistence.db_path)?;

    let scanner_config = config.entry.clone();
    let scanner_period = Duration::from_secs(config.timing.scanner_period_s);
    let (candidates_tx, candidates_rx) = mpsc::channel(4);

    let mut supervisor = Supervisor::new(
        config,
        gateway.clone(),
        orders,
        store,
        kill.clone(),
        candidates_rx,
    );

    if let Err(outcome) = supervisor.preflight().await {
        return Ok(outcome.exit_code());
    }
    if !supervisor.reconcile_startup().await? {
        return Ok(RunOutcome::ManualIntervention.exit_code());
    }

    // SIGINT engages the same kill switch as EMERGENCY_STOP.
    let signal_kill = kill.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal_kill.engage("SIGINT received");
    });

    let scanner_kill = kill.clone();
    let scanner_gateway = gateway.clone();
    tokio::spawn(async move {
        let mut scanner = MarketScanner::new(scanner_config);
        let mut ticker = interval(scanner_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if scanner_kill.is_engaged() {
                break;
            }
            let candidates = scanner.scan(scanner_gateway.as_ref()).await;
            if candidates_tx.send(candidates).await.is_err() {
                break;
            }
        }
    });

    let outcome = supervisor.run().await;
    info!(?outcome, code = outcome.exit_code(), "daemon exiting");
    Ok(outcome.exit_code())
}

fn show_status(db_path: &str) -> Result<()> {
    let store = PositionStore::open(db_path)?;
    let positions = store.load_all()?;

    if positions.is_empty() {
        println!("No positions recorded.");
        return Ok(());
    }

    let live = positions
        .iter()
        .filter(|p| p.status != PositionStatus::Closed)
        .count();
    println!("{} position(s), {} live", positions.len(), live);
    println!(
        "{:<28} {:<10} {:>12} {:>12} {:>10} {:>10}  {}",
        "id", "symbol", "spot_qty", "perp_qty", "spread", "fees", "status"
    );
    for p in positions {
        println!(
            "{:<28} {:<10} {:>12} {:>12} {:>10} {:>10}  {}",
            p.id,
            p.symbol,
            p.spot_qty,
            p.perp_qty,
            p.entry_spread,
            p.total_fees,
            p.status.as_str()
        );
    }
    Ok(())
}

fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "basis-harvester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the flush guard alive for the program duration.
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("basis_harvester=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}
