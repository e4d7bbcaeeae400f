//! Futures caller
//!
//! Signal-driven perpetual futures trading core: open / close / profit-lock
//! primitives, six caller modes and a paper matching engine for backtests
//! and paper runs.

mod broker;
mod caller;
mod config;
mod db;
mod events;
mod exchange;
mod metrics;
mod models;
mod runner;
mod strategy;
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::broker::{FileGuiderSource, GuiderSource, HistoryFeeder};
use crate::config::{AppConfig, CallerMode};
use crate::db::{OrderRepository, SqliteOrderRepository};
use crate::events::{CallerEvent, LogNotifier};
use crate::runner::Runner;
use crate::strategy::MatcherSet;

/// Futures caller CLI.
#[derive(Parser)]
#[command(name = "caller")]
#[command(about = "Signal-driven futures trading with a paper matching engine", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, env = "CALLER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay candle history through the caller and print the results
    Backtest {
        /// JSON file with the candle history
        #[arg(long)]
        candles: PathBuf,

        /// Caller mode, overrides the config file
        #[arg(short, long, value_enum)]
        mode: Option<CallerMode>,

        /// Initial quote balance
        #[arg(short, long)]
        balance: Option<Decimal>,

        /// Only replay candles at or after this time (RFC 3339)
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        /// Only replay candles at or before this time (RFC 3339)
        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// Guider positions file for watchdog mode
        #[arg(long)]
        guider: Option<PathBuf>,

        /// Order log database url
        #[arg(short, long)]
        database: Option<String>,

        /// Block new entries on a configured pair (repeatable)
        #[arg(long = "disable", value_name = "PAIR")]
        disabled: Vec<String>,
    },

    /// Stream candle history in real time with the wall-clock tickers running
    Paper {
        /// JSON file with the candle history
        #[arg(long)]
        candles: PathBuf,

        /// Caller mode, overrides the config file
        #[arg(short, long, value_enum)]
        mode: Option<CallerMode>,

        /// Initial quote balance
        #[arg(short, long)]
        balance: Option<Decimal>,

        /// Delay between candles in milliseconds
        #[arg(long, default_value = "1000")]
        pace_ms: u64,

        /// Guider positions file for watchdog mode
        #[arg(long)]
        guider: Option<PathBuf>,

        /// Order log database url
        #[arg(short, long)]
        database: Option<String>,

        /// Block new entries on a configured pair (repeatable)
        #[arg(long = "disable", value_name = "PAIR")]
        disabled: Vec<String>,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Backtest {
            candles,
            mode,
            balance,
            from,
            to,
            guider,
            database,
            disabled,
        } => {
            apply_overrides(&mut config, mode, balance, guider, database)?;
            let feeder = Arc::new(HistoryFeeder::from_file(&candles)?);
            let mut runner = build_runner(&config, feeder).await?;
            disable_pairs(&runner, disabled);

            let report = runner.backtest(from, to).await?;
            println!("{}", report);
        }

        Commands::Paper {
            candles,
            mode,
            balance,
            pace_ms,
            guider,
            database,
            disabled,
        } => {
            apply_overrides(&mut config, mode, balance, guider, database)?;
            let feeder = HistoryFeeder::from_file(&candles)?.with_pace(Duration::from_millis(pace_ms));
            let runner = build_runner(&config, Arc::new(feeder)).await?;
            disable_pairs(&runner, disabled);

            info!(pace_ms, "Press Ctrl+C to stop");
            let report = runner.paper().await?;
            println!("{}", report);
        }

        Commands::Config => {
            let rendered = serde_json::to_string_pretty(&config).context("Failed to render config")?;
            println!("{}", rendered);
        }
    }

    Ok(())
}

fn apply_overrides(
    config: &mut AppConfig,
    mode: Option<CallerMode>,
    balance: Option<Decimal>,
    guider: Option<PathBuf>,
    database: Option<String>,
) -> Result<()> {
    if let Some(mode) = mode {
        config.caller.mode = mode;
    }
    if let Some(balance) = balance {
        config.exchange.initial_balance = balance;
    }
    if let Some(guider) = guider {
        config.caller.watchdog.guider_file = Some(guider.display().to_string());
    }
    if let Some(database) = database {
        config.database_url = database;
    }
    config.validate()
}

async fn build_runner(config: &AppConfig, feeder: Arc<HistoryFeeder>) -> Result<Runner> {
    let available = feeder.pairs();
    for option in &config.pairs {
        if !available.contains(&option.pair) {
            warn!(pair = %option.pair, "No candles for configured pair");
        }
    }

    let repository: Arc<dyn OrderRepository> = Arc::new(SqliteOrderRepository::new(&config.database_url).await?);
    let strategy = Arc::new(MatcherSet::from_setting(&config.strategy));
    let guider = config
        .caller
        .watchdog
        .guider_file
        .as_ref()
        .map(|path| Arc::new(FileGuiderSource::new(path)) as Arc<dyn GuiderSource>);

    info!(
        mode = config.caller.mode.as_str(),
        pairs = config.pairs.len(),
        balance = %config.exchange.initial_balance,
        database = %config.database_url,
        "Building runner"
    );

    Runner::new(
        config.clone(),
        feeder,
        strategy,
        guider,
        Some(repository),
        Arc::new(LogNotifier),
    )
}

/// Queue status changes that take effect before the first candle.
fn disable_pairs(runner: &Runner, pairs: Vec<String>) {
    let control = runner.control();
    for pair in pairs {
        info!(pair = %pair, "Disabling entries");
        if control.send(CallerEvent::PairStatus { pair, enabled: false }).is_err() {
            warn!("Control channel closed, status change dropped");
        }
    }
}
