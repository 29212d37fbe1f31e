//! bt - command line entry point
//!
//! Fetches market data, persists it as JSON, runs moving-average crossover
//! backtests over the newest saved file and renders reports.

use std::error::Error as StdError;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use bt_cli::datafeed::get_datafeed;
use bt_cli::stats::summarize;
use bt_cli::strategy::bars_from_records;
use bt_cli::{
    init_logger, latest_file, load_data, records_from_value, records_to_value, save_data,
    to_records, BacktestConfig, BacktestEngine, BacktestReportGenerator, Error, MaCross,
    MaCrossConfig, RangeRequest, Result, Settings,
};

#[derive(Debug, Subcommand)]
enum IndicatorCommand {
    /// Backtest EMA cross
    #[command(name = "ema_cross")]
    EmaCross {
        /// Fast EMA period
        #[arg(short = 'f', long = "fast-period", alias = "fast_period", default_value_t = 20)]
        fast_period: usize,

        /// Slow EMA period
        #[arg(short = 's', long = "slow-period", alias = "slow_period", default_value_t = 50)]
        slow_period: usize,

        #[arg(long = "trade-size", default_value_t = 1.0)]
        trade_size: f64,

        /// Also render a report next to the result
        #[arg(long, default_value_t = false)]
        report: bool,
    },

    /// Backtest simple moving average cross
    #[command(name = "ma_cross")]
    MaCross {
        /// Fast SMA period
        #[arg(short = 'f', long = "fast-period", alias = "fast_period", default_value_t = 10)]
        fast_period: usize,

        /// Slow SMA period
        #[arg(short = 's', long = "slow-period", alias = "slow_period", default_value_t = 20)]
        slow_period: usize,

        #[arg(long = "trade-size", default_value_t = 1.0)]
        trade_size: f64,

        #[arg(long, default_value_t = false)]
        report: bool,
    },
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load Databento data and save it in json format
    Save {
        /// First day, YYYY-MM-DD
        #[arg(long)]
        start: NaiveDate,

        /// End day (exclusive), YYYY-MM-DD
        #[arg(long)]
        end: NaiveDate,

        /// Maximum number of records (default: 1)
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Show stats of the latest saved price data
    Stats,

    /// Backtest indicator strategies on the latest saved price data
    Indicator {
        #[command(subcommand)]
        cmd: IndicatorCommand,
    },

    /// Render a report from a saved backtest result
    Report {
        /// Result file (default: newest in the results folder)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Report file, PDF unless it ends in .md (default: reports folder, same stem as the input)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Parser)]
#[command(name = "bt", version, about = "Market data and backtest utilities")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| Error::IoWrite {
        path: dir.to_path_buf(),
        source,
    })
}

/// Sortable file name for a new output file
fn timestamped_name(extension: &str) -> String {
    format!("{}.{}", Utc::now().format("%Y%m%d_%H%M%S"), extension)
}

fn latest_json(dir: &Path, what: &str) -> Result<PathBuf> {
    latest_file(dir, "json")?
        .ok_or_else(|| Error::InvalidInput(format!("no {} found in {}", what, dir.display())))
}

async fn cmd_save(settings: &Settings, start: NaiveDate, end: NaiveDate, limit: Option<u64>) -> Result<()> {
    println!("Loading data from Databento");

    let mut req = RangeRequest::new(start, end).with_settings(settings);
    if limit.is_some() {
        req = req.with_limit(limit);
    }

    let datafeed = get_datafeed(settings)?;
    let frame = datafeed.query_range(&req).await?;
    let records = to_records(&frame)?;
    let count = records.len();

    let dir = settings.price_data_dir();
    ensure_dir(&dir)?;
    let path = dir.join(timestamped_name("json"));
    save_data(&records_to_value(records), &path)?;

    info!(records = count, path = %path.display(), "Saved price data");
    println!("Saved {} records to {}", count, path.display());
    Ok(())
}

fn cmd_stats(settings: &Settings) -> Result<()> {
    let path = latest_json(&settings.price_data_dir(), "price data")?;
    let records = records_from_value(load_data(&path)?)?;
    let stats = summarize(&records)?;

    println!("File: {}", path.display());
    println!("Stats");
    println!("{}", stats);
    Ok(())
}

fn cmd_backtest(settings: &Settings, config: MaCrossConfig, report: bool) -> Result<()> {
    let price_path = latest_json(&settings.price_data_dir(), "price data")?;
    info!(path = %price_path.display(), strategy = config.name(), "Loading bars");

    let records = records_from_value(load_data(&price_path)?)?;
    let bars = bars_from_records(&records)?;

    let mut strategy = MaCross::new(config)?;
    let engine = BacktestEngine::new(BacktestConfig::default());
    let result = engine.run(&bars, &mut strategy)?;
    let document = result.to_document();

    let results_dir = settings.results_dir();
    ensure_dir(&results_dir)?;
    let result_path = results_dir.join(timestamped_name("json"));
    save_data(&document, &result_path)?;
    println!("Saved result to {}", result_path.display());

    if report {
        let report_path = default_report_path(settings, &result_path);
        write_report(&document, &report_path)?;
    }
    Ok(())
}

fn default_report_path(settings: &Settings, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report".to_string());
    settings.reports_dir().join(format!("{}.pdf", stem))
}

fn write_report(document: &bt_cli::Value, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    BacktestReportGenerator::new().generate(document, path)?;
    println!("Saved report to {}", path.display());
    Ok(())
}

fn cmd_report(settings: &Settings, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let input = match input {
        Some(path) => path,
        None => latest_json(&settings.results_dir(), "backtest result")?,
    };
    let output = output.unwrap_or_else(|| default_report_path(settings, &input));

    let document = load_data(&input)?;
    write_report(&document, &output)
}

async fn run(cli: Cli, settings: &Settings) -> Result<()> {
    match cli.cmd {
        Command::Save { start, end, limit } => cmd_save(settings, start, end, limit).await,
        Command::Stats => cmd_stats(settings),
        Command::Indicator { cmd } => {
            let (config, report) = match cmd {
                IndicatorCommand::EmaCross {
                    fast_period,
                    slow_period,
                    trade_size,
                    report,
                } => (
                    MaCrossConfig::ema(fast_period, slow_period).with_trade_size(trade_size),
                    report,
                ),
                IndicatorCommand::MaCross {
                    fast_period,
                    slow_period,
                    trade_size,
                    report,
                } => (
                    MaCrossConfig::sma(fast_period, slow_period).with_trade_size(trade_size),
                    report,
                ),
            };
            cmd_backtest(settings, config, report)
        }
        Command::Report { input, output } => cmd_report(settings, input, output),
    }
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn StdError>> {
    let cli = Cli::parse();

    let settings = Settings::load()?;
    init_logger(&settings)?;

    info!("bt {}", bt_cli::VERSION);
    info!("Rust version: {}", rustc_version_runtime::version());
    info!(environment = %settings.environment(), "Settings loaded");

    if let Err(e) = run(cli, &settings).await {
        error!("{}", e);
        return Err(e.into());
    }
    Ok(())
}
