//! Options backtest CLI
//!
//! # Usage
//!
//! ```bash
//! # Run a single backtest
//! options-backtest run --config config/default.toml --data data/nifty.parquet --json out.json
//!
//! # Grid search ranked by Sharpe
//! options-backtest sweep --config config/default.toml --data data/nifty.parquet --top 10
//!
//! # Rolling train/test evaluation
//! options-backtest walk-forward --config config/default.toml --data data/nifty.parquet
//!
//! # Fair value, Greeks and implied vol for one contract
//! options-backtest price --spot 21500 --strike 21600 --days 14 --vol 0.15 --right call --market 180
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use options_backtest::config::RunConfig;
use options_backtest::data::{MarketSnapshot, OptionRight, ParquetSnapshotSource, SourceError};
use options_backtest::metrics::Report;
use options_backtest::pricing::{years_to_expiry, BlackScholes};
use options_backtest::sweep::{run_sweep, run_walk_forward, Objective, ParameterGrid};

#[derive(Parser)]
#[command(name = "options-backtest")]
#[command(about = "Backtesting engine for multi-leg index options strategies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct DataArgs {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Long-format parquet file, one row per quote
    #[arg(short, long)]
    data: PathBuf,

    /// Only use rows for this underlying
    #[arg(short, long)]
    underlying: Option<String>,

    /// First date to include (YYYY-MM-DD)
    #[arg(long)]
    start: Option<String>,

    /// Last date to include (YYYY-MM-DD)
    #[arg(long)]
    end: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest with given configuration
    Run {
        #[command(flatten)]
        data: DataArgs,

        /// Also write the report as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Run every parameter combination in parallel and rank them
    Sweep {
        #[command(flatten)]
        data: DataArgs,

        /// TOML file with a parameter grid (defaults otherwise)
        #[arg(short, long)]
        grid: Option<PathBuf>,

        /// sharpe, sortino, calmar, total_return or profit_factor
        #[arg(long, default_value = "sharpe")]
        objective: String,

        /// Number of results to print
        #[arg(long, default_value_t = 10)]
        top: usize,

        /// Write all results as JSON
        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Optimize on rolling train windows, evaluate on the following test windows
    WalkForward {
        #[command(flatten)]
        data: DataArgs,

        #[arg(short, long)]
        grid: Option<PathBuf>,

        #[arg(long, default_value = "sharpe")]
        objective: String,

        #[arg(long)]
        json: Option<PathBuf>,
    },

    /// Price one contract and solve its implied volatility
    Price {
        #[arg(long)]
        spot: f64,
        #[arg(long)]
        strike: f64,
        /// Calendar days to expiry
        #[arg(long)]
        days: i64,
        /// Volatility for the fair value (annualized, e.g. 0.15)
        #[arg(long)]
        vol: f64,
        /// call or put
        #[arg(long, default_value = "call")]
        right: String,
        #[arg(long, default_value_t = 0.07)]
        rate: f64,
        /// Observed premium to solve implied volatility from
        #[arg(long)]
        market: Option<f64>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn parse_date(raw: &Option<String>, what: &str) -> Result<Option<NaiveDate>> {
    raw.as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("Invalid {} date: {}", what, s)))
        .transpose()
}

fn load_config(path: &Path) -> Result<RunConfig> {
    RunConfig::from_toml(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn source(args: &DataArgs) -> Result<ParquetSnapshotSource> {
    let mut source = ParquetSnapshotSource::new(&args.data)
        .with_date_range(parse_date(&args.start, "start")?, parse_date(&args.end, "end")?);
    if let Some(underlying) = &args.underlying {
        source = source.with_underlying(underlying.clone());
    }
    Ok(source)
}

/// Materialize snapshots for repeated runs. Gaps are skipped, malformed input
/// aborts.
fn load_snapshots(args: &DataArgs) -> Result<Vec<MarketSnapshot>> {
    let items = source(args)?
        .load()
        .with_context(|| format!("Failed to load {}", args.data.display()))?;
    let mut snapshots = Vec::with_capacity(items.len());
    for item in items {
        match item {
            Ok(snapshot) => snapshots.push(snapshot),
            Err(SourceError::DataUnavailable { timestamp, reason }) => {
                warn!(?timestamp, %reason, "skipping unavailable snapshot");
            }
            Err(e @ SourceError::Malformed(_)) => return Err(e).context("Malformed input data"),
        }
    }
    Ok(snapshots)
}

fn load_grid(path: &Option<PathBuf>) -> Result<ParameterGrid> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            toml::from_str(&text).with_context(|| format!("Invalid grid file {}", path.display()))
        }
        None => Ok(ParameterGrid::default()),
    }
}

fn parse_objective(raw: &str) -> Result<Objective> {
    match Objective::from_str(raw) {
        Some(objective) => Ok(objective),
        None => bail!("Unknown objective: {}", raw),
    }
}

fn write_json(path: &Path, json: String) -> Result<()> {
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote {}", path.display());
    Ok(())
}

fn cmd_run(args: DataArgs, json: Option<PathBuf>) -> Result<()> {
    let config = load_config(&args.config)?;
    let snapshots = source(&args)?
        .snapshots()
        .with_context(|| format!("Failed to load {}", args.data.display()))?;

    let mut engine = config.engine();
    let report = match engine.run(snapshots) {
        Ok(result) => Report::from_result(&result, &config.calculator()),
        Err(failed) => {
            let report = Report::from_failure(&failed, config.backtest.initial_capital);
            println!("{}", report);
            if let Some(path) = &json {
                write_json(path, report.to_json()?)?;
            }
            return Err(failed).context("Backtest failed");
        }
    };

    println!("{}", report);
    if let Some(path) = &json {
        write_json(path, report.to_json()?)?;
    }
    Ok(())
}

fn cmd_sweep(args: DataArgs, grid: Option<PathBuf>, objective: &str, top: usize, json: Option<PathBuf>) -> Result<()> {
    let config = load_config(&args.config)?;
    let grid = load_grid(&grid)?;
    let objective = parse_objective(objective)?;
    let snapshots = load_snapshots(&args)?;

    let results = run_sweep(&config, &grid, &snapshots, &[], objective);

    println!("{:<4} {:<32} {:>10} {:>8} {:>10} {:>14}", "#", "params", "score", "trades", "max dd", "final equity");
    for (rank, r) in results.iter().take(top).enumerate() {
        match &r.metrics {
            Some(m) => println!(
                "{:<4} {:<32} {:>10.3} {:>8} {:>9.2}% {:>14.2}",
                rank + 1,
                r.params.key(),
                r.score,
                m.total_trades,
                m.max_drawdown * 100.0,
                r.final_equity
            ),
            None => println!(
                "{:<4} {:<32} failed: {}",
                rank + 1,
                r.params.key(),
                r.error.as_deref().unwrap_or("unknown")
            ),
        }
    }

    if let Some(path) = &json {
        write_json(path, serde_json::to_string_pretty(&results)?)?;
    }
    Ok(())
}

fn cmd_walk_forward(args: DataArgs, grid: Option<PathBuf>, objective: &str, json: Option<PathBuf>) -> Result<()> {
    let config = load_config(&args.config)?;
    let grid = load_grid(&grid)?;
    let objective = parse_objective(objective)?;
    let snapshots = load_snapshots(&args)?;

    let result = run_walk_forward(&config, &grid, &snapshots, objective);
    if result.windows.is_empty() {
        bail!(
            "Not enough data for walk-forward: {} ticks, need {}",
            snapshots.len(),
            config.walk_forward.train_ticks + config.walk_forward.test_ticks
        );
    }
    println!("{}", result.summary());

    if let Some(path) = &json {
        write_json(path, serde_json::to_string_pretty(&result)?)?;
    }
    Ok(())
}

fn cmd_price(
    spot: f64,
    strike: f64,
    days: i64,
    vol: f64,
    right: &str,
    rate: f64,
    market: Option<f64>,
) -> Result<()> {
    let Some(right) = OptionRight::from_str(right) else {
        bail!("Unknown option right: {}", right);
    };
    if spot <= 0.0 || strike <= 0.0 {
        bail!("Spot and strike must be positive");
    }
    let model = BlackScholes::with_rate(rate);
    let time = years_to_expiry(days);
    let greeks = model.greeks(spot, strike, time, vol, right);

    println!("Contract:     {} {} {} DTE", strike, right.as_str(), days);
    println!("Fair value:   {:.2}", model.price(spot, strike, time, vol, right));
    println!("Delta:        {:.4}", greeks.delta);
    println!("Gamma:        {:.6}", greeks.gamma);
    println!("Theta:        {:.4}", greeks.theta);
    println!("Vega:         {:.4}", greeks.vega);
    println!("Rho:          {:.4}", greeks.rho);

    if let Some(observed) = market {
        let solution = model.implied_volatility(observed, spot, strike, time, right);
        match solution.value() {
            Some(iv) => println!("Implied vol:  {:.4} ({} iterations)", iv, solution.iterations),
            None => println!(
                "Implied vol:  did not converge (last estimate {:.4})",
                solution.estimate
            ),
        }
    }
    Ok(())
}

fn cmd_check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let strategies = config.strategies.build();
    println!("Config OK: {}", path.display());
    println!("  Initial capital: {}", config.backtest.initial_capital);
    println!("  Mark policy:     {}", config.backtest.mark_policy.as_str());
    println!("  Sizing policy:   {}", config.sizing.policy.as_str());
    println!(
        "  Strategies:      {}",
        strategies.iter().map(|s| s.name()).collect::<Vec<_>>().join(", ")
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("options_backtest=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { data, json } => cmd_run(data, json),
        Commands::Sweep {
            data,
            grid,
            objective,
            top,
            json,
        } => cmd_sweep(data, grid, &objective, top, json),
        Commands::WalkForward {
            data,
            grid,
            objective,
            json,
        } => cmd_walk_forward(data, grid, &objective, json),
        Commands::Price {
            spot,
            strike,
            days,
            vol,
            right,
            rate,
            market,
        } => cmd_price(spot, strike, days, vol, &right, rate, market),
        Commands::CheckConfig { config } => cmd_check_config(&config),
    }
}
