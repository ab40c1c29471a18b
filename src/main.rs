mod app;
mod config;
mod data;
mod error;
mod export;
mod portfolio;
mod report;
mod sampler;
mod simulation;
mod tui;
mod ui;

use anyhow::{Context, Result, bail};
use app::App;
use chrono::{NaiveDate, Utc};
use clap::Parser;
use config::SimulationConfig;
use data::{DataSourceKind, Interval, StockData};
use export::ExportFormat;
use portfolio::{ReturnDataset, Weights};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Length of the synthetic history generated with `--mock`.
const MOCK_HISTORY_DAYS: usize = 250;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Portfolio MC: Monte Carlo simulation of a portfolio's future value from historical returns",
    after_help = "EXAMPLES:
    # Simulate an equal-risk tech basket with random weights
    cargo run --release -- --tickers AAPL,MSFT,NVDA

    # Fixed weights, reproducible run, 1000 paths over 250 days
    cargo run --release -- --tickers SPY,TLT --weights 0.6,0.4 --sims 1000 --days 250 --seed 42

    # Offline run on synthetic data with the dashboard
    cargo run --release -- --tickers AAA,BBB,CCC --mock --tui

    # Export prices, paths and report as JSON
    cargo run --release -- --tickers SPY,QQQ --export-dir out --export-format json"
)]
struct Args {
    /// Comma-separated tickers (e.g., AAPL,MSFT,SPY)
    #[arg(long, value_delimiter = ',', required = true)]
    tickers: Vec<String>,

    /// First date of the history (YYYY-MM-DD)
    #[arg(long, default_value = config::DEFAULT_START_DATE)]
    start: NaiveDate,

    /// Last date of the history (YYYY-MM-DD, default: today)
    #[arg(long)]
    end: Option<NaiveDate>,

    /// Market data source (yahoo|stooq|alphavantage)
    #[arg(long, default_value = "yahoo")]
    source: String,

    /// Bar interval (1d|1wk|1mo|3mo)
    #[arg(long, default_value = "1d")]
    interval: String,

    /// Simulation horizon in days
    #[arg(long, default_value_t = config::DEFAULT_HORIZON_DAYS)]
    days: usize,

    /// Number of simulated paths
    #[arg(long, default_value_t = config::DEFAULT_SIMULATIONS)]
    sims: usize,

    /// Initial investment
    #[arg(long, default_value_t = config::DEFAULT_INVESTMENT)]
    investment: f64,

    /// Comma-separated weights in ticker order (random allocation when omitted)
    #[arg(long, value_delimiter = ',')]
    weights: Option<Vec<f64>>,

    /// Seed for a reproducible run
    #[arg(long)]
    seed: Option<u64>,

    /// Directory to export prices, paths and report to
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Export format (csv|json|excel)
    #[arg(long, default_value = "csv")]
    export_format: String,

    /// Show the results in the terminal dashboard
    #[arg(long)]
    tui: bool,

    /// Use synthetic prices instead of fetching market data
    #[arg(long)]
    mock: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portfolio_mc=info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    config::init_cpu_parallelism();
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let tickers: Vec<String> = args
        .tickers
        .iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();
    if tickers.is_empty() {
        bail!("At least one ticker is required. Example: --tickers AAPL,MSFT");
    }

    let sim_config = SimulationConfig::new(args.days, args.sims, args.investment).context("invalid simulation settings")?;
    let weights = args
        .weights
        .map(Weights::new)
        .transpose()
        .context("invalid --weights")?;
    let export_format: ExportFormat = args.export_format.parse()?;

    let data: Vec<StockData> = if args.mock {
        let mut rng = StdRng::seed_from_u64(args.seed.unwrap_or(0));
        info!("Generating {} days of synthetic prices for {:?}", MOCK_HISTORY_DAYS, tickers);
        tickers.iter().map(|t| StockData::new_mock(t, MOCK_HISTORY_DAYS, &mut rng)).collect()
    } else {
        let source: DataSourceKind = args.source.parse()?;
        let interval: Interval = args.interval.parse()?;
        let end = args.end.unwrap_or_else(|| Utc::now().date_naive());
        data::fetch_portfolio(source, &tickers, args.start, end, interval).await?
    };

    let dataset = ReturnDataset::from_prices(&data).context("aligning return series")?;
    if let (Some(first), Some(last)) = (dataset.dates().first(), dataset.dates().last()) {
        info!(
            "Aligned {} assets on {} common return observations ({} to {})",
            dataset.num_assets(),
            dataset.num_observations(),
            first,
            last
        );
    }
    let assets: Vec<_> = data.iter().map(StockData::summary).collect();

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling simulation...");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let outcome = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            simulation::run_simulation(&dataset, sim_config, weights, args.seed, Some(cancel.as_ref()))
        })
        .await
        .context("simulation task panicked")?
        .context("simulation failed")?
    };
    info!("Run finished (seed {})", outcome.seed);

    if let Some(dir) = &args.export_dir {
        export::export_prices(&data, dir, export_format).context("exporting prices")?;
        export::export_paths(&outcome.paths, dir, export_format).context("exporting paths")?;
        export::export_report(&outcome.report, dir).context("exporting report")?;
    }

    if args.tui {
        let mut terminal = tui::init()?;
        let mut app = App::new(outcome, assets);
        let res = app.run(&mut terminal).await;
        tui::restore()?;
        res?;
    } else {
        println!("{}", report::render_text(&outcome.report, &assets));
    }

    Ok(())
}
