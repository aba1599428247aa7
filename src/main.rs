mod api;
mod config;
mod db;
mod error;
mod export;
mod extractor;
mod fetcher;
mod harvest;
mod locator;
mod types;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::health::HealthState;
use crate::api::latency::LatencyStats;
use crate::api::routes::{self, ApiState};
use crate::config::Config;
use crate::db::StorageGateway;
use crate::error::Result;
use crate::export::ExportFormat;
use crate::extractor::{parse_timestamp_str, Extractor};
use crate::fetcher::{HttpPageFetcher, PageSource};
use crate::harvest::{shutdown, Coordinator, RunOptions};
use crate::locator::DateLocator;
use crate::types::{format_date_column, HarvestDirection, ResumeMode, SearchDirection};

#[derive(Parser)]
#[command(name = "harvester", about = "Resumable marketplace sales harvester")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk source pages and store every sale exactly once.
    Harvest(HarvestArgs),
    /// Find the page holding a given date.
    Locate {
        /// Target date (RFC 3339, `YYYY-MM-DD HH:MM:SS` or `YYYY-MM-DD`).
        #[arg(value_parser = parse_date)]
        date: DateTime<Utc>,

        #[arg(long, value_enum, default_value_t = SearchDirection::Backward)]
        direction: SearchDirection,

        /// First page probed by a backward search. Defaults to SEARCH_START_PAGE.
        #[arg(long)]
        start_page: Option<u32>,

        /// Probe ceiling. Defaults to SEARCH_MAX_PROBES.
        #[arg(long)]
        max_probes: Option<u32>,
    },
    /// Print store statistics, optionally with one item's price history.
    Stats {
        #[arg(long)]
        name: Option<String>,
    },
    /// Write every stored sale to a backup file.
    Export {
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        format: ExportFormat,

        /// Output file. Defaults to `sales.json` or `sales.csv`.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
struct HarvestArgs {
    #[arg(long, value_enum, default_value_t = HarvestDirection::NewestFirst)]
    direction: HarvestDirection,

    #[arg(long, value_enum, default_value_t = ResumeMode::Markers)]
    resume: ResumeMode,

    #[arg(long)]
    start_page: Option<u32>,

    /// Last page, inclusive. Defaults to the source's reported size, then MAX_PAGES.
    #[arg(long, conflicts_with = "pages")]
    end_page: Option<u32>,

    /// Number of pages from the start page.
    #[arg(long)]
    pages: Option<u32>,

    /// Explicit comma-separated pages, harvested in the given order.
    #[arg(long, value_delimiter = ',')]
    page_list: Vec<u32>,

    /// Parallel workers. Defaults to WORKERS.
    #[arg(long)]
    workers: Option<usize>,

    /// Resume from this date instead of the stored range. Implies `--resume date`.
    #[arg(long, value_parser = parse_date)]
    since: Option<DateTime<Utc>>,

    /// Serve /health, /progress, /stats and /latency on this port. Defaults to STATUS_PORT.
    #[arg(long)]
    status_port: Option<u16>,

    /// Delete all completion markers before planning.
    #[arg(long, default_value_t = false)]
    reset_markers: bool,
}

fn parse_date(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    parse_timestamp_str(raw).ok_or_else(|| format!("unrecognized date: {raw}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    let outcome = match cli.command {
        Commands::Harvest(args) => harvest(cfg, args).await,
        Commands::Locate { date, direction, start_page, max_probes } => {
            locate(cfg, date, direction, start_page, max_probes).await
        }
        Commands::Stats { name } => stats(cfg, name).await,
        Commands::Export { format, out } => export(cfg, format, out).await,
    };

    if let Err(e) = outcome {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn harvest(cfg: Config, args: HarvestArgs) -> Result<()> {
    let start_page = args.start_page;
    let end_page = args
        .end_page
        .or_else(|| args.pages.map(|n| start_page.unwrap_or(1) + n.saturating_sub(1)));
    let opts = RunOptions {
        direction: args.direction,
        resume: if args.since.is_some() { ResumeMode::Date } else { args.resume },
        start_page,
        end_page,
        page_list: (!args.page_list.is_empty()).then_some(args.page_list),
        workers: args.workers.unwrap_or(cfg.workers).max(1),
        since: args.since,
        reset_markers: args.reset_markers,
    };
    info!(
        direction = %opts.direction,
        resume = %opts.resume,
        workers = opts.workers,
        api_url = %cfg.api_url,
        "Starting harvest"
    );

    // --- Storage: schema first, then the pool ---
    let gateway = StorageGateway::open(&cfg).await?;

    let source: Arc<dyn PageSource> = Arc::new(HttpPageFetcher::new(&cfg)?);
    let cancel = CancellationToken::new();
    shutdown::cancel_on_signal(cancel.clone());

    let health = Arc::new(HealthState::new());
    let latency = Arc::new(LatencyStats::new()?);
    let coordinator = Coordinator::new(
        cfg.clone(),
        source,
        gateway.clone(),
        cancel,
        Arc::clone(&health),
        Arc::clone(&latency),
    );

    // --- Optional status server ---
    let server_stop = CancellationToken::new();
    if let Some(port) = args.status_port.or(cfg.status_port) {
        let state = ApiState {
            gateway: gateway.clone(),
            health,
            latency,
            progress: coordinator.subscribe(),
        };
        let stop = server_stop.clone();
        tokio::spawn(async move {
            if let Err(e) = routes::serve(state, port, stop).await {
                warn!("Status server stopped: {e}");
            }
        });
    }

    let result = coordinator.run(opts).await;
    server_stop.cancel();
    gateway.close().await;

    let summary = result?;
    let snap = &summary.snapshot;
    info!(
        cancelled = summary.cancelled,
        pages_completed = snap.pages_completed,
        pages_failed = snap.pages_failed,
        inserted = snap.records.inserted,
        duplicates = snap.records.skipped_duplicate,
        rejected = snap.records.rejected_invalid,
        "Harvest finished"
    );
    Ok(())
}

async fn locate(
    cfg: Config,
    date: DateTime<Utc>,
    direction: SearchDirection,
    start_page: Option<u32>,
    max_probes: Option<u32>,
) -> Result<()> {
    let source: Arc<dyn PageSource> = Arc::new(HttpPageFetcher::new(&cfg)?);
    let extractor = Extractor::for_source(&cfg, source.as_ref());
    let locator = DateLocator::new(
        source,
        extractor,
        start_page.unwrap_or(cfg.search_start_page),
        max_probes.unwrap_or(cfg.search_max_probes),
    );

    let found = locator.locate(date, direction).await?;
    println!(
        "{}",
        serde_json::json!({
            "date": format_date_column(date),
            "direction": direction.to_string(),
            "page": found.page,
            "probes": found.probes,
        })
    );
    Ok(())
}

async fn stats(cfg: Config, name: Option<String>) -> Result<()> {
    let gateway = StorageGateway::open(&cfg).await?;

    let stats = gateway.stats().await?;
    println!("{}", serde_json::to_string_pretty(&stats)?);

    if let Some(name) = name {
        let history = gateway.price_history(&name).await?;
        println!("{}", serde_json::to_string_pretty(&history)?);
    }

    gateway.close().await;
    Ok(())
}

async fn export(cfg: Config, format: ExportFormat, out: Option<PathBuf>) -> Result<()> {
    let path = out.unwrap_or_else(|| match format {
        ExportFormat::Json => PathBuf::from("sales.json"),
        ExportFormat::Csv => PathBuf::from("sales.csv"),
    });
    let gateway = StorageGateway::open(&cfg).await?;
    let sales = gateway.all_sales().await;
    gateway.close().await;

    export::write_export(&path, &sales?, format).await
}
