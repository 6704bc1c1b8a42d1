use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use windroll::bucket::{CounterBucket, HistogramBucket};
use windroll::cache::BucketCache;
use windroll::config::Config;
use windroll::process::driver::{RollupDriver, RollupStores};
use windroll::store::clickhouse::{
    connect, ClickHouseBucketStore, ClickHouseMetaStore, ClickHouseSummaryStore,
};
use windroll::store::memory::{MemoryBucketStore, MemoryMetaStore, MemorySummaryStore};
use windroll::store::schema;

/// Time-window roll-up core for a time-series metrics platform.
#[derive(Parser)]
#[command(name = "windroll", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("windroll {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting windroll");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    // Cancel on SIGINT/SIGTERM.
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
        signal_cancel.cancel();
    });

    let stores = if cfg.clickhouse.enabled {
        let pool = connect(&cfg.clickhouse);
        if cfg.clickhouse.migrations.enabled {
            schema::ensure_schema(&pool, &cfg)
                .await
                .context("ensuring ClickHouse schema")?;
        }
        RollupStores {
            histograms: Arc::new(ClickHouseBucketStore::<HistogramBucket>::new(
                pool.clone(),
                &cfg.clickhouse,
            )),
            counters: Arc::new(ClickHouseBucketStore::<CounterBucket>::new(
                pool.clone(),
                &cfg.clickhouse,
            )),
            summaries: Arc::new(ClickHouseSummaryStore::new(pool.clone(), &cfg.clickhouse)),
            meta: Arc::new(ClickHouseMetaStore::new(pool, &cfg.clickhouse)),
        }
    } else {
        tracing::warn!("clickhouse disabled, running on the in-memory backend");
        RollupStores {
            histograms: Arc::new(MemoryBucketStore::<HistogramBucket>::new()),
            counters: Arc::new(MemoryBucketStore::<CounterBucket>::new()),
            summaries: Arc::new(MemorySummaryStore::new()),
            meta: Arc::new(MemoryMetaStore::new()),
        }
    };

    let windows = cfg.window_durations()?;
    let driver = RollupDriver::new(
        &windows,
        stores,
        Arc::new(BucketCache::new(cfg.bucket_cache.clone())),
        Arc::new(BucketCache::new(cfg.bucket_cache.clone())),
        cfg.query.slice_row_limit,
        cfg.windows.tick_interval,
        cfg.windows.tick_safety_interval,
    );

    driver.run(cancel).await;

    tracing::info!("windroll stopped");
    Ok(())
}
