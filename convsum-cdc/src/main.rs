//! convsum-cdc - Conversation Summary Pipeline Service
//!
//! Polls the source fragment table, assembles finished conversations and
//! dispatches them to the ML scoring service through the outbound queue;
//! a background reconciler folds successful results from the inbound
//! queue into the local summary store.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use convsum_cdc::queue::{HttpQueue, QueueTransport, ReceiveOptions};
use convsum_cdc::services::{Dispatcher, PipelineService, PipelineStats, Reconciler};
use convsum_common::config::PipelineConfig;
use convsum_common::sentiment::ScoringConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// How long shutdown waits for in-flight work before giving up
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Continuous sliding-window polling
    Normal,
    /// Walk the configured historical date range, then exit
    Backfill,
    /// Reconcile the inbound queue into the summary store without polling
    /// the source table (one drain pass with --once)
    Flush,
}

#[derive(Debug, Parser)]
#[command(name = "convsum-cdc", version, about = "Conversation summary pipeline service")]
struct Args {
    /// Operating mode
    #[arg(long, value_enum, default_value = "normal")]
    mode: Mode,

    /// Config file path (overrides CONVSUM_CONFIG and the platform default)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Database file path (overrides the config file)
    #[arg(long, env = "CONVSUM_DB")]
    db: Option<PathBuf>,

    /// Run a single poll cycle (normal) or drain pass (flush) and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    info!("Starting convsum-cdc (Conversation Summary Pipeline)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = PipelineConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(db) = args.db {
        config.database_path = db;
    }
    config.validate().context("Invalid configuration")?;

    info!("Database: {}", config.database_path.display());
    let pool = convsum_cdc::db::init_database_pool(&config.database_path)
        .await
        .context("Failed to open database")?;

    if !convsum_cdc::db::source_table_exists(&pool).await? {
        // The external writer may not have provisioned yet; cycles will
        // simply come back empty until it does
        warn!(
            "Source table '{}' not found; poll cycles will be empty",
            convsum_cdc::db::SOURCE_TABLE
        );
    }

    let transport: Arc<dyn QueueTransport> = Arc::new(
        HttpQueue::new(Duration::from_secs(config.request_timeout_secs))
            .context("Failed to build queue client")?,
    );

    // Unreachable queues at boot are fatal; once running, transport
    // failures are retried instead
    transport
        .probe(&config.outbound_queue_url)
        .await
        .context("Outbound queue unreachable")?;
    transport
        .probe(&config.inbound_queue_url)
        .await
        .context("Inbound queue unreachable")?;
    transport
        .probe(&config.dead_letter_queue_url)
        .await
        .context("Dead-letter queue unreachable")?;
    info!("Queue broker reachable");

    let stats = Arc::new(PipelineStats::new());
    let (scoring_tx, _scoring_rx) = watch::channel(ScoringConfig::default());

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        transport.clone(),
        config.outbound_queue_url.clone(),
        config.dispatch_max_retries,
        config.dispatch_retry_delay_ms,
    ));
    let reconciler = Arc::new(Reconciler::new(
        pool.clone(),
        transport.clone(),
        config.inbound_queue_url.clone(),
        config.dead_letter_queue_url.clone(),
        ReceiveOptions {
            max_messages: config.receive_max_messages,
            wait_secs: config.receive_wait_secs,
            visibility_timeout_secs: config.visibility_timeout_secs,
        },
        config.max_receive_count,
        scoring_tx,
        stats.clone(),
    ));

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match args.mode {
        Mode::Normal => {
            let pipeline =
                PipelineService::new(pool.clone(), config.clone(), dispatcher, stats.clone());

            let reconciler_cancel = cancel.clone();
            let reconciler_task = {
                let reconciler = reconciler.clone();
                let idle = Duration::from_secs(config.poll_interval_secs);
                tokio::spawn(async move { reconciler.run(reconciler_cancel, idle).await })
            };

            pipeline.run_normal(cancel.clone(), args.once).await;

            cancel.cancel();
            if tokio::time::timeout(SHUTDOWN_GRACE, reconciler_task)
                .await
                .is_err()
            {
                warn!("Reconciler did not stop within the shutdown grace period");
            }
        }
        Mode::Backfill => {
            let pipeline =
                PipelineService::new(pool.clone(), config.clone(), dispatcher, stats.clone());
            pipeline.run_backfill(cancel.clone()).await?;
        }
        Mode::Flush => {
            if args.once {
                let drained = reconciler.drain().await?;
                info!(drained, "Inbound queue flushed");
            } else {
                reconciler
                    .run(
                        cancel.clone(),
                        Duration::from_secs(config.poll_interval_secs),
                    )
                    .await;
            }
        }
    }

    stats.flush();
    pool.close().await;
    info!("convsum-cdc stopped");
    Ok(())
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });
}
