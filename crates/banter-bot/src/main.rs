//! banter — a group-chat agent that listens, learns, and occasionally
//! joins in.
//!
//! Wiring order: config → store → provider → pipeline → worker pool →
//! background sweeps → Telegram dispatcher. Shutdown is cooperative:
//! stop intake, flush open windows, drain workers for a grace period,
//! then cancel whatever is still in flight.

use std::sync::Arc;
use std::time::Duration;

use banter_core::types::Priority;
use banter_core::BanterConfig;
use banter_pipeline::{ChatOutbound, Pipeline};
use banter_queue::{Event, WorkerPool};
use banter_store::FactStore;
use banter_telegram::{TelegramAdapter, TelegramOutbound};
use clap::Parser;
use teloxide::Bot;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use banter_agent::openai::OpenAiProvider;
use banter_agent::Provider;

/// How long workers get to drain after shutdown begins.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Window inactivity sweep cadence.
const WINDOW_SWEEP: Duration = Duration::from_secs(10);
/// Reaction-timeout sweep cadence.
const REACTION_SWEEP: Duration = Duration::from_secs(60);
/// Retention pruning cadence.
const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

#[derive(Parser)]
#[command(name = "banter", about = "Group-chat agent with layered memory")]
struct Cli {
    /// Path to banter.toml (default: ~/.banter/banter.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "banter=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = BanterConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({e}), using defaults");
        BanterConfig::default()
    });

    let store = Arc::new(FactStore::open(
        &config.database.path,
        config.database.timeout_seconds,
    )?);
    info!(path = %config.database.path, "store opened");

    let bot = Bot::new(&config.telegram.bot_token);
    let provider: Arc<dyn Provider> = Arc::new(OpenAiProvider::new(&config.provider));
    let outbound: Arc<dyn ChatOutbound> = Arc::new(TelegramOutbound::new(bot.clone()));

    let pipeline = Arc::new(Pipeline::new(
        config.clone(),
        Arc::clone(&store),
        provider,
        outbound,
    ));
    let queue = pipeline.queue();
    let cancel = CancellationToken::new();

    // Worker pool drains the queue when asynchronous processing is on;
    // otherwise windows are processed inline by the orchestrator.
    let pool = if config.queue.enable_async {
        let mut pool = WorkerPool::new(
            Arc::clone(&queue),
            Arc::clone(&pipeline) as Arc<dyn banter_queue::EventHandler>,
            config.queue.stale_seconds,
            cancel.clone(),
        );
        pool.start(config.queue.workers);
        info!(workers = config.queue.workers, "worker pool started");
        Some(pool)
    } else {
        None
    };

    spawn_sweeps(&config, Arc::clone(&pipeline), cancel.clone());

    // Drive Telegram until Ctrl-C.
    let adapter = TelegramAdapter::new(bot, Arc::clone(&pipeline), config.telegram.clone());
    tokio::select! {
        _ = adapter.run() => warn!("telegram dispatcher exited"),
        _ = tokio::signal::ctrl_c() => info!("shutdown signal received"),
    }

    // Cooperative shutdown: flush open windows, stop intake, drain, cancel.
    pipeline.flush_windows().await;
    queue.close();
    if let Some(pool) = pool {
        if tokio::time::timeout(SHUTDOWN_GRACE, pool.join())
            .await
            .is_err()
        {
            warn!("grace period elapsed, cancelling in-flight work");
            cancel.cancel();
        }
    }
    cancel.cancel();
    info!("banter stopped");
    Ok(())
}

/// Periodic background work: window timeouts, episode finalization,
/// reaction expiry, retention pruning.
fn spawn_sweeps(config: &BanterConfig, pipeline: Arc<Pipeline>, cancel: CancellationToken) {
    {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(WINDOW_SWEEP);
            loop {
                tokio::select! {
                    _ = tick.tick() => pipeline.sweep_windows().await,
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    {
        let enable_async = config.queue.enable_async;
        let every = Duration::from_secs(config.episodes.sweep_seconds.max(1));
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if enable_async {
                            let _ = pipeline.queue().push(Event::EpisodeTick, Priority::P3);
                        } else {
                            pipeline.sweep_episodes().await;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    {
        let pipeline = Arc::clone(&pipeline);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REACTION_SWEEP);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match pipeline.sweep_reactions() {
                            Ok(n) if n > 0 => info!(expired = n, "unreacted proactive replies marked ignored"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "reaction sweep failed"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETENTION_SWEEP);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match pipeline.sweep_retention() {
                            Ok(n) if n > 0 => info!(pruned = n, "expired messages pruned"),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "retention sweep failed"),
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
    }
}
