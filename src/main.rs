use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use frameagg::config::Config;
use frameagg::engine::{Engine, EngineConfig, FileOutputConfig};
use frameagg::health::HealthMetrics;
use frameagg::receive::{self, UdpSource};
use frameagg::sink::ets::{EtsSystem, SlotPool};
use frameagg::stats::{self, DriverStats};

/// Streaming time-frame aggregation receiver.
#[derive(Parser)]
#[command(name = "frameagg", about)]
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

/// Build-time version info, injected via RUSTFLAGS or build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("frameagg {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    // Config is required for the main receiver run.
    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting frameagg",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

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

        let _ = shutdown_tx.send(());
    });

    // Health metrics come up first so probes respond during start-up.
    let health = Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health
        .start()
        .await
        .context("starting health metrics server")?;

    // Open the event-transfer session if that sink is enabled.
    let ets: Option<Arc<dyn EtsSystem>> = if cfg.sinks.ets.enabled {
        tracing::info!(
            session = %cfg.sinks.ets.session,
            host = %cfg.sinks.ets.host,
            port = cfg.sinks.ets.port,
            slots = cfg.sinks.ets.slots,
            slot_capacity = cfg.sinks.ets.slot_capacity,
            "opening event-transfer session",
        );
        let pool = SlotPool::new(cfg.sinks.ets.slots, cfg.sinks.ets.slot_capacity);
        Some(Arc::new(pool) as Arc<dyn EtsSystem>)
    } else {
        None
    };

    let engine_cfg = EngineConfig {
        shards: cfg.shards,
        timestamp_slop: cfg.timestamp_slop,
        frame_timeout: cfg.frame_timeout,
        expected_fragments: cfg.expected_fragments,
        file_output: cfg.sinks.file.enabled.then(|| FileOutputConfig {
            directory: cfg.sinks.file.directory.clone(),
            prefix: cfg.sinks.file.prefix.clone(),
        }),
    };
    let engine = Arc::new(Engine::start(engine_cfg, ets).context("starting aggregation engine")?);
    health.shards.set(engine.shard_count() as i64);

    // Spawn the receive driver on a plain thread; the source blocks.
    let source =
        UdpSource::bind(&cfg.listen, cfg.recv_buffer_bytes).context("binding receive socket")?;
    tracing::info!(listen = %cfg.listen, "receiver listening");

    let driver_stats = Arc::new(DriverStats::default());
    let running = Arc::new(AtomicBool::new(true));
    let driver = {
        let engine = Arc::clone(&engine);
        let driver_stats = Arc::clone(&driver_stats);
        let running = Arc::clone(&running);
        let health = Arc::clone(&health);
        std::thread::Builder::new()
            .name("receive".to_string())
            .spawn(move || receive::run(source, engine, driver_stats, running, Some(health)))
            .context("spawning receive driver")?
    };

    // Periodic statistics reporter.
    let started = Instant::now();
    let reporter_cancel = CancellationToken::new();
    {
        let cancel = reporter_cancel.clone();
        let engine = Arc::clone(&engine);
        let driver_stats = Arc::clone(&driver_stats);
        let health = Arc::clone(&health);
        let interval = cfg.report_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Consume the immediate first tick.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let build = engine.stats();
                        stats::report_progress(started.elapsed(), &driver_stats.snapshot(), &build);
                        health.set_build_stats(&build);
                    }
                }
            }
        });
    }

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Stop the source first so no new fragments reach the engine, then the
    // engine within its bounded budget.
    running.store(false, Ordering::SeqCst);
    if driver.join().is_err() {
        tracing::error!("receive driver panicked");
    }

    let totals = engine.stop();
    reporter_cancel.cancel();

    health.set_build_stats(&totals);
    stats::report_final(started.elapsed(), &driver_stats.snapshot(), &totals);

    health.stop().await?;

    tracing::info!("frameagg stopped");

    Ok(())
}
