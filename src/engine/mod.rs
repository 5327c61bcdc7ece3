//! The aggregation engine: shard ownership, dispatch, bounded shutdown.
//!
//! The engine owns N shard workers. Dispatch routes each validated fragment
//! to `shard = timestamp mod N`, so every fragment for a given timestamp
//! lands in the same shard and completeness reasoning stays shard-local.
//! Records for distinct timestamps may be released in any order and there is
//! no ordering across shards.

pub mod frame;
pub mod shard;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::sink::ets::{EtsSink, EtsSystem};
use crate::sink::file::FileSink;
use crate::sink::Sink;
use crate::stats::{BuildStats, ShardStats};
use self::frame::Fragment;
use self::shard::{ShardConfig, ShardHandle, ShardJoin};

/// Shutdown signalling: five wake-up rounds 50 ms apart, then one shared
/// one-second join budget before stragglers are detached.
const SHUTDOWN_NOTIFY_ROUNDS: usize = 5;
const SHUTDOWN_NOTIFY_INTERVAL: Duration = Duration::from_millis(50);
const SHUTDOWN_JOIN_BUDGET: Duration = Duration::from_secs(1);

/// File-sink output location for one engine.
#[derive(Debug, Clone)]
pub struct FileOutputConfig {
    pub directory: PathBuf,
    pub prefix: String,
}

/// Engine configuration. The ETS session, if any, is passed to
/// [`Engine::start`] separately since it is a live handle rather than data.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of shard workers, 1 to 32.
    pub shards: usize,
    /// Maximum event-time spread within one aggregate, in ticks.
    pub timestamp_slop: u64,
    /// Wall-clock bound on how long an incomplete aggregate may wait.
    pub frame_timeout: Duration,
    /// Fragment count at which an aggregate is complete, 1 to 127.
    pub expected_fragments: usize,
    /// Rolling-file output; `None` disables the file sink.
    pub file_output: Option<FileOutputConfig>,
}

pub struct Engine {
    shards: Vec<ShardHandle>,
    joins: Mutex<Vec<ShardJoin>>,
    stopped: AtomicBool,
    /// Keeps the shared session alive for the shards' attachments.
    _ets: Option<Arc<dyn EtsSystem>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("shards", &self.shards.len())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Engine {
    /// Open sinks, spawn the shard workers, and start aggregating.
    pub fn start(cfg: EngineConfig, ets: Option<Arc<dyn EtsSystem>>) -> Result<Self> {
        if ets.is_none() && cfg.file_output.is_none() {
            bail!("at least one output (ETS or file) must be enabled");
        }
        if !(1..=32).contains(&cfg.shards) {
            bail!("shard count must be between 1 and 32, got {}", cfg.shards);
        }
        if !(1..=127).contains(&cfg.expected_fragments) {
            bail!(
                "expected fragment count must be between 1 and 127, got {}",
                cfg.expected_fragments
            );
        }

        if let Some(file) = &cfg.file_output {
            std::fs::create_dir_all(&file.directory).with_context(|| {
                format!("creating output directory {}", file.directory.display())
            })?;
        }

        let shard_cfg = ShardConfig {
            timestamp_slop: cfg.timestamp_slop,
            frame_timeout: cfg.frame_timeout,
            expected_fragments: cfg.expected_fragments,
        };

        let mut shards = Vec::with_capacity(cfg.shards);
        let mut joins = Vec::with_capacity(cfg.shards);
        for index in 0..cfg.shards {
            let stats = Arc::new(ShardStats::default());
            let mut sinks = Vec::with_capacity(2);

            if let Some(session) = &ets {
                let attachment = session
                    .attach()
                    .with_context(|| format!("attaching shard {index} to the ETS session"))?;
                sinks.push(Sink::Ets(EtsSink::new(attachment)));
            }
            if let Some(file) = &cfg.file_output {
                sinks.push(Sink::File(FileSink::new(
                    file.directory.clone(),
                    file.prefix.clone(),
                    index,
                    Arc::clone(&stats),
                )));
            }

            let (handle, join) = shard::spawn(index, shard_cfg.clone(), sinks, stats)?;
            shards.push(handle);
            joins.push(join);
        }

        info!(
            shards = cfg.shards,
            expected_fragments = cfg.expected_fragments,
            frame_timeout_ms = cfg.frame_timeout.as_millis() as u64,
            timestamp_slop = cfg.timestamp_slop,
            ets = ets.is_some(),
            file = cfg.file_output.is_some(),
            "aggregation engine started",
        );

        Ok(Self {
            shards,
            joins: Mutex::new(joins),
            stopped: AtomicBool::new(false),
            _ets: ets,
        })
    }

    /// Route a validated fragment to its shard by timestamp.
    pub fn dispatch(&self, fragment: Fragment) {
        let index = (fragment.meta.timestamp % self.shards.len() as u64) as usize;
        self.shards[index].insert(fragment);
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Current totals across all shards.
    pub fn stats(&self) -> BuildStats {
        let mut total = BuildStats::default();
        for shard in &self.shards {
            total.accumulate(shard.stats().snapshot());
        }
        total
    }

    /// Stop all shards within a bounded interval and return final totals.
    ///
    /// Workers that do not finish inside the join budget are detached: a
    /// sink stuck in a blocking call must not hang shutdown, and the OS
    /// reclaims their file and attachment handles at process exit. Once this
    /// returns, no joined shard will touch a sink again.
    pub fn stop(&self) -> BuildStats {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return self.stats();
        }

        for shard in &self.shards {
            shard.signal_shutdown();
        }
        // Wake aggressively: a worker mid-wait or mid-release can miss a
        // single notification.
        for _ in 0..SHUTDOWN_NOTIFY_ROUNDS {
            for shard in &self.shards {
                shard.notify();
            }
            std::thread::sleep(SHUTDOWN_NOTIFY_INTERVAL);
        }

        let deadline = Instant::now() + SHUTDOWN_JOIN_BUDGET;
        let mut joins = self.joins.lock().unwrap_or_else(PoisonError::into_inner);
        for join in joins.iter_mut() {
            let budget = deadline.saturating_duration_since(Instant::now());
            if !join.wait(budget) {
                warn!(
                    shard = join.index(),
                    "shard did not stop within the join budget, detaching",
                );
            }
        }
        drop(joins);

        let totals = self.stats();
        info!(
            frames_built = totals.frames_built,
            fragments = totals.fragments_processed,
            build_errors = totals.build_errors,
            timestamp_errors = totals.timestamp_errors,
            "aggregation engine stopped",
        );
        totals
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.stopped.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}
