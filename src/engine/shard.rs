//! Shard workers: the per-shard aggregation buffer and its release loop.
//!
//! Each shard owns a condvar-guarded map of pending aggregates and one OS
//! thread. Inserts are O(1) under the shard-local lock; the worker wakes on
//! new insertions (or every half frame-timeout) and releases every aggregate
//! that is complete or has timed out, with the lock dropped across record
//! building and sink I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::frame::{AggregatingFrame, Fragment};
use crate::record;
use crate::sink::Sink;
use crate::stats::ShardStats;

/// Configuration a shard worker receives at construction.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Maximum event-time spread tolerated within one aggregate, in ticks.
    pub timestamp_slop: u64,
    /// Wall-clock bound on how long an incomplete aggregate may wait.
    pub frame_timeout: Duration,
    /// Fragment count at which an aggregate is complete.
    pub expected_fragments: usize,
}

struct ShardShared {
    buffer: Mutex<HashMap<u64, AggregatingFrame>>,
    wakeup: Condvar,
    shutdown: AtomicBool,
}

impl ShardShared {
    fn lock_buffer(&self) -> MutexGuard<'_, HashMap<u64, AggregatingFrame>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Engine-side handle to one shard: insert, wake, and read counters.
/// Cheap to share; the join bookkeeping lives in [`ShardJoin`].
pub struct ShardHandle {
    index: usize,
    shared: Arc<ShardShared>,
    stats: Arc<ShardStats>,
}

/// Join bookkeeping consumed once at shutdown.
pub struct ShardJoin {
    index: usize,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

/// Spawn one shard worker thread owning `sinks`.
pub fn spawn(
    index: usize,
    cfg: ShardConfig,
    sinks: Vec<Sink>,
    stats: Arc<ShardStats>,
) -> Result<(ShardHandle, ShardJoin)> {
    let shared = Arc::new(ShardShared {
        buffer: Mutex::new(HashMap::new()),
        wakeup: Condvar::new(),
        shutdown: AtomicBool::new(false),
    });

    let (done_tx, done_rx) = mpsc::channel();
    let worker = Worker {
        index,
        cfg,
        sinks,
        shared: Arc::clone(&shared),
        stats: Arc::clone(&stats),
    };

    let handle = std::thread::Builder::new()
        .name(format!("shard-{index}"))
        .spawn(move || {
            worker.run(done_tx);
        })
        .with_context(|| format!("spawning shard worker {index}"))?;

    Ok((
        ShardHandle {
            index,
            shared,
            stats,
        },
        ShardJoin {
            index,
            done_rx,
            handle: Some(handle),
        },
    ))
}

impl ShardHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Append a fragment to its aggregate, creating the aggregate on first
    /// arrival. Callable from any number of receiver threads.
    pub fn insert(&self, fragment: Fragment) {
        let mut buffer = self.shared.lock_buffer();
        match buffer.get_mut(&fragment.meta.timestamp) {
            Some(frame) => frame.push(fragment),
            None => {
                buffer.insert(fragment.meta.timestamp, AggregatingFrame::new(fragment));
            }
        }
        self.stats.fragments_processed.fetch_add(1, Ordering::Relaxed);
        self.shared.wakeup.notify_one();
    }

    pub fn signal_shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn notify(&self) {
        self.shared.wakeup.notify_all();
    }

    pub fn stats(&self) -> &ShardStats {
        &self.stats
    }
}

impl ShardJoin {
    /// Wait up to `budget` for the worker to finish. On timeout the thread
    /// handle is dropped (detached) and the OS reclaims it at process exit;
    /// a sink stuck in a blocking call must not hang the shutdown path.
    pub fn wait(&mut self, budget: Duration) -> bool {
        match self.done_rx.recv_timeout(budget) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                true
            }
            Err(RecvTimeoutError::Timeout) => {
                self.handle.take();
                false
            }
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

struct Worker {
    index: usize,
    cfg: ShardConfig,
    sinks: Vec<Sink>,
    shared: Arc<ShardShared>,
    stats: Arc<ShardStats>,
}

impl Worker {
    fn run(mut self, done_tx: Sender<()>) {
        self.release_loop();
        debug!(shard = self.index, "shard worker stopped");
        let _ = done_tx.send(());
    }

    fn release_loop(&mut self) {
        let wait = self.cfg.frame_timeout / 2;

        let mut buffer = self.shared.lock_buffer();
        loop {
            let (guard, _) = self
                .shared
                .wakeup
                .wait_timeout(buffer, wait)
                .unwrap_or_else(PoisonError::into_inner);
            buffer = guard;

            // Pending aggregates are dropped on shutdown, not built.
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return;
            }

            loop {
                let now = Instant::now();
                let ready = buffer.iter().find_map(|(ts, frame)| {
                    let complete = frame.fragment_count() >= self.cfg.expected_fragments
                        || now.duration_since(frame.arrival) > self.cfg.frame_timeout;
                    complete.then_some(*ts)
                });
                let Some(ts) = ready else { break };
                let Some(frame) = buffer.remove(&ts) else { break };

                drop(buffer);
                self.release(frame);
                if self.shared.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                buffer = self.shared.lock_buffer();
            }
        }
    }

    /// Build one released aggregate and publish it to every enabled sink.
    fn release(&mut self, frame: AggregatingFrame) {
        let built = match record::build(&frame, self.cfg.timestamp_slop) {
            Ok(built) => built,
            Err(e) => {
                self.stats.build_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    shard = self.index,
                    timestamp = frame.timestamp,
                    error = %e,
                    "dropping aggregate",
                );
                return;
            }
        };

        if built.excluded > 0 {
            self.stats
                .build_errors
                .fetch_add(built.excluded as u64, Ordering::Relaxed);
            warn!(
                shard = self.index,
                timestamp = frame.timestamp,
                excluded = built.excluded,
                "fragments failed the source-header recheck",
            );
        }
        if built.slop_exceeded {
            self.stats.timestamp_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                shard = self.index,
                timestamp = frame.timestamp,
                slop = self.cfg.timestamp_slop,
                "timestamp spread exceeds slop, error flag set",
            );
        }

        self.stats.frames_built.fetch_add(1, Ordering::Relaxed);

        for sink in &mut self.sinks {
            if self.shared.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match sink.write(&built.bytes) {
                Ok(()) => {
                    self.stats
                        .bytes_written
                        .fetch_add(built.bytes.len() as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    self.stats.build_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        shard = self.index,
                        sink = sink.name(),
                        timestamp = frame.timestamp,
                        error = %e,
                        "record write failed",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ets::{EtsSink, EtsSystem, SlotPool};
    use crate::validator::{FragmentMeta, MAGIC};

    fn fragment(ts: u64, frame_number: u32, source_id: u8) -> Fragment {
        let mut words = [0u32; 16];
        words[7] = MAGIC;
        words[9] = 0x0002_1000 | u32::from(source_id);
        words[13] = frame_number;
        words[14] = ts as u32;
        words[15] = (ts >> 32) as u32;

        let mut payload = Vec::with_capacity(64);
        for w in words {
            payload.extend_from_slice(&w.to_ne_bytes());
        }

        Fragment {
            meta: FragmentMeta {
                timestamp: ts,
                frame_number,
                source_id,
                wrong_endian: false,
            },
            payload,
        }
    }

    fn shard_with_pool(expected: usize, timeout: Duration) -> (ShardHandle, ShardJoin, SlotPool) {
        let pool = SlotPool::new(16, 64 * 1024);
        let sink = Sink::Ets(EtsSink::new(pool.attach().unwrap()));
        let cfg = ShardConfig {
            timestamp_slop: 100,
            frame_timeout: timeout,
            expected_fragments: expected,
        };
        let (handle, join) = spawn(0, cfg, vec![sink], Arc::new(ShardStats::default())).unwrap();
        (handle, join, pool)
    }

    fn stop(handle: &ShardHandle, join: &mut ShardJoin) {
        handle.signal_shutdown();
        handle.notify();
        assert!(join.wait(Duration::from_secs(2)));
    }

    #[test]
    fn test_releases_on_completeness() {
        let (handle, mut join, pool) = shard_with_pool(2, Duration::from_secs(5));

        handle.insert(fragment(42, 1, 1));
        handle.insert(fragment(42, 1, 2));

        let event = pool.consume(Duration::from_secs(2)).expect("one record");
        // Stream count 2 in the aggregated bank status byte.
        assert_eq!(event[15 * 4 + 3], 0x02);

        assert_eq!(handle.stats().fragments_processed.load(Ordering::Relaxed), 2);
        assert_eq!(handle.stats().frames_built.load(Ordering::Relaxed), 1);
        stop(&handle, &mut join);
    }

    #[test]
    fn test_releases_on_timeout() {
        let (handle, mut join, pool) = shard_with_pool(4, Duration::from_millis(150));

        handle.insert(fragment(7, 1, 1));
        // Incomplete: only one of four fragments ever arrives.
        let event = pool.consume(Duration::from_secs(2)).expect("timed-out record");
        assert_eq!(event[15 * 4 + 3], 0x01);
        stop(&handle, &mut join);
    }

    #[test]
    fn test_distinct_timestamps_stay_separate() {
        let (handle, mut join, pool) = shard_with_pool(1, Duration::from_secs(5));

        handle.insert(fragment(100, 1, 1));
        handle.insert(fragment(200, 2, 1));

        assert!(pool.consume(Duration::from_secs(2)).is_some());
        assert!(pool.consume(Duration::from_secs(2)).is_some());
        assert_eq!(handle.stats().frames_built.load(Ordering::Relaxed), 2);
        stop(&handle, &mut join);
    }

    #[test]
    fn test_shutdown_drops_pending_aggregates() {
        let (handle, mut join, pool) = shard_with_pool(4, Duration::from_secs(60));

        handle.insert(fragment(9, 1, 1));
        stop(&handle, &mut join);

        assert_eq!(pool.pending(), 0);
        assert_eq!(handle.stats().frames_built.load(Ordering::Relaxed), 0);
    }
}
