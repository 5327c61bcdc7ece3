//! Operational counters and periodic reporting.
//!
//! Counters are relaxed atomics: exact cross-field consistency is not needed
//! for rate reporting, and the hot paths must not contend.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::info;

/// Receive-side counters, updated by the driver threads.
#[derive(Debug, Default)]
pub struct DriverStats {
    pub fragments_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub validation_errors: AtomicU64,
    pub wrong_endian: AtomicU64,
    pub receive_errors: AtomicU64,
}

impl DriverStats {
    pub fn snapshot(&self) -> DriverSnapshot {
        DriverSnapshot {
            fragments_received: self.fragments_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            wrong_endian: self.wrong_endian.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DriverStats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverSnapshot {
    pub fragments_received: u64,
    pub bytes_received: u64,
    pub validation_errors: u64,
    pub wrong_endian: u64,
    pub receive_errors: u64,
}

/// Build-side counters owned by one shard worker. The worker updates them
/// from its own thread; the engine and the reporter only read.
#[derive(Debug, Default)]
pub struct ShardStats {
    pub frames_built: AtomicU64,
    pub fragments_processed: AtomicU64,
    pub build_errors: AtomicU64,
    pub timestamp_errors: AtomicU64,
    pub files_created: AtomicU64,
    pub bytes_written: AtomicU64,
}

impl ShardStats {
    pub fn snapshot(&self) -> BuildStats {
        BuildStats {
            frames_built: self.frames_built.load(Ordering::Relaxed),
            fragments_processed: self.fragments_processed.load(Ordering::Relaxed),
            build_errors: self.build_errors.load(Ordering::Relaxed),
            timestamp_errors: self.timestamp_errors.load(Ordering::Relaxed),
            files_created: self.files_created.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }
}

/// Build-side totals, aggregated across shards.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    pub frames_built: u64,
    pub fragments_processed: u64,
    pub build_errors: u64,
    pub timestamp_errors: u64,
    pub files_created: u64,
    pub bytes_written: u64,
}

impl BuildStats {
    pub fn accumulate(&mut self, other: BuildStats) {
        self.frames_built += other.frames_built;
        self.fragments_processed += other.fragments_processed;
        self.build_errors += other.build_errors;
        self.timestamp_errors += other.timestamp_errors;
        self.files_created += other.files_created;
        self.bytes_written += other.bytes_written;
    }

    /// Average fragments per published frame; 0 when nothing was built.
    pub fn avg_fragments_per_frame(&self) -> f64 {
        if self.frames_built == 0 {
            0.0
        } else {
            self.fragments_processed as f64 / self.frames_built as f64
        }
    }
}

fn per_second(count: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

/// Emit one periodic progress report.
pub fn report_progress(elapsed: Duration, driver: &DriverSnapshot, build: &BuildStats) {
    info!(
        fragments = driver.fragments_received,
        fragments_per_sec = format_args!("{:.1}", per_second(driver.fragments_received, elapsed)),
        recv_mib = format_args!("{:.2}", mib(driver.bytes_received)),
        recv_mib_per_sec =
            format_args!("{:.2}", per_second(driver.bytes_received, elapsed) / (1024.0 * 1024.0)),
        frames_built = build.frames_built,
        frames_per_sec = format_args!("{:.1}", per_second(build.frames_built, elapsed)),
        written_mib = format_args!("{:.2}", mib(build.bytes_written)),
        validation_errors = driver.validation_errors,
        wrong_endian = driver.wrong_endian,
        receive_errors = driver.receive_errors,
        build_errors = build.build_errors,
        timestamp_errors = build.timestamp_errors,
        files_created = build.files_created,
        "status",
    );
}

/// Emit the final shutdown summary.
pub fn report_final(elapsed: Duration, driver: &DriverSnapshot, build: &BuildStats) {
    info!(
        elapsed_sec = format_args!("{:.1}", elapsed.as_secs_f64()),
        fragments = driver.fragments_received,
        recv_mib = format_args!("{:.2}", mib(driver.bytes_received)),
        frames_built = build.frames_built,
        written_mib = format_args!("{:.2}", mib(build.bytes_written)),
        avg_fragments_per_frame = format_args!("{:.2}", build.avg_fragments_per_frame()),
        validation_errors = driver.validation_errors,
        wrong_endian = driver.wrong_endian,
        receive_errors = driver.receive_errors,
        build_errors = build.build_errors,
        timestamp_errors = build.timestamp_errors,
        files_created = build.files_created,
        "final statistics",
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_snapshot() {
        let stats = DriverStats::default();
        stats.fragments_received.fetch_add(3, Ordering::Relaxed);
        stats.bytes_received.fetch_add(4096, Ordering::Relaxed);
        stats.validation_errors.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.fragments_received, 3);
        assert_eq!(snap.bytes_received, 4096);
        assert_eq!(snap.validation_errors, 1);
        assert_eq!(snap.wrong_endian, 0);
    }

    #[test]
    fn test_build_stats_accumulate() {
        let mut total = BuildStats::default();
        total.accumulate(BuildStats {
            frames_built: 2,
            fragments_processed: 8,
            build_errors: 1,
            timestamp_errors: 0,
            files_created: 1,
            bytes_written: 100,
        });
        total.accumulate(BuildStats {
            frames_built: 3,
            fragments_processed: 12,
            build_errors: 0,
            timestamp_errors: 2,
            files_created: 0,
            bytes_written: 50,
        });

        assert_eq!(total.frames_built, 5);
        assert_eq!(total.fragments_processed, 20);
        assert_eq!(total.build_errors, 1);
        assert_eq!(total.timestamp_errors, 2);
        assert_eq!(total.files_created, 1);
        assert_eq!(total.bytes_written, 150);
    }

    #[test]
    fn test_avg_fragments_per_frame() {
        let stats = BuildStats {
            frames_built: 4,
            fragments_processed: 10,
            ..Default::default()
        };
        assert!((stats.avg_fragments_per_frame() - 2.5).abs() < f64::EPSILON);

        assert_eq!(BuildStats::default().avg_fragments_per_frame(), 0.0);
    }

    #[test]
    fn test_per_second_handles_zero_elapsed() {
        assert_eq!(per_second(100, Duration::ZERO), 0.0);
        assert!((per_second(100, Duration::from_secs(4)) - 25.0).abs() < f64::EPSILON);
    }
}
