//! Size-bounded rolling file output.
//!
//! Each shard owns one open file at a time, named
//! `{prefix}_thread{shard}_file{NNNN}.evio` with a zero-padded sequence
//! starting at 0000. Every file begins with the once-per-file header;
//! records follow back-to-back. The rollover threshold is evaluated after
//! each write, so the last record in a file may push it slightly past the
//! limit. Files are never re-opened.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::info;

use super::WriteError;
use crate::record;
use crate::stats::ShardStats;

/// Rollover threshold: 2 GiB, evaluated after each record write.
pub const ROLLOVER_BYTES: u64 = 2 * 1024 * 1024 * 1024;

const FILE_EXTENSION: &str = "evio";

pub struct FileSink {
    directory: PathBuf,
    prefix: String,
    shard_index: usize,
    rollover_bytes: u64,
    file: Option<File>,
    bytes_in_current_file: u64,
    file_index: u32,
    stats: Arc<ShardStats>,
}

impl FileSink {
    pub fn new(
        directory: PathBuf,
        prefix: String,
        shard_index: usize,
        stats: Arc<ShardStats>,
    ) -> Self {
        Self {
            directory,
            prefix,
            shard_index,
            rollover_bytes: ROLLOVER_BYTES,
            file: None,
            bytes_in_current_file: 0,
            file_index: 0,
            stats,
        }
    }

    /// Override the rollover threshold.
    pub fn with_rollover(mut self, bytes: u64) -> Self {
        self.rollover_bytes = bytes;
        self
    }

    fn current_path(&self) -> PathBuf {
        self.directory.join(format!(
            "{}_thread{}_file{:04}.{}",
            self.prefix, self.shard_index, self.file_index, FILE_EXTENSION
        ))
    }

    fn open_next(&mut self) -> Result<(), WriteError> {
        let path = self.current_path();
        let mut file = File::create(&path)?;
        file.write_all(&record::file_header())?;

        self.bytes_in_current_file = record::FILE_HEADER_BYTES as u64;
        self.stats.files_created.fetch_add(1, Ordering::Relaxed);
        info!(path = %path.display(), "opened output file");

        self.file = Some(file);
        Ok(())
    }

    pub fn write(&mut self, record: &[u8]) -> Result<(), WriteError> {
        if self.file.is_none() {
            self.open_next()?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(record)?;
            self.bytes_in_current_file += record.len() as u64;
        }

        if self.bytes_in_current_file >= self.rollover_bytes {
            info!(
                bytes = self.bytes_in_current_file,
                index = self.file_index,
                "file size limit reached, rolling over",
            );
            // Dropping the handle closes the file; it is never re-opened.
            self.file = None;
            self.file_index += 1;
            self.open_next()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(dir: &std::path::Path, rollover: u64) -> (FileSink, Arc<ShardStats>) {
        let stats = Arc::new(ShardStats::default());
        let sink = FileSink::new(
            dir.to_path_buf(),
            "frames".to_string(),
            0,
            Arc::clone(&stats),
        )
        .with_rollover(rollover);
        (sink, stats)
    }

    #[test]
    fn test_lazy_open_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, stats) = sink(dir.path(), ROLLOVER_BYTES);

        // Nothing opened until the first write.
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

        sink.write(&[0u8; 16]).unwrap();

        let path = dir.path().join("frames_thread0_file0000.evio");
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), record::FILE_HEADER_BYTES + 16);
        assert_eq!(&contents[..record::FILE_HEADER_BYTES], &record::file_header());
        assert_eq!(stats.files_created.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_rollover_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sink, stats) = sink(dir.path(), 256);

        // 100-byte records: the header plus two records crosses 256 bytes.
        sink.write(&[1u8; 100]).unwrap();
        sink.write(&[2u8; 100]).unwrap();
        sink.write(&[3u8; 100]).unwrap();

        let first = std::fs::read(dir.path().join("frames_thread0_file0000.evio")).unwrap();
        let second = std::fs::read(dir.path().join("frames_thread0_file0001.evio")).unwrap();

        // First file kept both straddling records, the third started fresh.
        assert_eq!(first.len(), record::FILE_HEADER_BYTES + 200);
        assert_eq!(second.len(), record::FILE_HEADER_BYTES + 100);
        assert_eq!(&second[..record::FILE_HEADER_BYTES], &record::file_header());
        assert_eq!(&second[record::FILE_HEADER_BYTES..], &[3u8; 100]);
        assert_eq!(stats.files_created.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_shard_index_in_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let stats = Arc::new(ShardStats::default());
        let mut sink = FileSink::new(dir.path().to_path_buf(), "agg".to_string(), 7, stats);

        sink.write(&[0u8; 8]).unwrap();
        assert!(dir.path().join("agg_thread7_file0000.evio").exists());
    }
}
