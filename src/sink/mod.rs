//! Output sinks for built records.
//!
//! Each shard worker owns its sink handles outright: one ETS attachment
//! and/or one rolling file. When both are enabled every released record goes
//! to both; a failure on one sink never inhibits the other.

pub mod ets;
pub mod file;

use thiserror::Error;

use self::ets::{EtsError, EtsSink};
use self::file::FileSink;

/// A failed record write. Per-record and recoverable: the record is skipped
/// for this sink only and the shard counts a build error.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("record of {size} bytes exceeds the slot capacity of {capacity}")]
    Oversize { size: usize, capacity: usize },

    #[error(transparent)]
    Ets(#[from] EtsError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A record publisher owned by one shard. Enum dispatch keeps the
/// per-record call static.
pub enum Sink {
    Ets(EtsSink),
    File(FileSink),
}

impl Sink {
    /// Returns the sink's name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ets(_) => "ets",
            Self::File(_) => "file",
        }
    }

    /// Publish one record.
    pub fn write(&mut self, record: &[u8]) -> Result<(), WriteError> {
        match self {
            Self::Ets(s) => s.write(record),
            Self::File(s) => s.write(record),
        }
    }
}
