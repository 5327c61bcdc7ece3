//! Fragment validation and metadata extraction.
//!
//! Every reassembled buffer begins with an eight-word source header followed
//! by framed metadata. The validator checks the magic sentinel at word 7,
//! auto-detects byte order from it, and extracts the `(timestamp,
//! frame_number, source_id)` triple that drives aggregation. The buffer is
//! never rewritten: wrong-endian fragments are decoded through swapped reads
//! so the payload bytes stay verbatim for the record builder.

use thiserror::Error;

/// Magic sentinel expected in word 7 of every well-formed fragment.
pub const MAGIC: u32 = 0xC0DA_0100;

/// The magic sentinel as it appears through a byte-reversed stream.
pub const MAGIC_SWAPPED: u32 = 0x0001_DAC0;

/// The source header: the first eight 32-bit words of a fragment. Stripped
/// before the fragment payload is incorporated into an output record.
pub const SOURCE_HEADER_BYTES: usize = 32;

/// Minimum fragment size: the sixteen words the validator reads.
const MIN_FRAGMENT_BYTES: usize = 64;

const MAGIC_WORD: usize = 7;
const SOURCE_ID_WORD: usize = 9;
const FRAME_NUMBER_WORD: usize = 13;
const TIMESTAMP_LOW_WORD: usize = 14;
const TIMESTAMP_HIGH_WORD: usize = 15;

/// Errors that reject a fragment outright. The driver counts these and
/// drops the fragment; nothing reaches the engine.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidateError {
    #[error("fragment too short: {size} bytes (minimum {MIN_FRAGMENT_BYTES})")]
    Truncated { size: usize },

    #[error("bad magic in word 7: {found:#010x}")]
    BadMagic { found: u32 },

    #[error("bad source-id marker in word 9: {found:#010x}")]
    BadSourceMarker { found: u32 },
}

/// Metadata extracted from a validated fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentMeta {
    /// 64-bit aggregation timestamp, words 14 (low) and 15 (high).
    pub timestamp: u64,
    /// Frame sequence number, word 13.
    pub frame_number: u32,
    /// Readout source identifier, low byte of word 9.
    pub source_id: u8,
    /// True when the integer fields were decoded via byte swap.
    pub wrong_endian: bool,
}

/// Validate a reassembled fragment and extract its metadata.
pub fn validate(data: &[u8]) -> Result<FragmentMeta, ValidateError> {
    if data.len() < MIN_FRAGMENT_BYTES {
        return Err(ValidateError::Truncated { size: data.len() });
    }

    let wrong_endian = match read_word(data, MAGIC_WORD) {
        MAGIC => false,
        MAGIC_SWAPPED => true,
        found => return Err(ValidateError::BadMagic { found }),
    };

    let read = |index: usize| {
        let word = read_word(data, index);
        if wrong_endian {
            word.swap_bytes()
        } else {
            word
        }
    };

    let word10 = read(SOURCE_ID_WORD);
    if (word10 >> 8) & 0xFF != 0x10 {
        return Err(ValidateError::BadSourceMarker { found: word10 });
    }

    let ts_low = u64::from(read(TIMESTAMP_LOW_WORD));
    let ts_high = u64::from(read(TIMESTAMP_HIGH_WORD));

    Ok(FragmentMeta {
        timestamp: (ts_high << 32) | ts_low,
        frame_number: read(FRAME_NUMBER_WORD),
        source_id: (word10 & 0xFF) as u8,
        wrong_endian,
    })
}

/// Recheck used by the record builder: does the buffer still carry the
/// source-header magic at word 7, in either byte order?
pub fn has_source_magic(data: &[u8]) -> bool {
    data.len() >= SOURCE_HEADER_BYTES
        && matches!(read_word(data, MAGIC_WORD), MAGIC | MAGIC_SWAPPED)
}

#[inline(always)]
fn read_word(data: &[u8], index: usize) -> u32 {
    debug_assert!((index + 1) * 4 <= data.len());
    // Safety: callers verify the buffer length before reading fixed offsets.
    let raw = unsafe { (data.as_ptr().add(index * 4) as *const [u8; 4]).read_unaligned() };
    u32::from_ne_bytes(raw)
}
