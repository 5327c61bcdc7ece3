//! Aggregated time-frame record construction.
//!
//! A released aggregate becomes one hierarchical record: a 14-word record
//! header, an aggregated-frame bank, and inside it a stream-info bank
//! carrying a time-slice segment (frame number + averaged timestamp) and an
//! aggregation-info segment (one entry per source). The stripped source
//! payloads follow, byte-for-byte as they arrived. All header and metadata
//! words are written big-endian; payload bytes are never swapped, because
//! downstream tools detect per-source byte order from the embedded magic.
//!
//! The three nested length fields (record, aggregated bank, stream-info
//! bank) let parsers skip the structure at any level. They are patched after
//! payload sizes are known.

use thiserror::Error;

use crate::engine::frame::AggregatingFrame;
use crate::validator::{self, MAGIC, SOURCE_HEADER_BYTES};

/// Fixed record header length in words.
pub const RECORD_HEADER_WORDS: usize = 14;

/// Once-per-file header length in bytes (14 words).
pub const FILE_HEADER_BYTES: usize = 56;

/// Aggregated time-frame bank tag.
const AGG_BANK_TAG: u32 = 0xFF60;
/// Stream-info bank tag.
const STREAM_INFO_TAG: u32 = 0xFF31;
/// Container type codes.
const BANK_TYPE: u32 = 0x10;
const SEGMENT_TYPE: u32 = 0x20;
/// Segment tags inside the stream-info bank.
const TIME_SLICE_SEG_TAG: u32 = 0x32;
const AGG_INFO_SEG_TAG: u32 = 0x42;
const SEG_DATA_TYPE: u32 = 0x01;

/// Word 5 of the record header: format version 6, last-record flag,
/// record-header type, big-endian marker.
const BIT_INFO: u32 = 6 | (1 << 9) | (1 << 14) | (1 << 31);

/// File type id "EVIO" in ASCII, word 0 of the file header.
const FILE_TYPE_ID: u32 = 0x4556_494F;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BuildError {
    #[error("no fragment passed the source-header recheck ({excluded} excluded)")]
    NoValidFragments { excluded: usize },
}

/// One built record plus the bookkeeping the shard worker folds into its
/// counters.
#[derive(Debug)]
pub struct BuiltRecord {
    /// The complete record, ready for either sink.
    pub bytes: Vec<u8>,
    /// Fragments whose payloads appear in the record.
    pub fragment_count: usize,
    /// Fragments dropped by the source-header recheck.
    pub excluded: usize,
    /// True when the event-time spread exceeded the configured slop; the
    /// record carries the error flag but is still published.
    pub slop_exceeded: bool,
}

/// Build the record for one released aggregate.
///
/// Fragments failing the header recheck are excluded before any derived
/// value is computed, so the stream count, per-source entries, and averaged
/// timestamp all describe the payloads actually present.
pub fn build(frame: &AggregatingFrame, timestamp_slop: u64) -> Result<BuiltRecord, BuildError> {
    let mut included = Vec::with_capacity(frame.fragments.len());
    for fragment in &frame.fragments {
        if validator::has_source_magic(&fragment.payload) {
            included.push(fragment);
        }
    }
    let excluded = frame.fragments.len() - included.len();
    if included.is_empty() {
        return Err(BuildError::NoValidFragments { excluded });
    }

    let mut ts_min = u64::MAX;
    let mut ts_max = 0u64;
    let mut ts_sum = 0u128;
    for fragment in &included {
        let ts = fragment.meta.timestamp;
        ts_min = ts_min.min(ts);
        ts_max = ts_max.max(ts);
        ts_sum += u128::from(ts);
    }
    let slop_exceeded = ts_max - ts_min > timestamp_slop;
    let ts_avg = (ts_sum / included.len() as u128) as u64;

    // Bit 7 carries the error flag; bits 0-6 the stream count.
    let stream_status = (u32::from(slop_exceeded) << 7) | (included.len() as u32 & 0x7F);

    let mut words: Vec<u32> = Vec::with_capacity(23 + included.len());
    words.extend_from_slice(&[
        0,                           // record length, patched below
        0,                           // record number
        RECORD_HEADER_WORDS as u32,  // header length
        1,                           // one event per record
        0,                           // no index array
        BIT_INFO,
        0,                           // no user header
        MAGIC,
        0,                           // uncompressed length, patched below
        0,                           // no compression
        0, 0, 0, 0,                  // user registers
    ]);

    let agg_len_index = words.len();
    words.push(0);
    words.push((AGG_BANK_TAG << 16) | (BANK_TYPE << 8) | stream_status);

    let stream_info_len_index = words.len();
    words.push(0);
    words.push((STREAM_INFO_TAG << 16) | (SEGMENT_TYPE << 8) | stream_status);

    // Time-slice segment: frame number plus the 64-bit averaged timestamp.
    words.push((TIME_SLICE_SEG_TAG << 24) | (SEG_DATA_TYPE << 16) | 3);
    words.push(frame.frame_number);
    words.push(ts_avg as u32);
    words.push((ts_avg >> 32) as u32);

    // Aggregation-info segment: one entry per source, id in the high half.
    words.push((AGG_INFO_SEG_TAG << 24) | (SEG_DATA_TYPE << 16) | included.len() as u32);
    for fragment in &included {
        words.push(u32::from(fragment.meta.source_id) << 16);
    }

    words[stream_info_len_index] = (words.len() - stream_info_len_index - 1) as u32;

    let payload_words: usize = included
        .iter()
        .map(|f| padded_words(f.payload.len() - SOURCE_HEADER_BYTES))
        .sum();

    words[agg_len_index] = (words.len() - agg_len_index - 1 + payload_words) as u32;

    let total_words = words.len() + payload_words;
    words[0] = (total_words - 1) as u32;
    words[8] = words[0] - RECORD_HEADER_WORDS as u32;

    let mut bytes = Vec::with_capacity(total_words * 4);
    for word in &words {
        bytes.extend_from_slice(&word.to_be_bytes());
    }
    for fragment in &included {
        bytes.extend_from_slice(&fragment.payload[SOURCE_HEADER_BYTES..]);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
    }

    Ok(BuiltRecord {
        bytes,
        fragment_count: included.len(),
        excluded,
        slop_exceeded,
    })
}

/// The 14-word header written once at the start of each output file.
pub fn file_header() -> [u8; FILE_HEADER_BYTES] {
    let words: [u32; 14] = [
        FILE_TYPE_ID,
        0,  // file number
        14, // header length
        0,  // record count unknown
        0,  // no index array
        6,  // format version
        0,  // no user header
        MAGIC,
        0, 0, // user register
        0, 0, // no trailer
        0, 0, // user integers
    ];

    let mut out = [0u8; FILE_HEADER_BYTES];
    for (i, word) in words.iter().enumerate() {
        out[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    out
}

fn padded_words(bytes: usize) -> usize {
    bytes.div_ceil(4)
}
