//! Streaming time-frame aggregation receiver.
//!
//! Reassembled per-stream fragments come in; validated, timestamp-grouped,
//! hierarchically framed records go out, to an event-transfer slot ring, to
//! size-bounded rolling files, or to both.

pub mod config;
pub mod engine;
pub mod health;
pub mod receive;
pub mod record;
pub mod sink;
pub mod stats;
pub mod validator;
