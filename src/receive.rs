//! The receive driver: pulls reassembled buffers from a fragment source,
//! validates them, and forwards good fragments to the engine.
//!
//! The source is a trait so the core never depends on the external
//! reassembly library. Dispatch keys off the metadata embedded in the
//! payload, not the transport-level tags: in multi-stream setups the two can
//! disagree, and the payload is authoritative.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::engine::frame::Fragment;
use crate::engine::Engine;
use crate::health::HealthMetrics;
use crate::stats::DriverStats;
use crate::validator;

/// Per-poll receive timeout; also bounds how long shutdown waits on the
/// drive loop.
const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// One reassembled buffer plus the transport-level tags that accompany it.
/// The tags are diagnostic only.
#[derive(Debug)]
pub struct ReassembledEvent {
    pub buffer: Vec<u8>,
    pub sequence: u64,
    pub source_tag: u16,
}

/// A source of reassembled fragment buffers.
pub trait FragmentSource: Send {
    /// Block up to `timeout` for the next buffer; `Ok(None)` on timeout.
    fn next_event(&mut self, timeout: Duration) -> Result<Option<ReassembledEvent>>;
}

/// Fragment source reading one pre-reassembled fragment per UDP datagram.
pub struct UdpSource {
    socket: UdpSocket,
    scratch: Vec<u8>,
    sequence: u64,
}

impl UdpSource {
    pub fn bind(addr: &str, buffer_bytes: usize) -> Result<Self> {
        let socket = UdpSocket::bind(addr).with_context(|| format!("binding UDP socket {addr}"))?;
        Ok(Self {
            socket,
            scratch: vec![0u8; buffer_bytes],
            sequence: 0,
        })
    }
}

impl FragmentSource for UdpSource {
    fn next_event(&mut self, timeout: Duration) -> Result<Option<ReassembledEvent>> {
        self.socket
            .set_read_timeout(Some(timeout))
            .context("setting socket read timeout")?;

        match self.socket.recv(&mut self.scratch) {
            Ok(len) => {
                self.sequence += 1;
                Ok(Some(ReassembledEvent {
                    buffer: self.scratch[..len].to_vec(),
                    sequence: self.sequence,
                    source_tag: 0,
                }))
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e).context("receiving datagram"),
        }
    }
}

/// Run the drive loop until `running` clears: receive, validate, count,
/// dispatch. Invalid fragments are counted and dropped; they never reach the
/// engine.
pub fn run(
    mut source: impl FragmentSource,
    engine: Arc<Engine>,
    stats: Arc<DriverStats>,
    running: Arc<AtomicBool>,
    health: Option<Arc<HealthMetrics>>,
) {
    while running.load(Ordering::SeqCst) {
        let event = match source.next_event(RECV_TIMEOUT) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                stats.receive_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(h) = &health {
                    h.receive_errors.inc();
                }
                warn!(error = %e, "receive failed");
                continue;
            }
        };

        stats.fragments_received.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_received
            .fetch_add(event.buffer.len() as u64, Ordering::Relaxed);
        if let Some(h) = &health {
            h.fragments_received.inc();
        }

        let meta = match validator::validate(&event.buffer) {
            Ok(meta) => meta,
            Err(e) => {
                stats.validation_errors.fetch_add(1, Ordering::Relaxed);
                if let Some(h) = &health {
                    h.validation_errors.inc();
                }
                debug!(
                    sequence = event.sequence,
                    source_tag = event.source_tag,
                    error = %e,
                    "dropping invalid fragment",
                );
                continue;
            }
        };

        if meta.wrong_endian {
            stats.wrong_endian.fetch_add(1, Ordering::Relaxed);
            if let Some(h) = &health {
                h.wrong_endian.inc();
            }
        }

        engine.dispatch(Fragment {
            meta,
            payload: event.buffer,
        });
    }
}
