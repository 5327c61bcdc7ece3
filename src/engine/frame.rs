//! Pending aggregates, keyed by timestamp inside each shard buffer.

use std::time::{Duration, Instant};

use crate::validator::FragmentMeta;

/// One reassembled fragment: extracted metadata plus the full buffer.
/// The source header stays attached until the record builder strips it, so
/// the builder can recheck the header magic before emitting the payload.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub meta: FragmentMeta,
    pub payload: Vec<u8>,
}

/// The group of fragments sharing one aggregation timestamp. Created on the
/// first fragment, released exactly once when it completes or times out.
#[derive(Debug)]
pub struct AggregatingFrame {
    pub timestamp: u64,
    /// Taken from the first fragment to arrive.
    pub frame_number: u32,
    /// Fragments in arrival order.
    pub fragments: Vec<Fragment>,
    /// Monotonic instant of the first insertion; drives the timeout.
    pub arrival: Instant,
}

impl AggregatingFrame {
    pub fn new(first: Fragment) -> Self {
        Self {
            timestamp: first.meta.timestamp,
            frame_number: first.meta.frame_number,
            arrival: Instant::now(),
            fragments: vec![first],
        }
    }

    pub fn push(&mut self, fragment: Fragment) {
        self.fragments.push(fragment);
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn timed_out(&self, timeout: Duration) -> bool {
        self.arrival.elapsed() > timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(ts: u64, frame_number: u32, source_id: u8) -> Fragment {
        Fragment {
            meta: FragmentMeta {
                timestamp: ts,
                frame_number,
                source_id,
                wrong_endian: false,
            },
            payload: vec![0u8; 64],
        }
    }

    #[test]
    fn test_first_fragment_fixes_key_and_number() {
        let mut frame = AggregatingFrame::new(fragment(5000, 17, 1));
        // Later fragments may disagree on the frame number; the first wins.
        frame.push(fragment(5001, 99, 2));

        assert_eq!(frame.timestamp, 5000);
        assert_eq!(frame.frame_number, 17);
        assert_eq!(frame.fragment_count(), 2);
    }

    #[test]
    fn test_timeout() {
        let frame = AggregatingFrame::new(fragment(1, 1, 1));
        assert!(!frame.timed_out(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(15));
        assert!(frame.timed_out(Duration::from_millis(10)));
    }
}
