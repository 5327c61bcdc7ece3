//! Event-transfer publishing.
//!
//! The event-transfer system (ETS) is an external ring shared with
//! downstream consumers. This module fixes only the sequence of operations a
//! shard performs against it: acquire one free slot with a bounded wait,
//! verify the record fits, copy, set the effective length, release. An
//! oversize record returns the slot unused via the dump operation. The
//! session itself sits behind the [`EtsSystem`] trait; the shipped
//! implementation is an in-process bounded slot pool with the same blocking
//! semantics, used by local consumers and the test suite. A client for an
//! out-of-process ring implements the same trait.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;

use super::WriteError;

/// How long a write waits for a free slot before giving up. Failure is
/// non-fatal: the record is dropped for this sink only.
pub const SLOT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EtsError {
    #[error("timed out waiting for a free event slot")]
    SlotTimeout,
}

/// A leased event slot. Holding one keeps the backing buffer out of the
/// free list until it is put back or dumped.
#[derive(Debug)]
pub struct EtsSlot {
    data: Vec<u8>,
    len: usize,
}

impl EtsSlot {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Record the effective length of the event held in this slot.
    pub fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.data.len());
        self.len = len;
    }
}

/// A session to an event-transfer system, shared read-only by all shards
/// after start-up.
pub trait EtsSystem: Send + Sync {
    /// Create one attachment: a logical cursor owned exclusively by a shard.
    fn attach(&self) -> Result<Box<dyn EtsAttachment>, EtsError>;
}

/// One shard's exclusive cursor into the shared session.
pub trait EtsAttachment: Send {
    /// Acquire a free event slot, waiting up to `timeout`.
    fn new_slot(&mut self, timeout: Duration) -> Result<EtsSlot, EtsError>;

    /// Publish a filled slot to consumers.
    fn put(&mut self, slot: EtsSlot) -> Result<(), EtsError>;

    /// Return an unused slot to the free list without publishing it.
    fn dump(&mut self, slot: EtsSlot) -> Result<(), EtsError>;
}

struct PoolState {
    free: Vec<Vec<u8>>,
    published: VecDeque<(Vec<u8>, usize)>,
}

struct PoolInner {
    state: Mutex<PoolState>,
    slot_freed: Condvar,
    slot_published: Condvar,
}

/// In-process event-transfer ring: a fixed set of fixed-size slots cycling
/// between a free list and a published queue. Producers block on the free
/// list with a deadline; consumers block on the published queue.
#[derive(Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

impl SlotPool {
    /// A pool of `slots` events of `slot_capacity` bytes each.
    pub fn new(slots: usize, slot_capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: (0..slots).map(|_| vec![0u8; slot_capacity]).collect(),
                    published: VecDeque::new(),
                }),
                slot_freed: Condvar::new(),
                slot_published: Condvar::new(),
            }),
        }
    }

    /// Take the oldest published event, waiting up to `timeout`. The slot
    /// returns to the free list.
    pub fn consume(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some((buf, len)) = state.published.pop_front() {
                let event = buf[..len].to_vec();
                state.free.push(buf);
                self.inner.slot_freed.notify_one();
                return Some(event);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (guard, _) = self
                .inner
                .slot_published
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Published events waiting for a consumer.
    pub fn pending(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .published
            .len()
    }
}

struct PoolAttachment {
    inner: Arc<PoolInner>,
}

impl EtsSystem for SlotPool {
    fn attach(&self) -> Result<Box<dyn EtsAttachment>, EtsError> {
        Ok(Box::new(PoolAttachment {
            inner: Arc::clone(&self.inner),
        }))
    }
}

impl EtsAttachment for PoolAttachment {
    fn new_slot(&mut self, timeout: Duration) -> Result<EtsSlot, EtsError> {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(data) = state.free.pop() {
                return Ok(EtsSlot { data, len: 0 });
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EtsError::SlotTimeout);
            }
            let (guard, _) = self
                .inner
                .slot_freed
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn put(&mut self, slot: EtsSlot) -> Result<(), EtsError> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.published.push_back((slot.data, slot.len));
        self.inner.slot_published.notify_one();
        Ok(())
    }

    fn dump(&mut self, slot: EtsSlot) -> Result<(), EtsError> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        state.free.push(slot.data);
        self.inner.slot_freed.notify_one();
        Ok(())
    }
}

/// Per-shard ETS publisher.
pub struct EtsSink {
    attachment: Box<dyn EtsAttachment>,
}

impl EtsSink {
    pub fn new(attachment: Box<dyn EtsAttachment>) -> Self {
        Self { attachment }
    }

    pub fn write(&mut self, record: &[u8]) -> Result<(), WriteError> {
        let mut slot = self.attachment.new_slot(SLOT_TIMEOUT)?;

        if record.len() > slot.capacity() {
            let capacity = slot.capacity();
            self.attachment.dump(slot)?;
            return Err(WriteError::Oversize {
                size: record.len(),
                capacity,
            });
        }

        slot.data_mut()[..record.len()].copy_from_slice(record);
        slot.set_len(record.len());
        self.attachment.put(slot)?;
        Ok(())
    }
}
