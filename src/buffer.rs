//! Bounded, time-decayed storage for queued work.
//!
//! `ExpiringCircularBuffer` is an overwrite ring: writes always succeed and
//! may silently replace the oldest unread entry, and entries that outlive
//! their TTL are purged lazily when a read encounters them.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{FloodgateError, Result};

/// Signal returned by [`ExpiringCircularBuffer::take`] when no live entry
/// remains. This is internal control flow: consumers go idle on it, it is
/// never surfaced to application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Empty;

impl std::fmt::Display for Empty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer is empty")
    }
}

impl std::error::Error for Empty {}

/// How a normal (unexpired) read treats the slot it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Reads clone the entry and leave the slot in place, so the same entry
    /// is delivered again once the reader wraps around. Slots are only freed
    /// by TTL expiry or overwrite. This is the historical ring behavior,
    /// relied on by traffic-duplication consumers that re-deliver stored
    /// callbacks.
    #[default]
    Retain,
    /// Reads move the entry out of the slot: exactly-once delivery.
    Consume,
}

struct Slot<T> {
    value: T,
    inserted_at: Instant,
}

struct Ring<T> {
    slots: Vec<Option<Slot<T>>>,
    writer: usize,
    reader: usize,
    ttl: Duration,
}

/// A fixed-capacity ring of `(value, inserted_at)` slots with independent
/// reader and writer cursors and a per-entry TTL.
///
/// All operations are serialized behind an internal mutex: `add` may race
/// with `take` from different threads. Ordering is best-effort FIFO; a write
/// that wraps onto an unread slot silently drops the older entry.
pub struct ExpiringCircularBuffer<T> {
    ring: Mutex<Ring<T>>,
    mode: ReadMode,
}

impl<T: Clone> ExpiringCircularBuffer<T> {
    /// Create a buffer with [`ReadMode::Retain`] semantics.
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        Self::with_mode(capacity, ttl, ReadMode::default())
    }

    /// Create a buffer with explicit read semantics.
    pub fn with_mode(capacity: usize, ttl: Duration, mode: ReadMode) -> Result<Self> {
        validate_capacity(capacity)?;
        validate_ttl(ttl)?;

        Ok(Self {
            ring: Mutex::new(Ring {
                slots: (0..capacity).map(|_| None).collect(),
                writer: 0,
                reader: 0,
                ttl,
            }),
            mode,
        })
    }

    /// Store an entry at the writer cursor, overwriting any unread entry
    /// already there. Always succeeds.
    pub fn add(&self, value: T) {
        let mut ring = self.ring.lock();
        let writer = ring.writer;
        if ring.slots[writer].is_some() {
            trace!(slot = writer, "Overwriting unread entry");
        }
        ring.slots[writer] = Some(Slot {
            value,
            inserted_at: Instant::now(),
        });
        ring.writer = (writer + 1) % ring.slots.len();
    }

    /// Read the next live entry, advancing the reader cursor past it.
    ///
    /// Expired entries encountered by the scan are purged in passing.
    /// Signals [`Empty`] once a full sweep of the ring finds nothing live.
    pub fn take(&self) -> std::result::Result<T, Empty> {
        self.scan().ok_or(Empty)
    }

    /// Like [`take`](Self::take), but with an empty sentinel instead of the
    /// signal.
    pub fn try_take(&self) -> Option<T> {
        self.scan()
    }

    // One bounded sweep of the ring: at most `capacity` probes, never
    // recursion, so adversarial TTL/capacity settings cannot grow the stack.
    fn scan(&self) -> Option<T> {
        let mut ring = self.ring.lock();
        let capacity = ring.slots.len();
        let now = Instant::now();

        for _ in 0..capacity {
            let reader = ring.reader;
            ring.reader = (reader + 1) % capacity;

            let slot = match ring.slots[reader].take() {
                Some(slot) => slot,
                None => continue,
            };
            if now.duration_since(slot.inserted_at) > ring.ttl {
                trace!(slot = reader, "Purged expired entry");
                continue;
            }
            return Some(match self.mode {
                ReadMode::Retain => {
                    let value = slot.value.clone();
                    ring.slots[reader] = Some(slot);
                    value
                }
                ReadMode::Consume => slot.value,
            });
        }
        None
    }

    /// Number of live (unexpired) entries currently stored.
    pub fn len(&self) -> usize {
        let ring = self.ring.lock();
        let now = Instant::now();
        ring.slots
            .iter()
            .flatten()
            .filter(|slot| now.duration_since(slot.inserted_at) <= ring.ttl)
            .count()
    }

    /// Whether no live entry is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Targeted removal is not part of the ring's contract.
    pub fn remove(&self) -> Result<T> {
        Err(FloodgateError::Unsupported("remove"))
    }

    /// Removal-style dequeue is not part of the ring's contract; use
    /// [`take`](Self::take) or [`try_take`](Self::try_take).
    pub fn poll(&self) -> Result<T> {
        Err(FloodgateError::Unsupported("poll"))
    }

    /// Replace the ring storage with `capacity` empty slots, resetting both
    /// cursors. Buffered entries are destroyed.
    pub fn set_capacity(&self, capacity: usize) -> Result<()> {
        validate_capacity(capacity)?;

        let mut ring = self.ring.lock();
        let dropped = ring.slots.iter().flatten().count();
        if dropped > 0 {
            debug!(capacity, dropped, "Resizing ring");
        }
        ring.slots = (0..capacity).map(|_| None).collect();
        ring.writer = 0;
        ring.reader = 0;
        Ok(())
    }

    /// Change the TTL. Existing entries are judged against the new TTL on
    /// their next read.
    pub fn set_ttl(&self, ttl: Duration) -> Result<()> {
        validate_ttl(ttl)?;
        self.ring.lock().ttl = ttl;
        Ok(())
    }
}

fn validate_capacity(capacity: usize) -> Result<()> {
    if capacity < 1 {
        return Err(FloodgateError::InvalidArgument(
            "capacity",
            format!("must be at least 1, got {}", capacity),
        ));
    }
    Ok(())
}

fn validate_ttl(ttl: Duration) -> Result<()> {
    if ttl < Duration::from_millis(1) {
        return Err(FloodgateError::InvalidArgument(
            "ttl",
            format!("must be at least 1ms, got {:?}", ttl),
        ));
    }
    Ok(())
}
