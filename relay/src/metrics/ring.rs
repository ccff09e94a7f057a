//! Lock-free multi-producer, single-consumer metric ring buffer.
//!
//! The buffer is a power-of-two array of slot cells plus two monotonic
//! sequence counters. Producers claim a slot by CAS on the write
//! sequence and store their event with a release write; the one consumer
//! swaps events out slot by slot and then advances the read sequence.
//! A full buffer sheds: [`MetricRingBuffer::publish`] never blocks and
//! never spins on the consumer.
//!
//! Single-consumer discipline is enforced by construction:
//! [`MetricRingBuffer::with_capacity`] returns exactly one [`Drainer`],
//! which is not cloneable, and only a `Drainer` can drain.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use super::MetricEvent;

/// Outcome of a publish attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The event was stored.
    Published,
    /// The buffer was full; the event was shed.
    Dropped,
}

/// The shared buffer. Producers hold an `Arc` and call
/// [`publish`](Self::publish); the consumer drains through its
/// [`Drainer`].
pub struct MetricRingBuffer {
    slots: Box<[AtomicPtr<MetricEvent>]>,
    mask: u64,
    capacity: u64,
    write_seq: AtomicU64,
    read_seq: AtomicU64,
    dropped: AtomicU64,
}

impl MetricRingBuffer {
    /// Create a buffer and its single drainer.
    ///
    /// `requested` is rounded up to the next power of two, with a floor
    /// of 64.
    #[must_use]
    pub fn with_capacity(requested: usize) -> (Arc<Self>, Drainer) {
        let capacity = requested.max(64).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let buffer = Arc::new(Self {
            slots,
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            write_seq: AtomicU64::new(0),
            read_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        let drainer = Drainer {
            buffer: Arc::clone(&buffer),
        };
        (buffer, drainer)
    }

    /// Slot count.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Events currently buffered (claimed but not yet drained).
    #[must_use]
    pub fn len(&self) -> usize {
        let w = self.write_seq.load(Ordering::Acquire);
        let r = self.read_seq.load(Ordering::Acquire);
        w.saturating_sub(r) as usize
    }

    /// Returns `true` when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total events shed because the buffer was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Acquire)
    }

    /// Total events ever accepted (published, whether or not yet drained).
    #[must_use]
    pub fn published(&self) -> u64 {
        self.write_seq.load(Ordering::Acquire)
    }

    /// Buffer occupancy as a fraction of capacity.
    #[must_use]
    pub fn usage(&self) -> f64 {
        self.len() as f64 / self.capacity as f64
    }

    /// Publish one event. Never blocks; a full buffer sheds the event.
    pub fn publish(&self, event: MetricEvent) -> PublishOutcome {
        loop {
            let w = self.write_seq.load(Ordering::Acquire);
            let r = self.read_seq.load(Ordering::Acquire);
            if w.wrapping_sub(r) >= self.capacity {
                self.dropped.fetch_add(1, Ordering::AcqRel);
                return PublishOutcome::Dropped;
            }
            if self
                .write_seq
                .compare_exchange_weak(w, w + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let ptr = Box::into_raw(Box::new(event));
                let slot = &self.slots[(w & self.mask) as usize];
                // The consumer cleared this slot before advancing the
                // read sequence past the previous lap, so the store
                // cannot clobber an undrained event.
                slot.store(ptr, Ordering::Release);
                return PublishOutcome::Published;
            }
        }
    }

    fn take_slot(&self, seq: u64) -> MetricEvent {
        let slot = &self.slots[(seq & self.mask) as usize];
        loop {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: the pointer came from `Box::into_raw` in
                // `publish` and the swap-to-null makes this thread its
                // unique owner.
                return *unsafe { Box::from_raw(ptr) };
            }
            // The producer claimed the sequence but has not stored yet;
            // the store is imminent.
            std::hint::spin_loop();
        }
    }
}

impl Drop for MetricRingBuffer {
    fn drop(&mut self) {
        for slot in &self.slots {
            let ptr = slot.swap(std::ptr::null_mut(), Ordering::AcqRel);
            if !ptr.is_null() {
                // SAFETY: unique ownership at drop; reclaim the leaked box.
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

impl std::fmt::Debug for MetricRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRingBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

/// The single consumer handle. Not cloneable; draining from two places
/// is a construction error, not a runtime race.
#[derive(Debug)]
pub struct Drainer {
    buffer: Arc<MetricRingBuffer>,
}

impl Drainer {
    /// Drain up to `max_batch` events in publish order.
    pub fn drain(&mut self, max_batch: usize) -> Vec<MetricEvent> {
        let r = self.buffer.read_seq.load(Ordering::Acquire);
        let w = self.buffer.write_seq.load(Ordering::Acquire);
        let available = (w.saturating_sub(r) as usize).min(max_batch);
        if available == 0 {
            return Vec::new();
        }

        let mut events = Vec::with_capacity(available);
        for offset in 0..available as u64 {
            events.push(self.buffer.take_slot(r + offset));
        }
        // Single consumer: a plain release store is enough.
        self.buffer
            .read_seq
            .store(r + available as u64, Ordering::Release);
        events
    }

    /// The buffer this drainer consumes from.
    #[must_use]
    pub fn buffer(&self) -> &Arc<MetricRingBuffer> {
        &self.buffer
    }
}
