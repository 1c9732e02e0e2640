//! Fixed-capacity frame queue between the codec and the transport worker
//!
//! A single-producer single-consumer queue of fixed-size slots. Every slot
//! is preallocated once; the producer takes a free slot, writes the frame
//! into it completely and only then publishes it, so the consumer never
//! observes a partially written slot. A full queue never overwrites unread
//! frames: the producer decides whether to retry or give up.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::constants::QUEUE_SLOT_PREFIX_LEN;
use crate::error::QueueError;

/// One encoded audio frame as produced by the codec
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    payload: Bytes,
}

impl Frame {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.payload
    }
}

/// Fixed-size storage cell: 2-byte little-endian length, then the payload
/// zero-padded to the maximum frame size
pub struct QueueSlot {
    cell: Box<[u8]>,
}

impl QueueSlot {
    fn new(max_frame_len: usize) -> Self {
        Self {
            cell: vec![0u8; QUEUE_SLOT_PREFIX_LEN + max_frame_len].into_boxed_slice(),
        }
    }

    /// Write a whole frame into the cell. Caller guarantees it fits.
    fn fill(&mut self, payload: &[u8]) {
        let len = payload.len() as u16;
        self.cell[..QUEUE_SLOT_PREFIX_LEN].copy_from_slice(&len.to_le_bytes());
        let body = &mut self.cell[QUEUE_SLOT_PREFIX_LEN..];
        body[..payload.len()].copy_from_slice(payload);
        body[payload.len()..].fill(0);
    }

    /// Payload recorded in the cell
    pub fn payload(&self) -> &[u8] {
        let len = u16::from_le_bytes([self.cell[0], self.cell[1]]) as usize;
        &self.cell[QUEUE_SLOT_PREFIX_LEN..QUEUE_SLOT_PREFIX_LEN + len]
    }

    /// Raw cell including prefix and padding
    pub fn as_bytes(&self) -> &[u8] {
        &self.cell
    }
}

/// Shared queue state. Obtain the two endpoints with [`FrameQueue::with_capacity`].
pub struct FrameQueue {
    /// Published slots in FIFO order
    ready: ArrayQueue<QueueSlot>,
    /// Empty slots available to the producer
    free: ArrayQueue<QueueSlot>,
    max_frame_len: usize,
    /// Advanced only by the producer
    head: AtomicU64,
    /// Advanced only by the consumer
    tail: AtomicU64,
    full_events: AtomicU64,
    consumer_alive: AtomicBool,
}

impl FrameQueue {
    /// Allocate `capacity` slots of `max_frame_len` bytes and split into endpoints
    pub fn with_capacity(
        capacity: usize,
        max_frame_len: usize,
    ) -> Result<(FrameProducer, FrameConsumer), QueueError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(QueueError::InvalidCapacity(capacity));
        }

        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            // Cannot fail: exactly `capacity` pushes into a `capacity` queue
            let _ = free.push(QueueSlot::new(max_frame_len));
        }

        let queue = Arc::new(Self {
            ready: ArrayQueue::new(capacity),
            free,
            max_frame_len,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            full_events: AtomicU64::new(0),
            consumer_alive: AtomicBool::new(true),
        });

        Ok((
            FrameProducer {
                queue: queue.clone(),
            },
            FrameConsumer { queue },
        ))
    }

    pub fn capacity(&self) -> usize {
        self.ready.capacity()
    }

    /// Number of published, unread frames
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }

    /// Bytes held by unread slots
    pub fn len_bytes(&self) -> usize {
        self.len() * self.slot_len()
    }

    pub fn slot_len(&self) -> usize {
        QUEUE_SLOT_PREFIX_LEN + self.max_frame_len
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity(),
            len: self.len(),
            enqueued: self.head.load(Ordering::Relaxed),
            dequeued: self.tail.load(Ordering::Relaxed),
            full_events: self.full_events.load(Ordering::Relaxed),
        }
    }
}

/// Producer endpoint, owned by the codec completion path
pub struct FrameProducer {
    queue: Arc<FrameQueue>,
}

impl FrameProducer {
    /// Enqueue without blocking. Returns `Ok(false)` when the queue is full.
    pub fn try_enqueue(&self, payload: &[u8]) -> Result<bool, QueueError> {
        let max = self.queue.max_frame_len;
        if payload.len() > max {
            return Err(QueueError::FrameTooLarge {
                len: payload.len(),
                max,
            });
        }
        if !self.queue.consumer_alive.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }

        let Some(mut slot) = self.queue.free.pop() else {
            self.queue.full_events.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        slot.fill(payload);

        // A free slot was available, so the ready queue has room for it
        if let Err(slot) = self.queue.ready.push(slot) {
            let _ = self.queue.free.push(slot);
            return Ok(false);
        }
        self.queue.head.fetch_add(1, Ordering::Release);
        Ok(true)
    }

    /// Enqueue, sleeping `retry` between attempts until a slot frees up.
    ///
    /// Returns the number of retries needed. Audio is never dropped here;
    /// the caller is stalled instead.
    pub fn enqueue_blocking(&self, payload: &[u8], retry: Duration) -> Result<u32, QueueError> {
        let mut retries = 0u32;
        loop {
            if self.try_enqueue(payload)? {
                if retries > 0 {
                    tracing::debug!("Frame enqueued after {} retries", retries);
                }
                return Ok(retries);
            }
            if retries == 0 {
                tracing::warn!(
                    "Frame queue full ({} slots), stalling producer",
                    self.queue.capacity()
                );
            }
            retries = retries.saturating_add(1);
            thread::sleep(retry);
        }
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }
}

/// Consumer endpoint, owned by the transport worker
pub struct FrameConsumer {
    queue: Arc<FrameQueue>,
}

impl FrameConsumer {
    /// Take the oldest frame, if any
    pub fn dequeue(&self) -> Option<Frame> {
        let slot = self.queue.ready.pop()?;
        let frame = Frame::new(Bytes::copy_from_slice(slot.payload()));
        let _ = self.queue.free.push(slot);
        self.queue.tail.fetch_add(1, Ordering::Release);
        Some(frame)
    }

    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }
}

impl Drop for FrameConsumer {
    fn drop(&mut self) {
        self.queue.consumer_alive.store(false, Ordering::Release);
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub capacity: usize,
    pub len: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub full_events: u64,
}

impl QueueStats {
    pub fn fill_level(&self) -> f32 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len as f32 / self.capacity as f32
        }
    }
}
