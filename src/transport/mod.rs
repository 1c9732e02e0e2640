//! Consumer loop: routes each dequeued frame to the link or to storage
//!
//! All mutable routing state lives in [`TransportContext`], owned by the
//! consumer thread. Each cycle re-evaluates the link before the frame is
//! routed; nothing about connection state is cached between cycles.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::queue::{Frame, FrameConsumer, FrameProducer};
use crate::error::QueueError;
use crate::link::evaluator::{LinkEvaluator, LinkState};
use crate::link::peer::WirelessLink;
use crate::link::pusher::{PushStats, WirelessPusher};
use crate::storage::writer::{ChunkedStorageWriter, WriterStats};

/// Where a frame went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Wireless,
    Storage,
    /// Sink failed; the frame is gone
    Dropped,
}

/// Snapshot of routing counters
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub frames_to_link: u64,
    pub frames_to_storage: u64,
    pub frames_dropped: u64,
    pub link_transitions: u64,
    pub link: PushStats,
    pub storage: WriterStats,
}

/// State owned by the consumer thread
pub struct TransportContext {
    link: Arc<dyn WirelessLink>,
    evaluator: LinkEvaluator,
    pusher: WirelessPusher,
    writer: ChunkedStorageWriter,
    last_state: Option<LinkState>,
    frames_to_link: u64,
    frames_to_storage: u64,
    frames_dropped: u64,
    link_transitions: u64,
}

impl TransportContext {
    pub fn new(
        link: Arc<dyn WirelessLink>,
        evaluator: LinkEvaluator,
        pusher: WirelessPusher,
        writer: ChunkedStorageWriter,
    ) -> Self {
        Self {
            link,
            evaluator,
            pusher,
            writer,
            last_state: None,
            frames_to_link: 0,
            frames_to_storage: 0,
            frames_dropped: 0,
            link_transitions: 0,
        }
    }

    /// Send one frame over the link if usable right now, otherwise store it
    pub fn route(&mut self, frame: &Frame) -> Route {
        let state = self.evaluator.evaluate(self.link.as_ref());
        self.track_transition(state);

        match state {
            LinkState::Usable { mtu } => match self.pusher.push(self.link.as_ref(), mtu, frame) {
                Ok(_) => {
                    self.frames_to_link += 1;
                    Route::Wireless
                }
                Err(_) => {
                    // Dropped frames are not requeued or diverted to storage
                    self.frames_dropped += 1;
                    Route::Dropped
                }
            },
            _ => match self.writer.write(frame.payload()) {
                Ok(()) => {
                    self.frames_to_storage += 1;
                    Route::Storage
                }
                Err(e) => {
                    tracing::trace!("Storage-bound frame dropped: {}", e);
                    self.frames_dropped += 1;
                    Route::Dropped
                }
            },
        }
    }

    fn track_transition(&mut self, state: LinkState) {
        let was_usable = self.last_state.map(|s| s.is_usable());
        if was_usable != Some(state.is_usable()) {
            if state.is_usable() {
                tracing::info!("Link usable ({:?}), streaming live", state);
                // Staged records would otherwise wait for the next offline period
                if let Err(e) = self.writer.flush() {
                    tracing::warn!("Flush on link recovery failed: {}", e);
                }
            } else {
                tracing::info!("Link unusable ({:?}), recording to storage", state);
            }
            if was_usable.is_some() {
                self.link_transitions += 1;
            }
        }
        self.last_state = Some(state);
    }

    /// Drain every frame currently queued. Returns how many were routed.
    pub fn drain(&mut self, consumer: &FrameConsumer) -> usize {
        let mut routed = 0;
        while let Some(frame) = consumer.dequeue() {
            self.route(&frame);
            routed += 1;
        }
        routed
    }

    /// Write out anything staged for storage
    pub fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("Final storage flush failed: {}", e);
        }
    }

    pub fn last_link_state(&self) -> Option<LinkState> {
        self.last_state
    }

    pub fn stats(&self) -> TransportStats {
        TransportStats {
            frames_to_link: self.frames_to_link,
            frames_to_storage: self.frames_to_storage,
            frames_dropped: self.frames_dropped,
            link_transitions: self.link_transitions,
            link: self.pusher.stats(),
            storage: self.writer.stats(),
        }
    }
}

/// Producer-side entry point for the codec completion path.
///
/// Blocks while the queue is full. Failures have no caller to report to,
/// so they are logged and the frame is discarded.
pub fn submit_frame(producer: &FrameProducer, payload: &[u8], retry: Duration) -> bool {
    match producer.enqueue_blocking(payload, retry) {
        Ok(_) => true,
        Err(QueueError::Closed) => {
            tracing::debug!("Frame discarded, transport stopped");
            false
        }
        Err(e) => {
            tracing::warn!("Frame discarded: {}", e);
            false
        }
    }
}

/// Consumer thread running a [`TransportContext`]
pub struct TransportWorker {
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<TransportStats>>,
    handle: Option<JoinHandle<()>>,
}

impl TransportWorker {
    pub fn spawn(
        mut context: TransportContext,
        consumer: FrameConsumer,
        idle_sleep: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(Mutex::new(TransportStats::default()));
        let running_for_loop = running.clone();
        let stats_for_loop = stats.clone();

        let handle = thread::Builder::new()
            .name("transport-consumer".into())
            .spawn(move || {
                tracing::info!("Transport worker started");
                while running_for_loop.load(Ordering::Relaxed) {
                    if context.drain(&consumer) > 0 {
                        *stats_for_loop.lock() = context.stats();
                        thread::yield_now();
                    } else {
                        thread::sleep(idle_sleep);
                    }
                }
                // Whatever is still queued is routed before exit
                context.drain(&consumer);
                context.flush();
                *stats_for_loop.lock() = context.stats();
                tracing::info!("Transport worker stopped");
            })?;

        Ok(Self {
            running,
            stats,
            handle: Some(handle),
        })
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TransportWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
