//! Chunk rotation timer
//!
//! A periodic tick counts how long the active chunk has been open. Once the
//! configured number of ticks has elapsed, rotation becomes due and the
//! next storage write opens a fresh chunk. Ticking is suspended until boot
//! completes and storage is mounted.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Observable rotation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    NoChunk,
    ChunkActive { ticks: u32 },
    RotationDue,
}

/// Tick counter shared by the tick thread, the chunk store and the writer
#[derive(Debug)]
pub struct ChunkRotationTimer {
    rotation_ticks: u32,
    ticks: AtomicU32,
    due: AtomicBool,
    chunk_active: AtomicBool,
    boot_complete: AtomicBool,
    storage_mounted: AtomicBool,
}

impl ChunkRotationTimer {
    pub fn new(rotation_ticks: u32) -> Self {
        Self {
            rotation_ticks: rotation_ticks.max(1),
            ticks: AtomicU32::new(0),
            due: AtomicBool::new(false),
            chunk_active: AtomicBool::new(false),
            boot_complete: AtomicBool::new(false),
            storage_mounted: AtomicBool::new(false),
        }
    }

    /// One scheduling period elapsed
    pub fn tick(&self) {
        if !self.boot_complete.load(Ordering::Acquire)
            || !self.storage_mounted.load(Ordering::Acquire)
            || !self.chunk_active.load(Ordering::Acquire)
        {
            self.ticks.store(0, Ordering::Release);
            self.due.store(false, Ordering::Release);
            return;
        }

        let ticks = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if ticks >= self.rotation_ticks && !self.due.swap(true, Ordering::AcqRel) {
            tracing::debug!("Chunk rotation due after {} ticks", ticks);
        }
    }

    /// Consume a pending rotation
    pub fn take_rotation_due(&self) -> bool {
        self.due.swap(false, Ordering::AcqRel)
    }

    pub fn is_rotation_due(&self) -> bool {
        self.due.load(Ordering::Acquire)
    }

    /// A new chunk was opened
    pub fn chunk_started(&self) {
        self.ticks.store(0, Ordering::Release);
        self.due.store(false, Ordering::Release);
        self.chunk_active.store(true, Ordering::Release);
    }

    /// The active chunk went away (deleted or storage lost)
    pub fn chunk_closed(&self) {
        self.chunk_active.store(false, Ordering::Release);
        self.ticks.store(0, Ordering::Release);
        self.due.store(false, Ordering::Release);
    }

    /// Raised once the rest of the system finished initializing
    pub fn set_boot_complete(&self) {
        if !self.boot_complete.swap(true, Ordering::AcqRel) {
            tracing::info!("Boot complete, chunk rotation enabled");
        }
    }

    pub fn is_boot_complete(&self) -> bool {
        self.boot_complete.load(Ordering::Acquire)
    }

    pub fn set_storage_mounted(&self, mounted: bool) {
        self.storage_mounted.store(mounted, Ordering::Release);
    }

    pub fn rotation_ticks(&self) -> u32 {
        self.rotation_ticks
    }

    pub fn state(&self) -> RotationState {
        if !self.chunk_active.load(Ordering::Acquire) {
            RotationState::NoChunk
        } else if self.due.load(Ordering::Acquire) {
            RotationState::RotationDue
        } else {
            RotationState::ChunkActive {
                ticks: self.ticks.load(Ordering::Acquire),
            }
        }
    }

    /// Drive `tick` from a dedicated thread every `period`
    pub fn spawn_ticker(self: &Arc<Self>, period: Duration) -> std::io::Result<RotationTicker> {
        let running = Arc::new(AtomicBool::new(true));
        let timer = Arc::clone(self);
        let running_for_loop = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("chunk-rotation".into())
            .spawn(move || {
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(period);
                    timer.tick();
                }
                tracing::debug!("Rotation ticker stopped");
            })?;

        Ok(RotationTicker {
            running,
            handle: Some(handle),
        })
    }
}

/// Handle to the tick thread; stops it on drop
pub struct RotationTicker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RotationTicker {
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RotationTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
