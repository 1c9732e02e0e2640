//! Storage-bound frame writer
//!
//! Frames are stored as `[len:1][payload]` records. Records accumulate in a
//! staging buffer that is flushed to the active chunk when the next record
//! would overflow it, or immediately when a record fills it exactly.
//!
//! A nuke erases every chunk, so records staged before it are discarded
//! rather than written into the fresh chunk.

use bytes::{BufMut, BytesMut};
use std::sync::Arc;

use crate::constants::{MAX_STORED_FRAME_LEN, STORED_FRAME_PREFIX_LEN};
use crate::error::StorageError;
use crate::storage::naming::ChunkName;
use crate::storage::rotation::ChunkRotationTimer;
use crate::storage::store::ChunkStore;

/// Writer statistics
#[derive(Debug, Clone, Default)]
pub struct WriterStats {
    pub frames_written: u64,
    /// Bytes handed to the medium, prefixes included
    pub bytes_flushed: u64,
    pub flushes: u64,
    pub rotations: u64,
    /// Frames refused or lost to a storage failure
    pub frames_lost: u64,
    /// Staged frames dropped because a nuke erased their chunk
    pub frames_discarded: u64,
}

/// Consumer-side writer into rotating chunks
pub struct ChunkedStorageWriter {
    store: Arc<ChunkStore>,
    timer: Arc<ChunkRotationTimer>,
    staging: BytesMut,
    staging_len: usize,
    stats: WriterStats,
    /// Set while storage is unusable, so the failure is logged once
    suspended: bool,
    /// Store nuke epoch the staged records belong to
    epoch: u64,
}

impl ChunkedStorageWriter {
    pub fn new(store: Arc<ChunkStore>, timer: Arc<ChunkRotationTimer>, staging_len: usize) -> Self {
        let staging_len = staging_len.max(STORED_FRAME_PREFIX_LEN + 1);
        let epoch = store.epoch();
        Self {
            store,
            timer,
            staging: BytesMut::with_capacity(staging_len),
            staging_len,
            stats: WriterStats::default(),
            suspended: false,
            epoch,
        }
    }

    /// Stage one frame, opening or rotating the chunk as needed.
    ///
    /// On error the frame (and anything still staged) is lost and storage
    /// stays unusable until the store is mounted again.
    pub fn write(&mut self, frame: &[u8]) -> Result<(), StorageError> {
        if frame.len() > MAX_STORED_FRAME_LEN {
            self.stats.frames_lost += 1;
            return Err(StorageError::FrameTooLarge(frame.len()));
        }

        let epoch = self.store.epoch();
        if epoch != self.epoch {
            self.discard_staged(epoch);
        }

        if let Err(e) = self.prepare_chunk() {
            return Err(self.lose(e, 1));
        }

        let record_len = STORED_FRAME_PREFIX_LEN + frame.len();
        if self.staging.len() + record_len > self.staging_len {
            if let Err(e) = self.flush() {
                self.stats.frames_lost += 1;
                return Err(e);
            }
        }

        self.staging.put_u8(frame.len() as u8);
        self.staging.put_slice(frame);
        self.stats.frames_written += 1;

        if self.staging.len() == self.staging_len {
            self.flush()?;
        }

        if self.suspended {
            tracing::info!("Storage writes resumed");
            self.suspended = false;
        }
        Ok(())
    }

    /// Make sure a chunk is active, rotating first when due
    fn prepare_chunk(&mut self) -> Result<ChunkName, StorageError> {
        if self.timer.take_rotation_due() {
            // Staged records belong to the chunk being closed
            self.flush()?;
            let name = self.store.rotate()?;
            self.stats.rotations += 1;
            return Ok(name);
        }
        self.store.ensure_active()
    }

    /// Write staged records to the active chunk
    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.staging.is_empty() {
            return Ok(());
        }
        let staged = self.staging.split();
        match self.store.append_if_epoch(self.epoch, &staged) {
            Ok(Some(_)) => {
                self.stats.flushes += 1;
                self.stats.bytes_flushed += staged.len() as u64;
                Ok(())
            }
            Ok(None) => {
                self.staging = staged;
                let epoch = self.store.epoch();
                self.discard_staged(epoch);
                Ok(())
            }
            Err(e) => {
                let records = decode_chunk_frames(&staged).map(|f| f.len()).unwrap_or(0);
                Err(self.lose(e, records as u64))
            }
        }
    }

    /// Drop records staged before a nuke and move to `epoch`
    fn discard_staged(&mut self, epoch: u64) {
        if !self.staging.is_empty() {
            let records = decode_chunk_frames(&self.staging).map(|f| f.len()).unwrap_or(0);
            tracing::info!("Discarding {} staged frames erased by nuke", records);
            self.stats.frames_discarded += records as u64;
            self.staging.clear();
        }
        self.epoch = epoch;
    }

    fn lose(&mut self, err: StorageError, frames: u64) -> StorageError {
        self.stats.frames_lost += frames;
        self.staging.clear();
        if !self.suspended {
            tracing::warn!("Storage write failed, dropping storage-bound frames: {}", err);
            self.suspended = true;
        }
        err
    }

    /// Bytes waiting in the staging buffer
    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn stats(&self) -> WriterStats {
        self.stats.clone()
    }
}

/// Split a chunk byte stream back into frames
pub fn decode_chunk_frames(mut data: &[u8]) -> Result<Vec<&[u8]>, StorageError> {
    let mut frames = Vec::new();
    while let Some((&len, rest)) = data.split_first() {
        let len = len as usize;
        if rest.len() < len {
            return Err(StorageError::CorruptRecord("truncated frame record"));
        }
        frames.push(&rest[..len]);
        data = &rest[len..];
    }
    Ok(frames)
}
