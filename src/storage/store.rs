//! Chunk store: the single owner of the storage medium
//!
//! Every filesystem access (audio writes, chunk creation, retrieval reads,
//! deletes) goes through one mutex so operations from the consumer thread
//! and the retrieval thread never interleave at the byte level.

use parking_lot::Mutex;
use std::sync::Arc;

use crate::constants::{AUDIO_DIR, CHECKPOINT_FILE, COUNTER_FILE};
use crate::error::{FsError, StorageError};
use crate::storage::fs::Filesystem;
use crate::storage::naming::{ChunkName, Clock};
use crate::storage::rotation::ChunkRotationTimer;

/// Persisted chunk counters: `[start:4][current:4]` little-endian
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkCounters {
    /// Counter of the oldest chunk created since the counters were reset
    pub start: u32,
    /// Counter of the most recently created chunk
    pub current: u32,
}

impl ChunkCounters {
    pub const ENCODED_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..4].copy_from_slice(&self.start.to_le_bytes());
        buf[4..].copy_from_slice(&self.current.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let start = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let current = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Some(Self {
            start,
            current: current.max(start),
        })
    }

    fn advance(&mut self) -> u32 {
        self.current = self.current.wrapping_add(1);
        if self.start == 0 || self.start > self.current {
            self.start = self.current;
        }
        self.current
    }
}

/// Last acknowledged retrieval position:
/// `[file_tag:4][offset:4][counter:4]` little-endian.
///
/// Records written without the counter (8 bytes) still decode, with
/// `counter` 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub file_tag: u32,
    pub offset: u32,
    /// Counter of the checkpointed chunk, 0 when unknown
    pub counter: u32,
}

impl Checkpoint {
    pub const ENCODED_LEN: usize = 12;
    const SHORT_LEN: usize = 8;

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..4].copy_from_slice(&self.file_tag.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..].copy_from_slice(&self.counter.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SHORT_LEN {
            return None;
        }
        let counter = if buf.len() >= Self::ENCODED_LEN {
            u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]])
        } else {
            0
        };
        Some(Self {
            file_tag: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            offset: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            counter,
        })
    }

    /// Whether this checkpoint points into `name`.
    ///
    /// Tags repeat for chunks created in the same second, so the counter
    /// decides when it is known.
    pub fn refers_to(&self, name: &ChunkName) -> bool {
        if self.counter != 0 {
            self.counter == name.counter
        } else {
            self.file_tag == name.file_tag()
        }
    }
}

/// One chunk found on the medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    pub name: ChunkName,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MountState {
    Unmounted,
    Mounted,
    /// A write failed; writes are refused until the next mount
    Degraded,
}

struct StoreInner {
    fs: Box<dyn Filesystem>,
    state: MountState,
    active: Option<ChunkName>,
    counters: ChunkCounters,
    /// Bumped by every nuke; staged data from an older epoch is stale
    epoch: u64,
}

/// Mutex-guarded view of the removable medium
pub struct ChunkStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
    timer: Arc<ChunkRotationTimer>,
}

impl ChunkStore {
    /// Unmounted store; call [`ChunkStore::mount`] before use
    pub fn new(
        fs: Box<dyn Filesystem>,
        clock: Arc<dyn Clock>,
        timer: Arc<ChunkRotationTimer>,
    ) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                fs,
                state: MountState::Unmounted,
                active: None,
                counters: ChunkCounters::default(),
                epoch: 0,
            }),
            clock,
            timer,
        }
    }

    /// Initialize (or re-initialize) the medium.
    ///
    /// Loads the persisted counters and never lets them fall behind the
    /// highest counter already present on disk. Any previous active chunk
    /// is forgotten; the next write opens a new one.
    pub fn mount(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.active = None;
        self.timer.chunk_closed();

        match Self::load_volume(&mut *inner.fs) {
            Ok(counters) => {
                inner.counters = counters;
                inner.state = MountState::Mounted;
                self.timer.set_storage_mounted(true);
                tracing::info!(
                    "Storage mounted: chunk counters start={} current={}",
                    counters.start,
                    counters.current
                );
                Ok(())
            }
            Err(e) => {
                inner.state = MountState::Unmounted;
                self.timer.set_storage_mounted(false);
                tracing::error!("Failed to mount storage: {}", e);
                Err(e)
            }
        }
    }

    fn load_volume(fs: &mut dyn Filesystem) -> Result<ChunkCounters, StorageError> {
        fs.create_dir_all(AUDIO_DIR)?;

        let mut buf = [0u8; ChunkCounters::ENCODED_LEN];
        let mut counters = match fs.read_at(COUNTER_FILE, 0, &mut buf) {
            Ok(n) => ChunkCounters::decode(&buf[..n]).unwrap_or_else(|| {
                tracing::warn!("Chunk counter file truncated ({} bytes), rebuilding", n);
                ChunkCounters::default()
            }),
            Err(FsError::NotFound(_)) => {
                tracing::info!("No chunk counter file, starting from 0");
                ChunkCounters::default()
            }
            Err(e) => return Err(e.into()),
        };

        let highest_on_disk = fs
            .read_dir(AUDIO_DIR)?
            .iter()
            .filter_map(|entry| ChunkName::parse(&entry.name))
            .map(|name| name.counter)
            .max();
        if let Some(highest) = highest_on_disk {
            if highest > counters.current {
                tracing::warn!(
                    "Persisted counter {} behind chunk {} on disk, catching up",
                    counters.current,
                    highest
                );
                counters.current = highest;
            }
        }

        Ok(counters)
    }

    pub fn is_mounted(&self) -> bool {
        self.inner.lock().state == MountState::Mounted
    }

    pub fn is_degraded(&self) -> bool {
        self.inner.lock().state == MountState::Degraded
    }

    /// Stop accepting writes until the next mount
    pub fn mark_degraded(&self) {
        let mut inner = self.inner.lock();
        self.degrade(&mut inner);
    }

    fn degrade(&self, inner: &mut StoreInner) {
        if inner.state != MountState::Degraded {
            tracing::error!("Storage degraded, writes suspended until remount");
        }
        inner.state = MountState::Degraded;
        inner.active = None;
        self.timer.chunk_closed();
        self.timer.set_storage_mounted(false);
    }

    /// Convert a filesystem error, degrading the store when the medium itself failed
    fn fail(&self, inner: &mut StoreInner, err: FsError) -> StorageError {
        if err.is_fatal() {
            self.degrade(inner);
        }
        StorageError::Fs(err)
    }

    fn require_writable(inner: &StoreInner) -> Result<(), StorageError> {
        match inner.state {
            MountState::Mounted => Ok(()),
            MountState::Unmounted => Err(StorageError::NotMounted),
            MountState::Degraded => Err(StorageError::Degraded),
        }
    }

    fn require_readable(inner: &StoreInner) -> Result<(), StorageError> {
        match inner.state {
            MountState::Unmounted => Err(StorageError::NotMounted),
            _ => Ok(()),
        }
    }

    pub fn active_chunk(&self) -> Option<ChunkName> {
        self.inner.lock().active
    }

    pub fn counters(&self) -> ChunkCounters {
        self.inner.lock().counters
    }

    /// Persist the incremented counter, then create the chunk file
    fn open_chunk(&self, inner: &mut StoreInner) -> Result<ChunkName, StorageError> {
        Self::require_writable(inner)?;

        let mut counters = inner.counters;
        let counter = counters.advance();
        if let Err(e) = inner.fs.write_at(COUNTER_FILE, 0, &counters.encode()) {
            tracing::error!("Failed to persist chunk counter {}: {}", counter, e);
            return Err(self.fail(inner, e));
        }
        inner.counters = counters;

        let name = ChunkName::new(self.clock.now(), counter);
        if let Err(e) = inner.fs.create(&name.path()) {
            tracing::error!("Failed to create chunk {}: {}", name, e);
            inner.active = None;
            self.timer.chunk_closed();
            return Err(self.fail(inner, e));
        }

        inner.active = Some(name);
        self.timer.chunk_started();
        tracing::info!("New audio chunk created: {}", name);
        Ok(name)
    }

    /// Active chunk, opening one if none is active
    pub fn ensure_active(&self) -> Result<ChunkName, StorageError> {
        let mut inner = self.inner.lock();
        match inner.active {
            Some(name) => Ok(name),
            None => self.open_chunk(&mut inner),
        }
    }

    /// Close the active chunk by opening the next one
    pub fn rotate(&self) -> Result<ChunkName, StorageError> {
        let mut inner = self.inner.lock();
        if let Some(previous) = inner.active {
            tracing::debug!("Rotating chunk {}", previous);
        }
        self.open_chunk(&mut inner)
    }

    /// Append to the active chunk, opening one first if needed
    pub fn append_active(&self, data: &[u8]) -> Result<ChunkName, StorageError> {
        let mut inner = self.inner.lock();
        Self::require_writable(&inner)?;
        let name = match inner.active {
            Some(name) => name,
            None => self.open_chunk(&mut inner)?,
        };
        if let Err(e) = inner.fs.append(&name.path(), data) {
            tracing::error!("Write of {} bytes to {} failed: {}", data.len(), name, e);
            // A chunk that vanished underneath us is reopened on the next write
            inner.active = None;
            self.timer.chunk_closed();
            return Err(self.fail(&mut inner, e));
        }
        Ok(name)
    }

    /// Append staged data collected during `epoch`.
    ///
    /// Returns `Ok(None)` without writing when a nuke happened since, as
    /// the data belonged to chunks that no longer exist.
    pub fn append_if_epoch(
        &self,
        epoch: u64,
        data: &[u8],
    ) -> Result<Option<ChunkName>, StorageError> {
        let mut inner = self.inner.lock();
        if inner.epoch != epoch {
            return Ok(None);
        }
        Self::require_writable(&inner)?;
        let name = match inner.active {
            Some(name) => name,
            None => self.open_chunk(&mut inner)?,
        };
        if let Err(e) = inner.fs.append(&name.path(), data) {
            tracing::error!("Write of {} bytes to {} failed: {}", data.len(), name, e);
            inner.active = None;
            self.timer.chunk_closed();
            return Err(self.fail(&mut inner, e));
        }
        Ok(Some(name))
    }

    /// Number of nukes since the store was created
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Directory scan of every chunk, oldest first
    pub fn list_chunks(&self) -> Result<Vec<ChunkInfo>, StorageError> {
        let mut inner = self.inner.lock();
        Self::require_readable(&inner)?;
        let entries = match inner.fs.read_dir(AUDIO_DIR) {
            Ok(entries) => entries,
            Err(e) => return Err(self.fail(&mut inner, e)),
        };
        let mut chunks: Vec<ChunkInfo> = entries
            .into_iter()
            .filter_map(|entry| {
                ChunkName::parse(&entry.name).map(|name| ChunkInfo {
                    name,
                    size: entry.size,
                })
            })
            .collect();
        chunks.sort_by_key(|chunk| chunk.name.counter);
        Ok(chunks)
    }

    pub fn chunk_size(&self, name: &ChunkName) -> Result<u64, StorageError> {
        let mut inner = self.inner.lock();
        Self::require_readable(&inner)?;
        match inner.fs.stat(&name.path()) {
            Ok(meta) => Ok(meta.size),
            Err(e) => Err(self.fail(&mut inner, e)),
        }
    }

    /// Read up to `buf.len()` bytes; a short count means end of chunk
    pub fn read_chunk(
        &self,
        name: &ChunkName,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock();
        Self::require_readable(&inner)?;
        match inner.fs.read_at(&name.path(), offset, buf) {
            Ok(n) => Ok(n),
            Err(e) => Err(self.fail(&mut inner, e)),
        }
    }

    /// Delete one chunk.
    ///
    /// Deleting the active chunk makes the next write open a new one; the
    /// checkpoint is reset when it pointed into the deleted chunk.
    pub fn delete_chunk(&self, name: &ChunkName) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::require_readable(&inner)?;
        if let Err(e) = inner.fs.unlink(&name.path()) {
            return Err(self.fail(&mut inner, e));
        }
        if inner.active == Some(*name) {
            tracing::info!("Deleted active chunk {}", name);
            inner.active = None;
            self.timer.chunk_closed();
        } else {
            tracing::info!("Deleted chunk {}", name);
        }

        let checkpoint = Self::read_checkpoint(&mut *inner.fs)?;
        if checkpoint != Checkpoint::default() && checkpoint.refers_to(name) {
            Self::write_checkpoint(&mut *inner.fs, &Checkpoint::default())?;
        }
        Ok(())
    }

    /// Delete every chunk, reset the checkpoint and open one empty chunk
    pub fn nuke(&self) -> Result<ChunkName, StorageError> {
        let mut inner = self.inner.lock();
        Self::require_writable(&inner)?;

        let entries = match inner.fs.read_dir(AUDIO_DIR) {
            Ok(entries) => entries,
            Err(e) => return Err(self.fail(&mut inner, e)),
        };
        for entry in &entries {
            let path = format!("{}/{}", AUDIO_DIR, entry.name);
            if let Err(e) = inner.fs.unlink(&path) {
                tracing::error!("Failed to delete {} during nuke: {}", path, e);
                return Err(self.fail(&mut inner, e));
            }
        }
        inner.active = None;
        inner.epoch += 1;
        self.timer.chunk_closed();

        if let Err(e) = Self::write_checkpoint(&mut *inner.fs, &Checkpoint::default()) {
            self.degrade(&mut inner);
            return Err(e);
        }

        tracing::info!("Nuked {} files", entries.len());
        self.open_chunk(&mut inner)
    }

    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        Self::require_readable(&inner)?;
        Self::write_checkpoint(&mut *inner.fs, checkpoint)
    }

    pub fn load_checkpoint(&self) -> Result<Checkpoint, StorageError> {
        let mut inner = self.inner.lock();
        Self::require_readable(&inner)?;
        Self::read_checkpoint(&mut *inner.fs)
    }

    fn write_checkpoint(fs: &mut dyn Filesystem, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        fs.write_at(CHECKPOINT_FILE, 0, &checkpoint.encode())?;
        Ok(())
    }

    fn read_checkpoint(fs: &mut dyn Filesystem) -> Result<Checkpoint, StorageError> {
        let mut buf = [0u8; Checkpoint::ENCODED_LEN];
        match fs.read_at(CHECKPOINT_FILE, 0, &mut buf) {
            Ok(0) | Err(FsError::NotFound(_)) => Ok(Checkpoint::default()),
            Ok(n) => Checkpoint::decode(&buf[..n]).ok_or(StorageError::CorruptRecord("checkpoint")),
            Err(e) => Err(e.into()),
        }
    }
}
