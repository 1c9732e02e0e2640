//! Offline storage: rotating chunk files on the removable medium

pub mod fs;
pub mod naming;
pub mod rotation;
pub mod store;
pub mod writer;

pub use fs::{DirEntry, Filesystem, HostFs, MemFs, Metadata};
pub use naming::{ChunkName, Clock, FixedClock, SystemClock};
pub use rotation::{ChunkRotationTimer, RotationState, RotationTicker};
pub use store::{Checkpoint, ChunkCounters, ChunkInfo, ChunkStore};
pub use writer::{decode_chunk_frames, ChunkedStorageWriter, WriterStats};
