//! Error types for the audio transport pipeline

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Command error: {0}")]
    Command(#[from] CommandError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Frame queue errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Queue closed: consumer is gone")]
    Closed,

    #[error("Invalid queue capacity: {0} (must be a non-zero power of two)")]
    InvalidCapacity(usize),
}

/// Wireless link errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Link not usable")]
    Unusable,

    #[error("Link congested, gave up after {attempts} attempts")]
    Congested { attempts: u32 },

    #[error("Notify failed: {0}")]
    NotifyFailed(String),
}

/// Filesystem collaborator errors
#[derive(Error, Debug)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("No space left on medium")]
    NoSpace,

    #[error("Storage medium absent")]
    MediumAbsent,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Offline storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage not mounted")]
    NotMounted,

    #[error("Storage degraded, writes suspended until remount")]
    Degraded,

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Persisted record corrupt: {0}")]
    CorruptRecord(&'static str),

    #[error("Frame too large for storage: {0} bytes")]
    FrameTooLarge(usize),
}

/// Retrieval command errors, each echoed to the peer as a result code
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),

    #[error("Invalid length {len} for opcode {opcode:#04x}")]
    InvalidLength { opcode: u8, len: usize },

    #[error("File reference out of range")]
    FileIndexOutOfRange,

    #[error("File is empty")]
    ZeroFileSize,

    #[error("Offset {offset} beyond file size {size}")]
    OffsetBeyondEnd { offset: u32, size: u32 },
}

impl FsError {
    /// Whether the medium itself is unusable, as opposed to a missing path
    pub fn is_fatal(&self) -> bool {
        !matches!(self, FsError::NotFound(_))
    }
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
