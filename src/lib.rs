//! # Wearable Audio Transport
//!
//! Store-and-forward transport for a wearable audio recorder: encoded codec
//! frames go to a paired wireless peer when the link is usable and to
//! rotating chunk files on removable storage otherwise. Stored chunks are
//! pulled back later through a resumable command protocol.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────┐
//! │ Audio codec  │  producer context (codec completion path)
//! └──────┬───────┘
//!        │ enqueue_blocking (backpressure, never drops)
//!        ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │           FrameQueue (audio::queue) - SPSC slots        │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ dequeue
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        TransportWorker (transport) - consumer thread    │
//! │                                                         │
//! │   LinkEvaluator ── usable? ──┬── yes ─▶ WirelessPusher  │──▶ notify [id|frag|payload]
//! │                              └── no ──▶ ChunkedStorage  │
//! │                                         Writer          │
//! └─────────────────────────────────────────┬───────────────┘
//!                                           │ append (staged)
//!         ChunkRotationTimer ─ tick ─▶ ┌────▼────────────────┐
//!                                      │ ChunkStore          │
//!                                      │ (one mutex, chunks, │
//!                                      │  counter, offset)   │
//!                                      └────▲────────────────┘
//!                                           │ list/read/delete/nuke
//! ┌─────────────────────────────────────────┴───────────────┐
//! │   RetrievalWorker (retrieval) - session thread          │
//! │   CommandHandler (callback) ─ channel ─▶ RetrievalSession│──▶ notify [tag|payload]
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod link;
pub mod protocol;
pub mod recorder;
pub mod retrieval;
pub mod storage;
pub mod transport;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default number of frame queue slots
    pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

    /// Default largest encoded frame produced by the codec
    pub const DEFAULT_MAX_FRAME_LEN: usize = 160;

    /// Little-endian length prefix in front of every queue slot
    pub const QUEUE_SLOT_PREFIX_LEN: usize = 2;

    /// Negotiated MTU floor for the audio link
    pub const MINIMAL_PACKET_SIZE: u16 = 100;

    /// `[packet_id:2][fragment_index:1]` in front of each audio packet
    pub const AUDIO_PACKET_HEADER_LEN: usize = 3;

    /// Notify attempts per packet while the link reports busy
    pub const DEFAULT_MAX_SEND_ATTEMPTS: u32 = 3;

    /// Staging buffer flushed to the active chunk
    pub const DEFAULT_STAGING_LEN: usize = 440;

    /// 1-byte length prefix in front of every stored frame
    pub const STORED_FRAME_PREFIX_LEN: usize = 1;

    /// Largest frame representable with the 1-byte storage prefix
    pub const MAX_STORED_FRAME_LEN: usize = u8::MAX as usize;

    /// Rotation timer period in milliseconds
    pub const DEFAULT_ROTATION_TICK_MS: u64 = 500;

    /// Ticks before a chunk rotates (40 x 500 ms = 20 s)
    pub const DEFAULT_ROTATION_TICKS: u32 = 40;

    /// Largest chunk slice sent per retrieval iteration
    pub const DEFAULT_SLICE_LEN: usize = 440;

    /// Retrieval iterations without heartbeat before checkpointing
    pub const DEFAULT_HEARTBEAT_CEILING: u32 = 100;

    /// `[timestamp:4]` tag in front of multi-file retrieval packets
    pub const FILE_TAG_LEN: usize = 4;

    /// `[timestamp:4][size:4]` per file-list entry
    pub const LIST_ENTRY_LEN: usize = 8;

    /// Directory holding chunk files
    pub const AUDIO_DIR: &str = "audio";

    /// Persisted monotonic chunk counter
    pub const COUNTER_FILE: &str = "counter.bin";

    /// Persisted retrieval checkpoint
    pub const CHECKPOINT_FILE: &str = "info.bin";
}
