//! Configuration for the transport pipeline
//!
//! Every section is `#[serde(default)]` so a partial TOML file only
//! overrides the values it names.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::Error;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub link: LinkConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
}

/// Frame queue sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of slots, must be a power of two
    pub capacity: usize,
    /// Largest encoded frame the codec produces
    pub max_frame_len: usize,
    /// Producer sleep between enqueue attempts when the queue is full
    pub enqueue_retry_ms: u64,
}

/// Wireless push settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Negotiated MTU floor below which the link is considered unusable
    pub min_mtu: u16,
    /// Attempts per packet while the notify primitive reports busy
    pub max_send_attempts: u32,
    /// Pause between busy retries
    pub retry_pause_ms: u64,
    /// Consumer sleep when the queue is empty
    pub idle_sleep_ms: u64,
}

/// Offline storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Host directory standing in for the removable medium (simulator)
    pub root: PathBuf,
    /// Staging buffer flushed to the active chunk when full
    pub staging_len: usize,
    /// Rotation timer period
    pub tick_ms: u64,
    /// Ticks before the active chunk is rotated
    pub rotation_ticks: u32,
}

/// Retrieval protocol settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Largest payload read from a chunk per loop iteration
    pub slice_len: usize,
    /// Loop iterations without a heartbeat before the offset is checkpointed
    pub heartbeat_ceiling: u32,
    /// Depth of the callback-to-worker command channel
    pub command_queue_depth: usize,
    /// Worker sleep when idle
    pub idle_sleep_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            enqueue_retry_ms: 1,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            min_mtu: MINIMAL_PACKET_SIZE,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            retry_pause_ms: 1,
            idle_sleep_ms: 10,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("sd"),
            staging_len: DEFAULT_STAGING_LEN,
            tick_ms: DEFAULT_ROTATION_TICK_MS,
            rotation_ticks: DEFAULT_ROTATION_TICKS,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            slice_len: DEFAULT_SLICE_LEN,
            heartbeat_ceiling: DEFAULT_HEARTBEAT_CEILING,
            command_queue_depth: 8,
            idle_sleep_ms: 10,
        }
    }
}

impl QueueConfig {
    pub fn enqueue_retry(&self) -> Duration {
        Duration::from_millis(self.enqueue_retry_ms)
    }
}

impl LinkConfig {
    pub fn retry_pause(&self) -> Duration {
        Duration::from_millis(self.retry_pause_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl StorageConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Approximate chunk duration
    pub fn chunk_duration(&self) -> Duration {
        self.tick() * self.rotation_ticks
    }
}

impl RetrievalConfig {
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults when absent
    pub fn load_or_default() -> Result<Self, Error> {
        let path = default_config_path();
        if path.exists() {
            tracing::info!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            tracing::info!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Write configuration as TOML
    pub fn save(&self, path: &Path) -> Result<(), Error> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<(), Error> {
        let q = &self.queue;
        if q.capacity == 0 || !q.capacity.is_power_of_two() {
            return Err(Error::Config(format!(
                "queue.capacity must be a power of two, got {}",
                q.capacity
            )));
        }
        if q.max_frame_len == 0 || q.max_frame_len > MAX_STORED_FRAME_LEN {
            return Err(Error::Config(format!(
                "queue.max_frame_len must be 1..={}, got {}",
                MAX_STORED_FRAME_LEN, q.max_frame_len
            )));
        }
        if (self.link.min_mtu as usize) <= AUDIO_PACKET_HEADER_LEN {
            return Err(Error::Config(format!(
                "link.min_mtu must exceed the {}-byte packet header",
                AUDIO_PACKET_HEADER_LEN
            )));
        }
        if self.link.max_send_attempts == 0 {
            return Err(Error::Config("link.max_send_attempts must be at least 1".into()));
        }
        if self.storage.staging_len < q.max_frame_len + STORED_FRAME_PREFIX_LEN {
            return Err(Error::Config(format!(
                "storage.staging_len {} cannot hold one {}-byte frame",
                self.storage.staging_len, q.max_frame_len
            )));
        }
        if self.storage.rotation_ticks == 0 || self.storage.tick_ms == 0 {
            return Err(Error::Config("storage rotation period must be non-zero".into()));
        }
        if self.retrieval.slice_len == 0 {
            return Err(Error::Config("retrieval.slice_len must be non-zero".into()));
        }
        if self.retrieval.heartbeat_ceiling == 0 {
            return Err(Error::Config("retrieval.heartbeat_ceiling must be non-zero".into()));
        }
        if self.retrieval.command_queue_depth == 0 {
            return Err(Error::Config("retrieval.command_queue_depth must be non-zero".into()));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "wearable-audio-transport")
}

/// Default configuration file path
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

fn data_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}
