//! Top-level wiring of the store-and-forward pipeline
//!
//! [`Recorder`] owns the frame queue, the consumer thread, the rotation
//! ticker and the retrieval worker, and exposes the hooks the platform
//! calls into: codec frames, command writes, boot complete and storage
//! remount.

use std::sync::Arc;

use crate::audio::queue::{FrameProducer, FrameQueue, QueueStats};
use crate::config::AppConfig;
use crate::error::{Result, StorageError};
use crate::link::evaluator::LinkEvaluator;
use crate::link::peer::WirelessLink;
use crate::link::pusher::WirelessPusher;
use crate::protocol::codes::ResultCode;
use crate::retrieval::catalog::CatalogCache;
use crate::retrieval::service::{CommandHandler, RetrievalWorker};
use crate::storage::fs::Filesystem;
use crate::storage::naming::Clock;
use crate::storage::rotation::{ChunkRotationTimer, RotationTicker};
use crate::storage::store::ChunkStore;
use crate::storage::writer::ChunkedStorageWriter;
use crate::transport::{self, TransportContext, TransportStats, TransportWorker};

/// Combined statistics
#[derive(Debug, Clone, Default)]
pub struct RecorderStats {
    pub queue: QueueStats,
    pub transport: TransportStats,
}

pub struct Recorder {
    config: AppConfig,
    producer: FrameProducer,
    store: Arc<ChunkStore>,
    timer: Arc<ChunkRotationTimer>,
    catalog: CatalogCache,
    handler: CommandHandler,
    transport: TransportWorker,
    retrieval: RetrievalWorker,
    ticker: Option<RotationTicker>,
}

impl Recorder {
    /// Validate the configuration, mount storage and start all threads.
    ///
    /// A storage mount failure is not fatal: live streaming still works and
    /// storage can be brought back with [`Recorder::remount_storage`].
    pub fn start(
        config: AppConfig,
        link: Arc<dyn WirelessLink>,
        fs: Box<dyn Filesystem>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let (producer, consumer) =
            FrameQueue::with_capacity(config.queue.capacity, config.queue.max_frame_len)?;

        let timer = Arc::new(ChunkRotationTimer::new(config.storage.rotation_ticks));
        let store = Arc::new(ChunkStore::new(fs, clock, timer.clone()));
        if let Err(e) = store.mount() {
            tracing::warn!("Starting without storage: {}", e);
        }

        let writer =
            ChunkedStorageWriter::new(store.clone(), timer.clone(), config.storage.staging_len);
        let context = TransportContext::new(
            link.clone(),
            LinkEvaluator::new(config.link.min_mtu),
            WirelessPusher::new(config.link.max_send_attempts, config.link.retry_pause()),
            writer,
        );
        let transport = TransportWorker::spawn(context, consumer, config.link.idle_sleep())?;

        let catalog = CatalogCache::new();
        let (retrieval, handler) =
            RetrievalWorker::start(store.clone(), catalog.clone(), link, &config.retrieval)?;

        let ticker = timer.spawn_ticker(config.storage.tick())?;

        tracing::info!(
            "Recorder started: {} slots x {} bytes, chunks of {:?}",
            config.queue.capacity,
            config.queue.max_frame_len,
            config.storage.chunk_duration()
        );

        Ok(Self {
            config,
            producer,
            store,
            timer,
            catalog,
            handler,
            transport,
            retrieval,
            ticker: Some(ticker),
        })
    }

    /// Codec completion path: blocks while the queue is full
    pub fn submit_frame(&self, payload: &[u8]) -> bool {
        transport::submit_frame(&self.producer, payload, self.config.queue.enqueue_retry())
    }

    pub fn producer(&self) -> &FrameProducer {
        &self.producer
    }

    /// Command write from the wireless stack
    pub fn on_command(&self, bytes: &[u8]) -> ResultCode {
        self.handler.on_command(bytes)
    }

    pub fn command_handler(&self) -> CommandHandler {
        self.handler.clone()
    }

    /// Enable chunk rotation once the rest of the system is up
    pub fn set_boot_complete(&self) {
        self.timer.set_boot_complete();
    }

    /// Re-initialize storage after a failure or card swap
    pub fn remount_storage(&self) -> std::result::Result<(), StorageError> {
        self.store.mount()?;
        if !self.handler.request_catalog_refresh() {
            tracing::debug!("Catalog refresh not queued, will refresh on next list");
        }
        Ok(())
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn catalog(&self) -> &CatalogCache {
        &self.catalog
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            queue: self.producer.queue().stats(),
            transport: self.transport.stats(),
        }
    }

    /// Stop every thread; queued frames are routed and staged bytes flushed
    pub fn shutdown(&mut self) {
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
            self.transport.stop();
            if let Some(stats) = self.retrieval.stop() {
                tracing::info!(
                    "Retrieval: {} transfers completed, {} bytes sent",
                    stats.transfers_completed,
                    stats.bytes_sent
                );
            }
            tracing::info!("Recorder stopped");
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::peer::{Characteristic, SimulatedLink};
    use crate::storage::fs::MemFs;
    use crate::storage::naming::FixedClock;
    use std::time::{Duration, Instant};

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.link.idle_sleep_ms = 1;
        config.retrieval.idle_sleep_ms = 1;
        config.storage.tick_ms = 5;
        config
    }

    #[test]
    fn test_offline_frames_land_in_storage() {
        let link = Arc::new(SimulatedLink::new());
        let fs = MemFs::new();
        let mut recorder = Recorder::start(
            test_config(),
            link.clone(),
            Box::new(fs.clone()),
            Arc::new(FixedClock::at(6, 0, 0)),
        )
        .unwrap();

        for _ in 0..10 {
            assert!(recorder.submit_frame(&[5u8; 80]));
        }
        recorder.shutdown();

        let stats = recorder.stats();
        assert_eq!(stats.transport.frames_to_storage, 10);
        let chunks = recorder.store().list_chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 810);
        assert!(link.take_sent_on(Characteristic::Audio).is_empty());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = test_config();
        config.queue.capacity = 3;
        let result = Recorder::start(
            config,
            Arc::new(SimulatedLink::new()),
            Box::new(MemFs::new()),
            Arc::new(FixedClock::at(0, 0, 0)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_remount_after_missing_medium() {
        let fs = MemFs::new();
        fs.set_absent(true);
        let recorder = Recorder::start(
            test_config(),
            Arc::new(SimulatedLink::new()),
            Box::new(fs.clone()),
            Arc::new(FixedClock::at(0, 0, 0)),
        )
        .unwrap();
        assert!(!recorder.store().is_mounted());

        fs.set_absent(false);
        recorder.remount_storage().unwrap();
        assert!(recorder.store().is_mounted());

        let deadline = Instant::now() + Duration::from_secs(2);
        while recorder.catalog().generation() < 1 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(recorder.catalog().generation() >= 1);
    }
}
