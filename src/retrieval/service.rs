//! Callback-side command handling and the retrieval worker thread
//!
//! The wireless stack delivers command writes on a constrained callback
//! context. [`CommandHandler`] only decodes and validates against the cached
//! catalog. Rejections are echoed from the callback; accepted commands go
//! over a bounded channel to [`RetrievalWorker`], which sends the `Ok`
//! acknowledgement itself before running them.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::RetrievalConfig;
use crate::link::peer::{Characteristic, WirelessLink};
use crate::protocol::codes::ResultCode;
use crate::protocol::command::{Command, CommandParser};
use crate::retrieval::catalog::{CatalogCache, CatalogEntry};
use crate::retrieval::session::{RetrievalSession, SessionStats};
use crate::storage::store::ChunkStore;

/// Message from the callback context to the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalRequest {
    Execute {
        command: Command,
        target: Option<CatalogEntry>,
    },
    /// Rescan the medium without notifying the peer
    RefreshCatalog,
}

/// Entry point for command writes from the wireless stack
#[derive(Clone)]
pub struct CommandHandler {
    parser: CommandParser,
    requests: Sender<RetrievalRequest>,
    link: Arc<dyn WirelessLink>,
}

impl CommandHandler {
    pub fn new(
        parser: CommandParser,
        requests: Sender<RetrievalRequest>,
        link: Arc<dyn WirelessLink>,
    ) -> Self {
        Self {
            parser,
            requests,
            link,
        }
    }

    /// Handle one command write.
    ///
    /// Non-`Ok` codes are notified from here. An accepted command is
    /// acknowledged by the worker, ahead of anything it sends for it.
    pub fn on_command(&self, bytes: &[u8]) -> ResultCode {
        let code = match self.parser.parse(bytes) {
            Ok(parsed) => {
                tracing::debug!("Accepted {:?}", parsed.command);
                self.forward(RetrievalRequest::Execute {
                    command: parsed.command,
                    target: parsed.target,
                })
            }
            Err(e) => {
                tracing::info!("Rejected command {:02x?}: {}", bytes, e);
                ResultCode::from(e)
            }
        };

        if code != ResultCode::Ok {
            if let Err(e) = self.link.notify(Characteristic::Storage, &code.to_packet()) {
                tracing::debug!("Could not send result code {:?}: {}", code, e);
            }
        }
        code
    }

    /// Ask the worker to rescan the medium
    pub fn request_catalog_refresh(&self) -> bool {
        self.requests.try_send(RetrievalRequest::RefreshCatalog).is_ok()
    }

    fn forward(&self, request: RetrievalRequest) -> ResultCode {
        match self.requests.try_send(request) {
            Ok(()) => ResultCode::Ok,
            Err(TrySendError::Full(_)) => {
                tracing::warn!("Retrieval command queue full, command refused");
                ResultCode::InvalidCommand
            }
            Err(TrySendError::Disconnected(_)) => {
                tracing::error!("Retrieval worker gone, command refused");
                ResultCode::StorageFailure
            }
        }
    }
}

/// Owns the retrieval session thread
pub struct RetrievalWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<SessionStats>>,
}

impl RetrievalWorker {
    /// Build the command channel and start the session thread
    pub fn start(
        store: Arc<ChunkStore>,
        catalog: CatalogCache,
        link: Arc<dyn WirelessLink>,
        config: &RetrievalConfig,
    ) -> std::io::Result<(Self, CommandHandler)> {
        let (tx, rx) = bounded(config.command_queue_depth.max(1));
        let parser = CommandParser::new(catalog.clone(), config.slice_len);
        let handler = CommandHandler::new(parser, tx, link.clone());

        let session = RetrievalSession::new(
            store,
            catalog,
            link,
            config.slice_len,
            config.heartbeat_ceiling,
        );
        let worker = Self::spawn(session, rx, config.idle_sleep())?;
        Ok((worker, handler))
    }

    /// Run `session` on a new thread fed by `requests`
    pub fn spawn(
        mut session: RetrievalSession,
        requests: Receiver<RetrievalRequest>,
        idle_sleep: Duration,
    ) -> std::io::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();

        let handle = thread::Builder::new()
            .name("retrieval-session".into())
            .spawn(move || {
                if let Err(e) = session.refresh_catalog() {
                    tracing::warn!("Initial catalog scan failed: {}", e);
                }
                tracing::info!("Retrieval worker started");

                while running_for_loop.load(Ordering::Relaxed) {
                    // Drain pending commands before the next transfer step
                    loop {
                        match requests.try_recv() {
                            Ok(request) => Self::apply(&mut session, request),
                            Err(crossbeam_channel::TryRecvError::Empty) => break,
                            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                                tracing::info!("Command channel closed, retrieval worker exiting");
                                return session.stats();
                            }
                        }
                    }

                    if session.step() {
                        thread::yield_now();
                        continue;
                    }

                    match requests.recv_timeout(idle_sleep) {
                        Ok(request) => Self::apply(&mut session, request),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }

                tracing::info!("Retrieval worker stopped");
                session.stats()
            })?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    fn apply(session: &mut RetrievalSession, request: RetrievalRequest) {
        match request {
            RetrievalRequest::Execute { command, target } => session.execute(command, target),
            RetrievalRequest::RefreshCatalog => {
                if let Err(e) = session.refresh_catalog() {
                    tracing::warn!("Catalog refresh failed: {}", e);
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }

    /// Stop the thread and return its final counters
    pub fn stop(&mut self) -> Option<SessionStats> {
        self.running.store(false, Ordering::SeqCst);
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for RetrievalWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
