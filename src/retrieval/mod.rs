//! Resumable retrieval of stored chunks

pub mod catalog;
pub mod service;
pub mod session;

pub use catalog::{CatalogCache, CatalogEntry};
pub use service::{CommandHandler, RetrievalRequest, RetrievalWorker};
pub use session::{RetrievalSession, SessionState, SessionStats, TransferMode, TransferSession};
