//! Retrieval session state machine
//!
//! ```text
//! Idle ──ReadFile──▶ Transferring ──remaining == 0──▶ Idle
//!   │                    │
//!   └──Delete/Nuke/Stop──┴──▶ Deleting | Nuking | Stopped ──▶ Idle
//! ```
//!
//! All state lives on the retrieval worker thread. Commands arrive through
//! [`RetrievalSession::execute`] (or [`RetrievalSession::handle`] when the
//! acknowledgement was already sent); [`RetrievalSession::step`] runs one
//! loop iteration of the transfer.

use bytes::Bytes;
use std::sync::Arc;

use crate::constants::FILE_TAG_LEN;
use crate::error::StorageError;
use crate::link::peer::{Characteristic, NotifyError, WirelessLink};
use crate::protocol::codes::{encode_data_packet, encode_file_list, ResultCode};
use crate::protocol::command::Command;
use crate::retrieval::catalog::{CatalogCache, CatalogEntry};
use crate::storage::store::{Checkpoint, ChunkStore};

/// Whether transferred packets carry a file tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Bare payload, single current file
    Legacy,
    /// `[file_tag:4][payload]`
    MultiFile,
}

/// The in-progress transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSession {
    pub target: CatalogEntry,
    pub offset: u32,
    pub remaining: u32,
    pub mode: TransferMode,
}

impl TransferSession {
    fn file_tag(&self) -> Option<u32> {
        match self.mode {
            TransferMode::Legacy => None,
            TransferMode::MultiFile => Some(self.target.file_tag()),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            file_tag: self.target.file_tag(),
            offset: self.offset,
            counter: self.target.name.counter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Transferring,
    Deleting,
    Nuking,
    Stopped,
}

/// Session counters
#[derive(Debug, Clone, Default)]
pub struct SessionStats {
    pub transfers_started: u64,
    pub transfers_completed: u64,
    pub transfers_aborted: u64,
    pub bytes_sent: u64,
    pub checkpoints: u64,
}

pub struct RetrievalSession {
    store: Arc<ChunkStore>,
    catalog: CatalogCache,
    link: Arc<dyn WirelessLink>,
    slice_len: usize,
    heartbeat_ceiling: u32,
    state: SessionState,
    transfer: Option<TransferSession>,
    heartbeat_count: u32,
    read_buf: Vec<u8>,
    stats: SessionStats,
}

impl RetrievalSession {
    pub fn new(
        store: Arc<ChunkStore>,
        catalog: CatalogCache,
        link: Arc<dyn WirelessLink>,
        slice_len: usize,
        heartbeat_ceiling: u32,
    ) -> Self {
        let slice_len = slice_len.max(1);
        Self {
            store,
            catalog,
            link,
            slice_len,
            heartbeat_ceiling: heartbeat_ceiling.max(1),
            state: SessionState::Idle,
            transfer: None,
            heartbeat_count: 0,
            read_buf: vec![0u8; slice_len],
            stats: SessionStats::default(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transfer(&self) -> Option<&TransferSession> {
        self.transfer.as_ref()
    }

    pub fn heartbeat_count(&self) -> u32 {
        self.heartbeat_count
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    /// Rescan the medium and publish the catalog
    pub fn refresh_catalog(&self) -> Result<(), StorageError> {
        let chunks = self.store.list_chunks()?;
        self.catalog.replace(chunks);
        Ok(())
    }

    /// Acknowledge an accepted command with `Ok`, then execute it.
    ///
    /// The acknowledgement goes out on this thread so it always precedes
    /// the command's own output (file list, data packets, completion codes).
    pub fn execute(&mut self, command: Command, target: Option<CatalogEntry>) {
        self.notify_code(ResultCode::Ok);
        self.handle(command, target);
    }

    /// Execute an accepted command. `target` is the catalog entry the
    /// parser resolved for read and delete commands.
    pub fn handle(&mut self, command: Command, target: Option<CatalogEntry>) {
        match command {
            Command::ListFiles => self.list_files(),
            Command::ReadFile { file, offset } => match target {
                Some(target) => {
                    let mode = if file.is_legacy() {
                        TransferMode::Legacy
                    } else {
                        TransferMode::MultiFile
                    };
                    self.start_transfer(target, offset, mode);
                }
                None => tracing::warn!("Read command without resolved target ignored"),
            },
            Command::DeleteFile { .. } => match target {
                Some(target) => self.delete(target),
                None => tracing::warn!("Delete command without resolved target ignored"),
            },
            Command::Nuke => self.nuke(),
            Command::Stop => self.stop(),
            Command::Heartbeat => {
                tracing::trace!("Heartbeat after {} iterations", self.heartbeat_count);
                self.heartbeat_count = 0;
            }
        }
    }

    fn notify(&self, data: &[u8]) -> Result<(), NotifyError> {
        self.link.notify(Characteristic::Storage, data)
    }

    fn notify_code(&self, code: ResultCode) {
        if let Err(e) = self.notify(&code.to_packet()) {
            tracing::debug!("Could not notify {:?}: {}", code, e);
        }
    }

    fn list_files(&mut self) {
        if let Err(e) = self.refresh_catalog() {
            tracing::error!("Catalog scan failed: {}", e);
            self.notify_code(ResultCode::StorageFailure);
            return;
        }
        let entries = self.catalog.snapshot();
        let packet = encode_file_list(&entries, self.link.negotiated_mtu() as usize);
        if (packet[0] as usize) < entries.len() {
            tracing::warn!(
                "File list truncated to {} of {} entries by MTU",
                packet[0],
                entries.len()
            );
        }
        if let Err(e) = self.notify(&packet) {
            tracing::warn!("Failed to send file list: {}", e);
        }
    }

    fn start_transfer(&mut self, target: CatalogEntry, offset: u32, mode: TransferMode) {
        if let Some(previous) = self.transfer.take() {
            tracing::info!(
                "Replacing transfer of {} at offset {}",
                previous.target.name,
                previous.offset
            );
            self.save_checkpoint(&previous);
        }
        let transfer = TransferSession {
            target,
            offset,
            remaining: target.size.saturating_sub(offset),
            mode,
        };
        tracing::info!(
            "Transfer of {} started at offset {} ({} bytes, {:?})",
            target.name,
            offset,
            transfer.remaining,
            mode
        );
        self.transfer = Some(transfer);
        self.heartbeat_count = 0;
        self.state = SessionState::Transferring;
        self.stats.transfers_started += 1;
    }

    fn delete(&mut self, target: CatalogEntry) {
        let previous = self.state;
        self.state = SessionState::Deleting;

        if self.transfer.map(|t| t.target.name) == Some(target.name) {
            tracing::info!("Deleting file under transfer, transfer cancelled");
            self.transfer = None;
            self.stats.transfers_aborted += 1;
        }

        match self.store.delete_chunk(&target.name) {
            Ok(()) => {
                if let Err(e) = self.refresh_catalog() {
                    tracing::warn!("Catalog refresh after delete failed: {}", e);
                }
                self.notify_code(ResultCode::DeleteComplete);
            }
            Err(e) => {
                tracing::error!("Delete of {} failed: {}", target.name, e);
                self.notify_code(ResultCode::StorageFailure);
            }
        }

        self.state = if self.transfer.is_some() && previous == SessionState::Transferring {
            SessionState::Transferring
        } else {
            SessionState::Idle
        };
    }

    fn nuke(&mut self) {
        self.state = SessionState::Nuking;
        if self.transfer.take().is_some() {
            self.stats.transfers_aborted += 1;
        }
        match self.store.nuke() {
            Ok(fresh) => {
                tracing::info!("All chunks deleted, recording continues in {}", fresh);
                if let Err(e) = self.refresh_catalog() {
                    tracing::warn!("Catalog refresh after nuke failed: {}", e);
                }
            }
            Err(e) => {
                tracing::error!("Nuke failed: {}", e);
                self.notify_code(ResultCode::StorageFailure);
            }
        }
        self.state = SessionState::Idle;
    }

    fn stop(&mut self) {
        self.state = SessionState::Stopped;
        if let Some(mut transfer) = self.transfer.take() {
            transfer.remaining = 0;
            tracing::info!(
                "Transfer of {} stopped at offset {}",
                transfer.target.name,
                transfer.offset
            );
            self.save_checkpoint(&transfer);
            self.stats.transfers_aborted += 1;
        }
        self.state = SessionState::Idle;
    }

    fn save_checkpoint(&mut self, transfer: &TransferSession) {
        match self.store.save_checkpoint(&transfer.checkpoint()) {
            Ok(()) => {
                self.stats.checkpoints += 1;
                tracing::debug!(
                    "Checkpointed {} at offset {}",
                    transfer.target.name,
                    transfer.offset
                );
            }
            Err(e) => tracing::warn!("Failed to save checkpoint: {}", e),
        }
    }

    fn abort(&mut self, transfer: TransferSession) {
        self.save_checkpoint(&transfer);
        self.transfer = None;
        self.state = SessionState::Idle;
        self.stats.transfers_aborted += 1;
    }

    /// One loop iteration.
    ///
    /// Returns whether another iteration should follow right away. A
    /// transfer that cannot make progress (MTU too small for a slice) stays
    /// in [`Self::transfer`] but returns `false` so the caller idles.
    pub fn step(&mut self) -> bool {
        let Some(mut transfer) = self.transfer else {
            return false;
        };

        if !self.link.is_connected() || !self.link.is_subscribed(Characteristic::Storage) {
            tracing::info!(
                "Peer gone, transfer of {} ends at offset {}",
                transfer.target.name,
                transfer.offset
            );
            transfer.remaining = 0;
            self.abort(transfer);
            return false;
        }

        let tag_len = match transfer.mode {
            TransferMode::Legacy => 0,
            TransferMode::MultiFile => FILE_TAG_LEN,
        };
        let room = (self.link.negotiated_mtu() as usize).saturating_sub(tag_len);
        let want = self.slice_len.min(room).min(transfer.remaining as usize);
        if want == 0 && transfer.remaining > 0 {
            tracing::debug!("MTU too small for a storage packet, waiting");
            self.count_heartbeat(&transfer);
            self.transfer = Some(transfer);
            return false;
        }

        let read = match self.store.read_chunk(
            &transfer.target.name,
            transfer.offset as u64,
            &mut self.read_buf[..want],
        ) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("Read of {} failed: {}", transfer.target.name, e);
                self.notify_code(ResultCode::StorageFailure);
                self.abort(transfer);
                return false;
            }
        };

        if read > 0 {
            let packet: Bytes = encode_data_packet(transfer.file_tag(), &self.read_buf[..read]);
            match self.notify(&packet) {
                Ok(()) => {
                    transfer.offset += read as u32;
                    transfer.remaining -= read as u32;
                    self.stats.bytes_sent += read as u64;
                }
                Err(NotifyError::Busy) => {
                    // Same slice goes again next iteration
                    self.count_heartbeat(&transfer);
                    self.transfer = Some(transfer);
                    return true;
                }
                Err(NotifyError::Other(msg)) => {
                    tracing::warn!("Storage notify failed, transfer aborted: {}", msg);
                    self.abort(transfer);
                    return false;
                }
            }
        }

        if read < want {
            // End of file: not an error
            tracing::debug!(
                "{} ended early at offset {}",
                transfer.target.name,
                transfer.offset
            );
            transfer.remaining = 0;
        }

        self.count_heartbeat(&transfer);

        if transfer.remaining == 0 {
            self.transfer = None;
            self.state = SessionState::Idle;
            self.stats.transfers_completed += 1;
            self.notify_code(ResultCode::TransferComplete);
            self.save_checkpoint(&transfer);
            tracing::info!(
                "Transfer of {} complete at offset {}",
                transfer.target.name,
                transfer.offset
            );
            return false;
        }

        self.transfer = Some(transfer);
        true
    }

    fn count_heartbeat(&mut self, transfer: &TransferSession) {
        self.heartbeat_count += 1;
        if self.heartbeat_count >= self.heartbeat_ceiling {
            tracing::info!(
                "No heartbeat for {} iterations, checkpointing offset {}",
                self.heartbeat_count,
                transfer.offset
            );
            self.save_checkpoint(transfer);
            self.heartbeat_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::peer::SimulatedLink;
    use crate::protocol::codes::{decode_file_list, parse_tagged_packet};
    use crate::protocol::command::FileRef;
    use crate::storage::fs::MemFs;
    use crate::storage::naming::FixedClock;
    use crate::storage::rotation::ChunkRotationTimer;

    struct Fixture {
        store: Arc<ChunkStore>,
        link: Arc<SimulatedLink>,
        session: RetrievalSession,
    }

    fn fixture(slice_len: usize, ceiling: u32) -> Fixture {
        let timer = Arc::new(ChunkRotationTimer::new(40));
        let store = Arc::new(ChunkStore::new(
            Box::new(MemFs::new()),
            Arc::new(FixedClock::at(1, 2, 3)),
            timer,
        ));
        store.mount().unwrap();
        let link = Arc::new(SimulatedLink::connected(247));
        let session = RetrievalSession::new(
            store.clone(),
            CatalogCache::new(),
            link.clone(),
            slice_len,
            ceiling,
        );
        Fixture {
            store,
            link,
            session,
        }
    }

    fn file_of(fx: &Fixture, len: usize) -> CatalogEntry {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        let name = fx.store.rotate().unwrap();
        fx.store.append_active(&data).unwrap();
        CatalogEntry {
            name,
            size: len as u32,
        }
    }

    fn read(file: FileRef, offset: u32) -> Command {
        Command::ReadFile { file, offset }
    }

    fn run(session: &mut RetrievalSession) {
        for _ in 0..1000 {
            if !session.step() {
                return;
            }
        }
        panic!("transfer did not finish");
    }

    #[test]
    fn test_multi_file_transfer() {
        let mut fx = fixture(100, 1000);
        let entry = file_of(&fx, 250);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        assert_eq!(fx.session.state(), SessionState::Transferring);
        run(&mut fx.session);
        assert_eq!(fx.session.state(), SessionState::Idle);

        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(sent.len(), 4);
        let mut payload = Vec::new();
        for packet in &sent[..3] {
            let (tag, body) = parse_tagged_packet(packet).unwrap();
            assert_eq!(tag, entry.file_tag());
            payload.extend_from_slice(body);
        }
        assert_eq!(payload, (0..250).map(|i| i as u8).collect::<Vec<_>>());
        assert_eq!(&sent[3][..], &[ResultCode::TransferComplete.as_u8()]);

        assert_eq!(
            fx.store.load_checkpoint().unwrap(),
            Checkpoint {
                file_tag: entry.file_tag(),
                offset: 250,
                counter: entry.name.counter,
            }
        );
    }

    #[test]
    fn test_legacy_transfer_untagged() {
        let mut fx = fixture(440, 1000);
        let entry = file_of(&fx, 30);

        fx.session.handle(read(FileRef::Current(1), 10), Some(entry));
        run(&mut fx.session);

        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(&sent[0][..], &(10..30).map(|i| i as u8).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn test_short_read_finalizes() {
        let mut fx = fixture(100, 1000);
        let entry = file_of(&fx, 150);
        // Catalog claims more than is on disk
        let stale = CatalogEntry { size: 400, ..entry };

        fx.session.handle(read(FileRef::Index(0), 0), Some(stale));
        run(&mut fx.session);

        let sent = fx.link.take_sent_on(Characteristic::Storage);
        let data: usize = sent[..sent.len() - 1]
            .iter()
            .map(|p| p.len() - FILE_TAG_LEN)
            .sum();
        assert_eq!(data, 150);
        assert_eq!(fx.session.stats().transfers_completed, 1);
    }

    #[test]
    fn test_stop_checkpoints_without_marker() {
        let mut fx = fixture(10, 1000);
        let entry = file_of(&fx, 100);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        fx.session.step();
        fx.session.step();
        fx.session.handle(Command::Stop, None);

        assert!(fx.session.transfer().is_none());
        assert!(!fx.session.step());
        assert_eq!(fx.store.load_checkpoint().unwrap().offset, 20);
        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(sent.len(), 2);
    }

    #[test]
    fn test_heartbeat_ceiling_checkpoints() {
        let mut fx = fixture(10, 5);
        let entry = file_of(&fx, 1000);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        for _ in 0..4 {
            fx.session.step();
        }
        assert_eq!(fx.store.load_checkpoint().unwrap(), Checkpoint::default());

        fx.session.step();
        let offset = fx.session.transfer().unwrap().offset;
        assert_eq!(offset, 50);
        assert_eq!(fx.store.load_checkpoint().unwrap().offset, offset);
        assert_eq!(fx.session.heartbeat_count(), 0);
    }

    #[test]
    fn test_heartbeat_resets_counter() {
        let mut fx = fixture(10, 5);
        let entry = file_of(&fx, 1000);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        for _ in 0..4 {
            fx.session.step();
        }
        fx.session.handle(Command::Heartbeat, None);
        for _ in 0..4 {
            fx.session.step();
        }
        assert_eq!(fx.store.load_checkpoint().unwrap(), Checkpoint::default());
    }

    #[test]
    fn test_disconnect_ends_transfer() {
        let mut fx = fixture(10, 1000);
        let entry = file_of(&fx, 100);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        fx.session.step();
        fx.link.disconnect();
        assert!(!fx.session.step());
        assert!(fx.session.transfer().is_none());
        assert_eq!(fx.store.load_checkpoint().unwrap().offset, 10);
    }

    #[test]
    fn test_busy_resends_same_slice() {
        let mut fx = fixture(10, 1000);
        let entry = file_of(&fx, 20);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        fx.link.inject_busy(1);
        assert!(fx.session.step());
        assert_eq!(fx.session.transfer().unwrap().offset, 0);
        run(&mut fx.session);

        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(sent.len(), 3);
        assert_eq!(parse_tagged_packet(&sent[0]).unwrap().1, &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_mtu_too_small_idles_and_checkpoints() {
        let mut fx = fixture(10, 3);
        let entry = file_of(&fx, 40);
        // Nothing left after the 4-byte file tag
        fx.link.set_mtu(4);

        fx.session.handle(read(FileRef::Index(0), 0), Some(entry));
        assert!(!fx.session.step());
        assert!(!fx.session.step());
        assert_eq!(fx.session.heartbeat_count(), 2);
        assert_eq!(fx.session.state(), SessionState::Transferring);
        assert_eq!(fx.store.load_checkpoint().unwrap(), Checkpoint::default());

        assert!(!fx.session.step());
        assert_eq!(
            fx.store.load_checkpoint().unwrap(),
            Checkpoint {
                file_tag: entry.file_tag(),
                offset: 0,
                counter: entry.name.counter,
            }
        );
        assert!(fx.link.take_sent_on(Characteristic::Storage).is_empty());

        fx.link.set_mtu(247);
        run(&mut fx.session);
        assert_eq!(fx.store.load_checkpoint().unwrap().offset, 40);
    }

    #[test]
    fn test_execute_acknowledges_before_list() {
        let mut fx = fixture(440, 100);
        let a = file_of(&fx, 5);

        fx.session.execute(Command::ListFiles, None);
        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(sent.len(), 2);
        assert_eq!(&sent[0][..], &[ResultCode::Ok.as_u8()]);
        assert_eq!(decode_file_list(&sent[1]), Some(vec![(a.file_tag(), 5)]));
    }

    #[test]
    fn test_list_files() {
        let mut fx = fixture(440, 100);
        let a = file_of(&fx, 5);
        let b = file_of(&fx, 7);

        fx.session.handle(Command::ListFiles, None);
        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(
            decode_file_list(&sent[0]),
            Some(vec![(a.file_tag(), 5), (b.file_tag(), 7)])
        );
    }

    #[test]
    fn test_delete_notifies_and_rescans() {
        let mut fx = fixture(440, 100);
        let a = file_of(&fx, 5);
        file_of(&fx, 7);
        fx.session.refresh_catalog().unwrap();

        fx.session.handle(Command::DeleteFile { file: FileRef::Index(0) }, Some(a));
        let sent = fx.link.take_sent_on(Characteristic::Storage);
        assert_eq!(&sent[0][..], &[ResultCode::DeleteComplete.as_u8()]);
        assert_eq!(fx.session.catalog.len(), 1);
        assert_eq!(fx.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_delete_of_transferred_file_cancels() {
        let mut fx = fixture(10, 100);
        let a = file_of(&fx, 50);

        fx.session.handle(read(FileRef::Index(0), 0), Some(a));
        fx.session.step();
        fx.session.handle(Command::DeleteFile { file: FileRef::Index(0) }, Some(a));
        assert!(fx.session.transfer().is_none());
        assert_eq!(fx.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_nuke_twice() {
        let mut fx = fixture(440, 100);
        file_of(&fx, 5);
        file_of(&fx, 7);

        for _ in 0..2 {
            fx.session.handle(Command::Nuke, None);
            let chunks = fx.store.list_chunks().unwrap();
            assert_eq!(chunks.len(), 1);
            assert_eq!(chunks[0].size, 0);
            assert_eq!(fx.session.catalog.len(), 1);
        }
    }
}
