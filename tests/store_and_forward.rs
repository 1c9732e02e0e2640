//! Offline recording followed by retrieval, driven step by step on an
//! in-memory medium and a simulated link.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

use wearable_audio_transport::{
    audio::Frame,
    constants::COUNTER_FILE,
    link::{Characteristic, LinkEvaluator, SimulatedLink, WirelessPusher},
    protocol::{
        codes::{decode_file_list, parse_tagged_packet},
        CommandParser, ResultCode,
    },
    retrieval::{CatalogCache, RetrievalSession, SessionState},
    storage::{
        decode_chunk_frames, Checkpoint, ChunkRotationTimer, ChunkStore, ChunkedStorageWriter,
        Filesystem, FixedClock, MemFs,
    },
    transport::{Route, TransportContext},
};

const MTU: u16 = 185;
const SLICE_LEN: usize = 20;
const HEARTBEAT_CEILING: u32 = 4;
const ROTATION_TICKS: u32 = 40;

struct Device {
    clock: Arc<FixedClock>,
    timer: Arc<ChunkRotationTimer>,
    store: Arc<ChunkStore>,
    link: Arc<SimulatedLink>,
    parser: CommandParser,
    session: RetrievalSession,
    transport: TransportContext,
}

impl Device {
    fn boot(fs: &MemFs, staging_len: usize) -> Self {
        let clock = Arc::new(FixedClock::at(10, 0, 0));
        let timer = Arc::new(ChunkRotationTimer::new(ROTATION_TICKS));
        let store = Arc::new(ChunkStore::new(
            Box::new(fs.clone()),
            clock.clone(),
            timer.clone(),
        ));
        store.mount().unwrap();
        timer.set_boot_complete();

        let link = Arc::new(SimulatedLink::new());
        let catalog = CatalogCache::new();
        let parser = CommandParser::new(catalog.clone(), SLICE_LEN);
        let session = RetrievalSession::new(
            store.clone(),
            catalog,
            link.clone(),
            SLICE_LEN,
            HEARTBEAT_CEILING,
        );
        let writer = ChunkedStorageWriter::new(store.clone(), timer.clone(), staging_len);
        let transport = TransportContext::new(
            link.clone(),
            LinkEvaluator::new(100),
            WirelessPusher::new(3, Duration::ZERO),
            writer,
        );

        Self {
            clock,
            timer,
            store,
            link,
            parser,
            session,
            transport,
        }
    }

    fn record(&mut self, frames: &[Vec<u8>]) {
        for frame in frames {
            assert_eq!(
                self.transport.route(&Frame::new(frame.clone())),
                Route::Storage
            );
        }
    }

    fn connect_peer(&self) {
        self.link.connect(MTU);
        self.link.subscribe(Characteristic::Audio, true);
        self.link.subscribe(Characteristic::Storage, true);
    }

    /// Parse on the callback side, then execute on the worker side
    fn command(&mut self, bytes: &[u8]) -> ResultCode {
        match self.parser.parse(bytes) {
            Ok(parsed) => {
                self.session.handle(parsed.command, parsed.target);
                ResultCode::Ok
            }
            Err(e) => ResultCode::from(e),
        }
    }

    fn list(&mut self) -> Vec<(u32, u32)> {
        self.storage_packets();
        assert_eq!(self.command(&[0x10]), ResultCode::Ok);
        let packets = self.storage_packets();
        decode_file_list(packets.last().unwrap()).unwrap()
    }

    fn run_transfer(&mut self) -> usize {
        let mut steps = 0;
        while self.session.step() {
            steps += 1;
            assert!(steps < 10_000, "transfer never finished");
        }
        steps
    }

    fn storage_packets(&self) -> Vec<Bytes> {
        self.link.take_sent_on(Characteristic::Storage)
    }

    fn rotate_clock(&self, seconds: i64) {
        for _ in 0..ROTATION_TICKS {
            self.timer.tick();
        }
        self.clock.advance(chrono::Duration::seconds(seconds));
    }
}

fn frames(count: usize, len: impl Fn(usize) -> usize) -> Vec<Vec<u8>> {
    (0..count).map(|i| vec![i as u8; len(i)]).collect()
}

fn stored_size(frames: &[Vec<u8>]) -> u32 {
    frames.iter().map(|f| f.len() as u32 + 1).sum()
}

#[test]
fn test_offline_recording_retrieved_intact() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    let recorded = frames(25, |i| 20 + i % 30);
    device.record(&recorded);
    device.transport.flush();

    device.connect_peer();
    let files = device.list();
    assert_eq!(files.len(), 1);
    let (tag, size) = files[0];
    assert_eq!(tag, 10 * 3600);
    assert_eq!(size, stored_size(&recorded));

    assert_eq!(device.command(&[0x11, 0]), ResultCode::Ok);
    device.run_transfer();

    let packets = device.storage_packets();
    let (marker, data) = packets.split_last().unwrap();
    assert_eq!(marker[..], [ResultCode::TransferComplete.as_u8()]);

    let mut body = Vec::new();
    for packet in data {
        assert!(packet.len() <= MTU as usize);
        let (packet_tag, payload) = parse_tagged_packet(packet).unwrap();
        assert_eq!(packet_tag, tag);
        body.extend_from_slice(payload);
    }
    let decoded: Vec<Vec<u8>> = decode_chunk_frames(&body)
        .unwrap()
        .into_iter()
        .map(|f| f.to_vec())
        .collect();
    assert_eq!(decoded, recorded);

    let counter = device.store.list_chunks().unwrap()[0].name.counter;
    assert_eq!(
        device.store.load_checkpoint().unwrap(),
        Checkpoint {
            file_tag: tag,
            offset: size,
            counter,
        }
    );
}

#[test]
fn test_legacy_read_sends_bare_payload() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    let recorded = frames(3, |_| 30);
    device.record(&recorded);
    device.transport.flush();
    device.connect_peer();
    device.list();

    // Legacy file numbers are 1-based
    assert_eq!(device.command(&[0x00, 0]), ResultCode::FileIndexOutOfRange);
    assert_eq!(device.command(&[0x00, 1]), ResultCode::Ok);
    device.run_transfer();

    let packets = device.storage_packets();
    let (marker, data) = packets.split_last().unwrap();
    assert_eq!(marker[..], [ResultCode::TransferComplete.as_u8()]);
    let body: Vec<u8> = data.iter().flat_map(|p| p.iter().copied()).collect();
    assert_eq!(body.len() as u32, stored_size(&recorded));
    assert_eq!(decode_chunk_frames(&body).unwrap().len(), 3);
}

#[test]
fn test_rotation_and_reboot_keep_counters_increasing() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(3, |_| 40));
    device.rotate_clock(60);
    device.record(&frames(1, |_| 40));
    device.transport.flush();

    let chunks = device.store.list_chunks().unwrap();
    let counters: Vec<u32> = chunks.iter().map(|c| c.name.counter).collect();
    assert_eq!(counters, vec![1, 2]);
    // Staged records went to the old chunk before rotation
    assert_eq!(chunks[0].size, 3 * 41);
    assert_eq!(chunks[1].size, 41);
    assert_eq!(chunks[1].name.file_name(), "100100_00002.bin");
    drop(device);

    let mut device = Device::boot(&fs, 440);
    device.record(&frames(1, |_| 10));
    device.transport.flush();
    assert_eq!(device.store.active_chunk().unwrap().counter, 3);
    drop(device);

    // A lost counter file is rebuilt from the chunks on disk
    fs.clone().unlink(COUNTER_FILE).unwrap();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(1, |_| 10));
    device.transport.flush();
    assert_eq!(device.store.active_chunk().unwrap().counter, 4);
    assert_eq!(device.store.list_chunks().unwrap().len(), 4);
}

#[test]
fn test_out_of_range_read_leaves_transfer_untouched() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(5, |_| 39));
    device.transport.flush();
    device.connect_peer();
    device.list();

    assert_eq!(device.command(&[0x11, 0]), ResultCode::Ok);
    assert!(device.session.step());
    let before = *device.session.transfer().unwrap();
    assert_eq!(before.offset, SLICE_LEN as u32);

    assert_eq!(device.command(&[0x11, 5]), ResultCode::FileIndexOutOfRange);
    assert_eq!(device.command(&[0x12, 9]), ResultCode::FileIndexOutOfRange);
    assert_eq!(device.session.state(), SessionState::Transferring);
    assert_eq!(*device.session.transfer().unwrap(), before);
}

#[test]
fn test_offset_checks_against_file_size() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(1, |_| 49));
    device.transport.flush();
    device.connect_peer();
    assert_eq!(device.list(), vec![(10 * 3600, 50)]);

    assert_eq!(
        device.command(&[0x11, 0, 0, 0, 0, 100]),
        ResultCode::InvalidFileSize
    );
    assert_eq!(
        device.command(&[0x11, 0, 0, 0, 0, 50]),
        ResultCode::InvalidFileSize
    );
    assert_eq!(device.session.state(), SessionState::Idle);

    assert_eq!(device.command(&[0x11, 0, 0, 0, 0, 45]), ResultCode::Ok);
    device.run_transfer();
    let packets = device.storage_packets();
    assert_eq!(packets.len(), 2);
    assert_eq!(parse_tagged_packet(&packets[0]).unwrap().1.len(), 5);
}

#[test]
fn test_nuke_twice_leaves_one_empty_chunk() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(4, |_| 60));
    device.rotate_clock(60);
    device.record(&frames(4, |_| 60));
    device.transport.flush();
    device.connect_peer();
    assert_eq!(device.list().len(), 2);

    assert_eq!(device.command(&[0x02, 0]), ResultCode::Ok);
    let files = device.list();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].1, 0);
    let first = device.store.active_chunk().unwrap();

    assert_eq!(device.command(&[0x02, 0]), ResultCode::Ok);
    let files = device.list();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].1, 0);
    assert!(device.store.active_chunk().unwrap().counter > first.counter);

    // The fresh chunk has nothing to send yet
    assert_eq!(device.command(&[0x11, 0]), ResultCode::ZeroFileSize);
    assert_eq!(device.store.load_checkpoint().unwrap(), Checkpoint::default());

    // Recording carries on into the fresh chunk
    device.link.disconnect();
    device.record(&frames(2, |_| 10));
    device.transport.flush();
    assert_eq!(device.store.list_chunks().unwrap()[0].size, 22);
}

#[test]
fn test_missing_heartbeat_checkpoints_progress() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(10, |_| 29));
    device.transport.flush();
    device.connect_peer();
    device.list();

    assert_eq!(device.command(&[0x11, 0]), ResultCode::Ok);
    for _ in 0..HEARTBEAT_CEILING {
        assert!(device.session.step());
    }
    assert_eq!(device.store.load_checkpoint().unwrap().offset, 80);

    // A heartbeat restarts the count
    for _ in 0..2 {
        assert!(device.session.step());
    }
    assert_eq!(device.command(&[0x32, 0]), ResultCode::Ok);
    assert_eq!(device.session.heartbeat_count(), 0);
    for _ in 0..HEARTBEAT_CEILING - 1 {
        assert!(device.session.step());
    }
    assert_eq!(device.store.load_checkpoint().unwrap().offset, 80);
    assert!(device.session.step());
    assert_eq!(device.store.load_checkpoint().unwrap().offset, 200);
}

#[test]
fn test_peer_loss_checkpoints_and_resume_finishes() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(10, |_| 29));
    device.transport.flush();
    device.connect_peer();
    let (tag, size) = device.list()[0];

    assert_eq!(device.command(&[0x11, 0]), ResultCode::Ok);
    for _ in 0..3 {
        assert!(device.session.step());
    }
    device.link.disconnect();
    assert!(!device.session.step());
    let checkpoint = device.store.load_checkpoint().unwrap();
    let counter = device.store.list_chunks().unwrap()[0].name.counter;
    assert_eq!(
        checkpoint,
        Checkpoint {
            file_tag: tag,
            offset: 60,
            counter,
        }
    );

    device.connect_peer();
    device.list();
    let offset = checkpoint.offset.to_be_bytes();
    assert_eq!(
        device.command(&[0x11, 0, offset[0], offset[1], offset[2], offset[3]]),
        ResultCode::Ok
    );
    device.run_transfer();
    assert_eq!(device.store.load_checkpoint().unwrap().offset, size);
}

#[test]
fn test_three_frames_through_small_staging_buffer() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 200);
    let frame = vec![0xA5u8; 80];
    let mut sizes = Vec::new();
    for _ in 0..3 {
        device.record(&[frame.clone()]);
        let active = device.store.active_chunk().unwrap();
        sizes.push(device.store.chunk_size(&active).unwrap());
    }
    assert_eq!(sizes, vec![0, 0, 162]);

    device.transport.flush();
    let chunks = device.store.list_chunks().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].size, 243);
    let raw = fs.contents(&chunks[0].name.path()).unwrap();
    assert_eq!(raw[0], 80);
    assert_eq!(raw[81], 80);
    assert_eq!(raw[162], 80);
}

#[test]
fn test_nuke_discards_frames_staged_before_it() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    // Peer only listens for retrieval, so audio keeps going to storage
    device.link.connect(MTU);
    device.link.subscribe(Characteristic::Storage, true);
    device.record(&[vec![0xAA; 2], vec![0xAA; 2]]);

    assert_eq!(device.command(&[0x02, 0]), ResultCode::Ok);
    device.record(&[vec![0xBB; 2]]);
    device.transport.flush();

    let chunks = device.store.list_chunks().unwrap();
    assert_eq!(chunks.len(), 1);
    let raw = fs.contents(&chunks[0].name.path()).unwrap();
    assert_eq!(decode_chunk_frames(&raw).unwrap(), vec![&[0xBBu8, 0xBB][..]]);
    assert_eq!(device.transport.stats().storage.frames_discarded, 2);
}

#[test]
fn test_legacy_delete_removes_numbered_file() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(2, |_| 30));
    device.rotate_clock(60);
    device.record(&frames(1, |_| 30));
    device.transport.flush();
    device.connect_peer();
    let files = device.list();
    assert_eq!(files.len(), 2);

    assert_eq!(device.command(&[0x01, 0]), ResultCode::FileIndexOutOfRange);
    assert_eq!(device.command(&[0x01, 3]), ResultCode::FileIndexOutOfRange);
    assert_eq!(device.command(&[0x01, 1]), ResultCode::Ok);
    let packets = device.storage_packets();
    assert_eq!(packets.last().unwrap()[..], [ResultCode::DeleteComplete.as_u8()]);

    assert_eq!(device.list(), vec![files[1]]);
    assert_eq!(device.store.list_chunks().unwrap().len(), 1);
}

#[test]
fn test_legacy_stop_ends_transfer_with_checkpoint() {
    let fs = MemFs::new();
    let mut device = Device::boot(&fs, 440);
    device.record(&frames(10, |_| 29));
    device.transport.flush();
    device.connect_peer();
    let (tag, _) = device.list()[0];

    assert_eq!(device.command(&[0x00, 1]), ResultCode::Ok);
    for _ in 0..2 {
        assert!(device.session.step());
    }
    assert_eq!(device.command(&[0x03, 0]), ResultCode::Ok);
    assert!(device.session.transfer().is_none());
    assert_eq!(device.session.state(), SessionState::Idle);
    assert!(!device.session.step());

    // Two bare slices and no completion marker
    let packets = device.storage_packets();
    assert_eq!(packets.len(), 2);
    assert!(packets.iter().all(|p| p.len() == SLICE_LEN));
    let checkpoint = device.store.load_checkpoint().unwrap();
    assert_eq!((checkpoint.file_tag, checkpoint.offset), (tag, 40));
}
