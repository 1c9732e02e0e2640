//! Device Simulator
//!
//! Runs the full store-and-forward pipeline on the host: a synthetic codec
//! produces a frame every 10 ms, the wireless link drops and comes back
//! periodically, offline audio goes to chunk files under the configured
//! storage root, and a scripted peer pulls stored chunks back on every
//! reconnect.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wearable_audio_transport::{
    config::AppConfig,
    link::{Characteristic, SimulatedLink, WirelessLink},
    protocol::{
        codes::{decode_file_list, parse_tagged_packet},
        command::{OP_DELETE_FILE, OP_HEARTBEAT, OP_LIST_FILES, OP_READ_FILE},
        ResultCode,
    },
    recorder::Recorder,
    storage::{HostFs, SystemClock},
};

/// Synthetic codec cadence
const FRAME_INTERVAL: Duration = Duration::from_millis(10);
/// Synthetic encoded frame size
const FRAME_LEN: usize = 80;
/// Seconds between link state changes
const LINK_TOGGLE_SECS: u64 = 15;
/// Negotiated MTU while connected
const SIM_MTU: u16 = 247;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting wearable device simulator");

    let config = match std::env::args().nth(1) {
        Some(path) => AppConfig::load(&PathBuf::from(path))?,
        None => AppConfig::load_or_default()?,
    };

    let fs = HostFs::new(&config.storage.root)
        .with_context(|| format!("opening storage root {}", config.storage.root.display()))?;
    tracing::info!("Storage root: {}", config.storage.root.display());

    let link = Arc::new(SimulatedLink::new());
    let recorder = Arc::new(Recorder::start(
        config,
        link.clone(),
        Box::new(fs),
        Arc::new(SystemClock),
    )?);

    // Synthetic codec on its own thread, as the codec completion path would be
    let running = Arc::new(AtomicBool::new(true));
    let codec = {
        let recorder = recorder.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("codec-sim".into())
            .spawn(move || {
                let mut sequence: u32 = 0;
                let mut next = Instant::now();
                while running.load(Ordering::Relaxed) {
                    let mut frame = [0u8; FRAME_LEN];
                    frame[..4].copy_from_slice(&sequence.to_le_bytes());
                    if !recorder.submit_frame(&frame) {
                        break;
                    }
                    sequence = sequence.wrapping_add(1);
                    next += FRAME_INTERVAL;
                    if let Some(wait) = next.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                }
                tracing::info!("Codec stopped after {} frames", sequence);
            })?
    };

    recorder.set_boot_complete();

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut seconds: u64 = 0;
    let mut audio_packets: u64 = 0;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    tracing::info!("Simulation running - press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {
                seconds += 1;
                audio_packets += link.take_sent_on(Characteristic::Audio).len() as u64;

                if seconds % LINK_TOGGLE_SECS == 0 {
                    if link.is_connected() {
                        tracing::info!("Peer walked away");
                        link.disconnect();
                    } else {
                        tracing::info!("Peer connected (MTU {})", SIM_MTU);
                        link.connect(SIM_MTU);
                        link.subscribe(Characteristic::Audio, true);
                        link.subscribe(Characteristic::Storage, true);
                        if let Err(e) = pull_oldest_chunk(&recorder, &link).await {
                            tracing::warn!("Retrieval client failed: {}", e);
                        }
                    }
                }

                if seconds % 5 == 0 {
                    let stats = recorder.stats();
                    tracing::info!(
                        "Stats: queue {}/{} ({} full events), {} live / {} stored / {} dropped frames, {} audio packets, {:.1} KB to storage",
                        stats.queue.len,
                        stats.queue.capacity,
                        stats.queue.full_events,
                        stats.transport.frames_to_link,
                        stats.transport.frames_to_storage,
                        stats.transport.frames_dropped,
                        audio_packets,
                        stats.transport.storage.bytes_flushed as f64 / 1024.0
                    );
                }
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    if codec.join().is_err() {
        tracing::error!("Codec thread panicked");
    }
    // Last reference: dropping the recorder stops its threads and flushes storage
    drop(recorder);
    Ok(())
}

/// Scripted peer: list, pull the oldest closed chunk, then delete it
async fn pull_oldest_chunk(recorder: &Recorder, link: &SimulatedLink) -> Result<()> {
    link.take_sent_on(Characteristic::Storage);

    let code = recorder.on_command(&[OP_LIST_FILES]);
    anyhow::ensure!(code == ResultCode::Ok, "list refused: {:?}", code);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let packets = link.take_sent_on(Characteristic::Storage);
    let list = packets
        .iter()
        .rev()
        .find_map(|p| decode_file_list(p).filter(|_| p.len() > 1))
        .unwrap_or_default();
    tracing::info!("Peer sees {} stored chunks", list.len());

    // The newest chunk is still being written
    if list.len() < 2 {
        return Ok(());
    }
    let (tag, size) = list[0];

    let code = recorder.on_command(&[OP_READ_FILE, 0]);
    anyhow::ensure!(code == ResultCode::Ok, "read refused: {:?}", code);

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut received = 0usize;
    let mut complete = false;
    while !complete && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
        recorder.on_command(&[OP_HEARTBEAT, 0]);
        for packet in link.take_sent_on(Characteristic::Storage) {
            if packet[..] == [ResultCode::TransferComplete.as_u8()] {
                complete = true;
            } else if let Some((packet_tag, body)) = parse_tagged_packet(&packet) {
                if packet_tag == tag {
                    received += body.len();
                }
            }
        }
    }
    anyhow::ensure!(complete, "transfer of chunk {} timed out", tag);
    tracing::info!("Pulled chunk {} ({} of {} bytes)", tag, received, size);

    let code = recorder.on_command(&[OP_DELETE_FILE, 0]);
    anyhow::ensure!(code == ResultCode::Ok, "delete refused: {:?}", code);
    Ok(())
}
