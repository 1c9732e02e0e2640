//! Fragments frames into audio notifications
//!
//! Packet format: `[packet_id:2 LE][fragment_index:1][payload]`. The packet
//! id increments for every packet and wraps at 16 bits; the fragment index
//! restarts at zero for each frame.

use std::thread;
use std::time::Duration;

use crate::audio::queue::Frame;
use crate::constants::AUDIO_PACKET_HEADER_LEN;
use crate::error::LinkError;
use crate::link::peer::{Characteristic, NotifyError, WirelessLink};

/// Consumer-side packetizer with bounded retry
pub struct WirelessPusher {
    next_packet_id: u16,
    max_attempts: u32,
    retry_pause: Duration,
    /// Reused packet buffer
    packet: Vec<u8>,
    frames_sent: u64,
    frames_dropped: u64,
    packets_sent: u64,
    busy_retries: u64,
    bytes_sent: u64,
}

impl WirelessPusher {
    pub fn new(max_attempts: u32, retry_pause: Duration) -> Self {
        Self {
            next_packet_id: 0,
            max_attempts: max_attempts.max(1),
            retry_pause,
            packet: Vec::with_capacity(512),
            frames_sent: 0,
            frames_dropped: 0,
            packets_sent: 0,
            busy_retries: 0,
            bytes_sent: 0,
        }
    }

    /// Send one frame as one or more packets of at most `mtu` bytes.
    ///
    /// Returns the number of packets sent. On failure the rest of the frame
    /// is abandoned; the frame is never requeued.
    pub fn push(&mut self, link: &dyn WirelessLink, mtu: u16, frame: &Frame) -> Result<usize, LinkError> {
        let max_payload = (mtu as usize).saturating_sub(AUDIO_PACKET_HEADER_LEN);
        if max_payload == 0 {
            self.frames_dropped += 1;
            return Err(LinkError::Unusable);
        }

        let mut sent = 0usize;
        for (index, fragment) in frame.payload().chunks(max_payload).enumerate() {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.wrapping_add(1);

            self.packet.clear();
            self.packet.extend_from_slice(&id.to_le_bytes());
            self.packet.push(index as u8);
            self.packet.extend_from_slice(fragment);

            if let Err(e) = self.send_packet(link) {
                self.frames_dropped += 1;
                match &e {
                    LinkError::Congested { attempts } => {
                        tracing::debug!(
                            "Dropping frame: packet {} still busy after {} attempts",
                            id,
                            attempts
                        );
                    }
                    other => tracing::warn!("Dropping frame: packet {} failed: {}", id, other),
                }
                return Err(e);
            }
            sent += 1;
        }

        self.frames_sent += 1;
        Ok(sent)
    }

    fn send_packet(&mut self, link: &dyn WirelessLink) -> Result<(), LinkError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match link.notify(Characteristic::Audio, &self.packet) {
                Ok(()) => {
                    self.packets_sent += 1;
                    self.bytes_sent += self.packet.len() as u64;
                    return Ok(());
                }
                Err(NotifyError::Busy) if attempts < self.max_attempts => {
                    self.busy_retries += 1;
                    if !self.retry_pause.is_zero() {
                        thread::sleep(self.retry_pause);
                    }
                }
                Err(NotifyError::Busy) => return Err(LinkError::Congested { attempts }),
                Err(NotifyError::Other(msg)) => return Err(LinkError::NotifyFailed(msg)),
            }
        }
    }

    pub fn next_packet_id(&self) -> u16 {
        self.next_packet_id
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            frames_sent: self.frames_sent,
            frames_dropped: self.frames_dropped,
            packets_sent: self.packets_sent,
            busy_retries: self.busy_retries,
            bytes_sent: self.bytes_sent,
        }
    }
}

/// Pusher statistics
#[derive(Debug, Clone, Default)]
pub struct PushStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub packets_sent: u64,
    pub busy_retries: u64,
    pub bytes_sent: u64,
}

/// Split a received audio packet into `(packet_id, fragment_index, payload)`
pub fn parse_audio_packet(packet: &[u8]) -> Option<(u16, u8, &[u8])> {
    if packet.len() < AUDIO_PACKET_HEADER_LEN {
        return None;
    }
    let id = u16::from_le_bytes([packet[0], packet[1]]);
    Some((id, packet[2], &packet[AUDIO_PACKET_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::peer::SimulatedLink;

    fn pusher() -> WirelessPusher {
        WirelessPusher::new(3, Duration::ZERO)
    }

    #[test]
    fn test_fragments_to_mtu() {
        let link = SimulatedLink::connected(23);
        let mut pusher = pusher();
        let payload: Vec<u8> = (0..50).collect();

        let packets = pusher.push(&link, 23, &Frame::new(payload.clone())).unwrap();
        assert_eq!(packets, 3);

        let sent = link.take_sent_on(Characteristic::Audio);
        let mut rebuilt = Vec::new();
        for (i, packet) in sent.iter().enumerate() {
            assert!(packet.len() <= 23);
            let (id, index, body) = parse_audio_packet(packet).unwrap();
            assert_eq!(id, i as u16);
            assert_eq!(index, i as u8);
            rebuilt.extend_from_slice(body);
        }
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn test_packet_id_wraps() {
        let link = SimulatedLink::connected(185);
        let mut pusher = pusher();
        pusher.next_packet_id = u16::MAX;

        pusher.push(&link, 185, &Frame::new(vec![1u8; 10])).unwrap();
        pusher.push(&link, 185, &Frame::new(vec![2u8; 10])).unwrap();

        let ids: Vec<u16> = link
            .take_sent_on(Characteristic::Audio)
            .iter()
            .map(|p| parse_audio_packet(p).unwrap().0)
            .collect();
        assert_eq!(ids, vec![u16::MAX, 0]);
    }

    #[test]
    fn test_busy_is_retried() {
        let link = SimulatedLink::connected(185);
        let mut pusher = pusher();
        link.inject_busy(2);

        assert_eq!(pusher.push(&link, 185, &Frame::new(vec![0u8; 10])).unwrap(), 1);
        let stats = pusher.stats();
        assert_eq!(stats.busy_retries, 2);
        assert_eq!(stats.frames_sent, 1);
    }

    #[test]
    fn test_congestion_drops_frame() {
        let link = SimulatedLink::connected(23);
        let mut pusher = pusher();
        link.inject_busy(3);

        let result = pusher.push(&link, 23, &Frame::new(vec![0u8; 40]));
        assert_eq!(result, Err(LinkError::Congested { attempts: 3 }));
        // Remaining fragments are abandoned
        assert_eq!(link.sent_count(), 0);
        assert_eq!(pusher.stats().frames_dropped, 1);
    }

    #[test]
    fn test_hard_failure_not_retried() {
        let link = SimulatedLink::connected(185);
        let mut pusher = pusher();
        link.inject_failure(1);

        assert!(matches!(
            pusher.push(&link, 185, &Frame::new(vec![0u8; 10])),
            Err(LinkError::NotifyFailed(_))
        ));
        assert_eq!(pusher.stats().busy_retries, 0);
        // Next frame goes through
        assert!(pusher.push(&link, 185, &Frame::new(vec![0u8; 10])).is_ok());
    }
}
