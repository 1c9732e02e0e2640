//! Wireless stack collaborator
//!
//! The connection, attribute and subscription machinery lives in the
//! platform's wireless stack. The transport only needs the primitives
//! below.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;

/// Notification channels exposed to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Characteristic {
    /// Live audio packets
    Audio,
    /// Retrieval results, file lists and stored data
    Storage,
}

/// Failure reported by the notify primitive
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// Transmit buffers temporarily exhausted; worth retrying
    #[error("link busy")]
    Busy,
    #[error("notify failed: {0}")]
    Other(String),
}

/// Primitives consumed from the wireless stack for the current peer
pub trait WirelessLink: Send + Sync {
    /// A peer is connected
    fn is_connected(&self) -> bool;

    /// The peer enabled notifications on `characteristic`
    fn is_subscribed(&self, characteristic: Characteristic) -> bool;

    /// Negotiated ATT MTU, 0 when disconnected
    fn negotiated_mtu(&self) -> u16;

    /// Fire-and-forget notification
    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), NotifyError>;
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    audio_subscribed: bool,
    storage_subscribed: bool,
    mtu: u16,
    busy_budget: u32,
    fail_budget: u32,
    sent: VecDeque<(Characteristic, Bytes)>,
}

/// In-process link used by tests and the simulator.
///
/// Records every successful notification and can inject busy or hard
/// failures for the next N notify calls.
#[derive(Debug)]
pub struct SimulatedLink {
    state: Mutex<SimState>,
}

impl SimulatedLink {
    /// Disconnected link
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                connected: false,
                audio_subscribed: false,
                storage_subscribed: false,
                mtu: 0,
                busy_budget: 0,
                fail_budget: 0,
                sent: VecDeque::new(),
            }),
        }
    }

    /// Connected, subscribed to both channels, with the given MTU
    pub fn connected(mtu: u16) -> Self {
        let link = Self::new();
        link.connect(mtu);
        link.subscribe(Characteristic::Audio, true);
        link.subscribe(Characteristic::Storage, true);
        link
    }

    pub fn connect(&self, mtu: u16) {
        let mut state = self.state.lock();
        state.connected = true;
        state.mtu = mtu;
    }

    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.audio_subscribed = false;
        state.storage_subscribed = false;
        state.mtu = 0;
    }

    pub fn subscribe(&self, characteristic: Characteristic, enabled: bool) {
        let mut state = self.state.lock();
        match characteristic {
            Characteristic::Audio => state.audio_subscribed = enabled,
            Characteristic::Storage => state.storage_subscribed = enabled,
        }
    }

    pub fn set_mtu(&self, mtu: u16) {
        self.state.lock().mtu = mtu;
    }

    /// Next `count` notify calls report [`NotifyError::Busy`]
    pub fn inject_busy(&self, count: u32) {
        self.state.lock().busy_budget = count;
    }

    /// Next `count` notify calls fail hard
    pub fn inject_failure(&self, count: u32) {
        self.state.lock().fail_budget = count;
    }

    /// Remove and return all recorded notifications
    pub fn take_sent(&self) -> Vec<(Characteristic, Bytes)> {
        self.state.lock().sent.drain(..).collect()
    }

    /// Remove and return recorded notifications on one channel
    pub fn take_sent_on(&self, characteristic: Characteristic) -> Vec<Bytes> {
        let mut state = self.state.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = state
            .sent
            .drain(..)
            .partition(|(c, _)| *c == characteristic);
        state.sent = rest.into_iter().collect();
        matching.into_iter().map(|(_, data)| data).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl WirelessLink for SimulatedLink {
    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn is_subscribed(&self, characteristic: Characteristic) -> bool {
        let state = self.state.lock();
        state.connected
            && match characteristic {
                Characteristic::Audio => state.audio_subscribed,
                Characteristic::Storage => state.storage_subscribed,
            }
    }

    fn negotiated_mtu(&self) -> u16 {
        let state = self.state.lock();
        if state.connected {
            state.mtu
        } else {
            0
        }
    }

    fn notify(&self, characteristic: Characteristic, data: &[u8]) -> Result<(), NotifyError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(NotifyError::Other("not connected".into()));
        }
        if state.busy_budget > 0 {
            state.busy_budget -= 1;
            return Err(NotifyError::Busy);
        }
        if state.fail_budget > 0 {
            state.fail_budget -= 1;
            return Err(NotifyError::Other("injected failure".into()));
        }
        state
            .sent
            .push_back((characteristic, Bytes::copy_from_slice(data)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulated_link_records() {
        let link = SimulatedLink::connected(185);
        link.notify(Characteristic::Audio, b"abc").unwrap();
        link.notify(Characteristic::Storage, &[0]).unwrap();

        assert_eq!(link.take_sent_on(Characteristic::Storage), vec![Bytes::from_static(&[0])]);
        assert_eq!(link.sent_count(), 1);
    }

    #[test]
    fn test_injected_errors() {
        let link = SimulatedLink::connected(185);
        link.inject_busy(1);
        link.inject_failure(1);
        assert_eq!(link.notify(Characteristic::Audio, b"x"), Err(NotifyError::Busy));
        assert!(matches!(
            link.notify(Characteristic::Audio, b"x"),
            Err(NotifyError::Other(_))
        ));
        assert!(link.notify(Characteristic::Audio, b"x").is_ok());
    }

    #[test]
    fn test_disconnect_clears_subscription() {
        let link = SimulatedLink::connected(185);
        link.disconnect();
        assert!(!link.is_subscribed(Characteristic::Audio));
        assert_eq!(link.negotiated_mtu(), 0);
        link.connect(185);
        assert!(!link.is_subscribed(Characteristic::Audio));
    }
}
