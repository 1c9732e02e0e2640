//! Per-cycle decision whether live audio can go over the air

use crate::link::peer::{Characteristic, WirelessLink};

/// Why the link is or is not usable this cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    NotSubscribed,
    MtuTooSmall(u16),
    Usable { mtu: u16 },
}

impl LinkState {
    pub fn is_usable(&self) -> bool {
        matches!(self, LinkState::Usable { .. })
    }
}

/// Stateless query against the wireless stack.
///
/// Nothing is cached between calls: connection and subscription can change
/// at any time from the stack's own context.
#[derive(Debug, Clone)]
pub struct LinkEvaluator {
    min_mtu: u16,
}

impl LinkEvaluator {
    pub fn new(min_mtu: u16) -> Self {
        Self { min_mtu }
    }

    pub fn evaluate(&self, link: &dyn WirelessLink) -> LinkState {
        if !link.is_connected() {
            return LinkState::Disconnected;
        }
        if !link.is_subscribed(Characteristic::Audio) {
            return LinkState::NotSubscribed;
        }
        let mtu = link.negotiated_mtu();
        if mtu < self.min_mtu {
            return LinkState::MtuTooSmall(mtu);
        }
        LinkState::Usable { mtu }
    }

    pub fn is_link_usable(&self, link: &dyn WirelessLink) -> bool {
        self.evaluate(link).is_usable()
    }

    pub fn min_mtu(&self) -> u16 {
        self.min_mtu
    }
}
