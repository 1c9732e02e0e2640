//! Wireless link: availability decision and live audio packetizer

pub mod evaluator;
pub mod peer;
pub mod pusher;

pub use evaluator::{LinkEvaluator, LinkState};
pub use peer::{Characteristic, NotifyError, SimulatedLink, WirelessLink};
pub use pusher::{PushStats, WirelessPusher};
