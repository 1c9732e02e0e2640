//! Audio frame buffering between the codec and the transport

pub mod queue;

pub use queue::{Frame, FrameConsumer, FrameProducer, FrameQueue, QueueSlot, QueueStats};
