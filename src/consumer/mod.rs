//! Per-subscriber delivery
//!
//! This module provides:
//! - A bounded message queue with slow-consumer drop and keyframe resync
//! - The consumer handle a subscriber coroutine waits on and drains

pub mod queue;
pub mod subscriber;

pub use queue::MessageQueue;
pub use subscriber::{Consumer, ConsumerWait, PULSE};

pub(crate) use subscriber::ConsumerShared;
