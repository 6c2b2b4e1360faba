//! Media messages and caching
//!
//! This module provides:
//! - Reference-counted media messages
//! - FLV tag body classification (keyframes, sequence headers)
//! - Per-consumer timestamp jitter correction
//! - GOP caching for late-joiner support

pub mod flv;
pub mod gop;
pub mod jitter;
pub mod message;

pub use gop::GopCache;
pub use jitter::{Jitter, JitterAlgorithm};
pub use message::{MessageKind, SharedMessage, MICROS_PER_MILLI};
