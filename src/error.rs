//! Error types
//!
//! A single error enum is shared by the coroutine runtime, the stream
//! registry and the connection layer. Slow-consumer overflow is deliberately
//! absent: it is a policy outcome reported through drop counters.

use crate::registry::StreamKey;

/// Error type for all core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Coroutine budget or OS thread/runtime allocation failed
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Stream already has an active publisher
    #[error("stream already has a publisher: {0}")]
    AlreadyPublishing(StreamKey),

    /// The calling coroutine was interrupted at a suspension point
    #[error("coroutine interrupted")]
    Interrupted,

    /// Peer closed or socket error
    #[error("disconnected: {0}")]
    Disconnected(#[from] std::io::Error),

    /// Operation on a resource that is closed, removed or already consumed
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A joined coroutine panicked
    #[error("coroutine panicked: {0}")]
    Panicked(String),
}

impl Error {
    /// Whether this error is a cooperative cancellation
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    /// Whether this error means the peer went away
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::Disconnected(_))
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = Error::AlreadyPublishing(StreamKey::new("live", "cam1"));
        assert_eq!(err.to_string(), "stream already has a publisher: live/cam1");
        assert_eq!(Error::Interrupted.to_string(), "coroutine interrupted");
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: Error = io.into();
        assert!(err.is_disconnected());
        assert!(!err.is_interrupted());
    }
}
