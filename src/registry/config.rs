//! Registry and per-stream configuration

use std::time::Duration;

use crate::media::jitter::JitterAlgorithm;

/// Per-stream delivery settings
///
/// Read once when a source is created and again on every publish; a reloaded
/// config takes effect on the next publish.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Per-consumer queue length limit (0 = unlimited)
    pub queue_max_length: usize,

    /// Per-consumer queue duration limit (zero = unlimited)
    pub queue_max_duration: Duration,

    /// Cache the latest GOP for late joiners
    pub gop_cache: bool,

    /// Clear the GOP cache when it holds more frames than this (0 = unlimited)
    pub gop_cache_max_frames: usize,

    /// Timestamp correction applied per consumer
    pub jitter: JitterAlgorithm,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            queue_max_length: 0,
            queue_max_duration: Duration::from_secs(30),
            gop_cache: true,
            gop_cache_max_frames: 2500,
            jitter: JitterAlgorithm::Full,
        }
    }
}

impl StreamConfig {
    /// Set the queue length limit
    pub fn queue_max_length(mut self, max: usize) -> Self {
        self.queue_max_length = max;
        self
    }

    /// Set the queue duration limit
    pub fn queue_max_duration(mut self, max: Duration) -> Self {
        self.queue_max_duration = max;
        self
    }

    /// Enable or disable the GOP cache
    pub fn gop_cache(mut self, enabled: bool) -> Self {
        self.gop_cache = enabled;
        self
    }

    /// Set the GOP cache frame limit
    pub fn gop_cache_max_frames(mut self, max: usize) -> Self {
        self.gop_cache_max_frames = max;
        self
    }

    /// Set the jitter algorithm
    pub fn jitter(mut self, algorithm: JitterAlgorithm) -> Self {
        self.jitter = algorithm;
        self
    }
}

/// Configuration for the stream registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// How often the cleanup coroutine runs
    pub cleanup_interval: Duration,

    /// Remove sources without publisher or consumers after this long
    pub idle_stream_timeout: Duration,

    /// Settings for newly created sources
    pub stream: StreamConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(30),
            idle_stream_timeout: Duration::from_secs(60),
            stream: StreamConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Set the cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Set the idle stream timeout
    pub fn idle_stream_timeout(mut self, timeout: Duration) -> Self {
        self.idle_stream_timeout = timeout;
        self
    }

    /// Set the default stream settings
    pub fn stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }
}

/// Receives configuration changes
pub trait Reloadable {
    /// Apply a new stream config at the next safe point
    fn on_reload(&self, config: &StreamConfig);
}
