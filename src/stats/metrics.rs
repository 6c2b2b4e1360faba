//! Statistics snapshots for streams, consumers and the server

use std::time::Duration;

use crate::registry::StreamState;

/// Stream-level statistics
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Stream key
    pub stream_key: String,
    /// Publish state
    pub state: StreamState,
    /// Session id of the active publisher
    pub publisher_id: Option<u64>,
    /// Attached consumers
    pub consumers: usize,
    /// Messages published in the current session
    pub messages: u64,
    /// Payload bytes published in the current session
    pub bytes_received: u64,
    /// Video frames received
    pub video_frames: u64,
    /// Audio frames received
    pub audio_frames: u64,
    /// Keyframes received
    pub keyframes: u64,
    /// Last published timestamp
    pub last_timestamp_ms: i64,
    /// Messages dropped across attached consumers
    pub consumer_drops: u64,
    /// Frames held by the GOP cache
    pub gop_frames: usize,
    /// Payload bytes held by the GOP cache
    pub gop_bytes: usize,
    /// Time since publish started (zero when idle)
    pub publish_duration: Duration,
    /// Time since the source was created
    pub age: Duration,
}

impl StreamStats {
    /// Calculate bitrate in bits per second
    pub fn bitrate(&self) -> u64 {
        let secs = self.publish_duration.as_secs();
        if secs > 0 {
            (self.bytes_received * 8) / secs
        } else {
            0
        }
    }

    /// Calculate video framerate
    pub fn calculated_framerate(&self) -> f64 {
        let secs = self.publish_duration.as_secs_f64();
        if secs > 0.0 {
            self.video_frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Consumer-level statistics
#[derive(Debug, Clone)]
pub struct ConsumerStats {
    /// Consumer id
    pub id: u64,
    /// Queued messages
    pub queue_len: usize,
    /// Timestamp span of queued audio/video
    pub queue_duration: Duration,
    /// Messages dropped by overflow or keyframe resync
    pub dropped: u64,
    /// Messages handed to the subscriber
    pub delivered: u64,
    /// Last jitter-corrected timestamp
    pub jitter_time_ms: i64,
    /// Delivery paused
    pub paused: bool,
    /// Source unpublished
    pub closed: bool,
    /// Time since the consumer was created
    pub age: Duration,
}

/// Server-wide statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    /// Total connections ever accepted
    pub total_connections: u64,
    /// Current active connections
    pub active_connections: u64,
    /// Connections rejected by the connection limit
    pub rejected_connections: u64,
    /// Connections removed but not yet reclaimed
    pub pending_disposal: u64,
    /// Live sources in the registry; only filled in by `Server::full_stats`
    pub active_streams: Option<u64>,
    /// Live coroutines on the server's scheduler
    pub coroutines: u64,
    /// Uptime
    pub uptime: Duration,
}

impl ServerStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_stats(bytes: u64, frames: u64, duration: Duration) -> StreamStats {
        StreamStats {
            stream_key: "live/test".to_string(),
            state: StreamState::Active,
            publisher_id: Some(1),
            consumers: 0,
            messages: frames,
            bytes_received: bytes,
            video_frames: frames,
            audio_frames: 0,
            keyframes: 0,
            last_timestamp_ms: 0,
            consumer_drops: 0,
            gop_frames: 0,
            gop_bytes: 0,
            publish_duration: duration,
            age: duration,
        }
    }

    #[test]
    fn test_stream_bitrate() {
        let stats = stream_stats(1_000_000, 0, Duration::from_secs(10));

        // 1,000,000 bytes * 8 bits / 10 seconds = 800,000 bps
        assert_eq!(stats.bitrate(), 800_000);
    }

    #[test]
    fn test_stream_bitrate_zero_duration() {
        let stats = stream_stats(1_000_000, 0, Duration::ZERO);

        assert_eq!(stats.bitrate(), 0);
    }

    #[test]
    fn test_stream_framerate() {
        let stats = stream_stats(0, 300, Duration::from_secs(10));
        assert_eq!(stats.calculated_framerate(), 30.0);

        let idle = stream_stats(0, 300, Duration::ZERO);
        assert_eq!(idle.calculated_framerate(), 0.0);
    }

    #[test]
    fn test_server_stats_new() {
        let stats = ServerStats::new();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.rejected_connections, 0);
        assert_eq!(stats.active_streams, None);
    }
}
