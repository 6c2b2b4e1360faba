//! Bounded per-consumer message queue
//!
//! Each consumer owns one queue, so overflow decisions never affect the
//! publisher or any other consumer. Enqueue never blocks: when the queue is
//! over its length or duration limit the oldest messages are dropped.
//!
//! Two things keep a trimmed queue decodable:
//! - Metadata and sequence headers trimmed from the front are retained and
//!   re-emitted, rebased to the new front timestamp, at the head of the next
//!   drain.
//! - On a stream carrying video, any drop discards messages up to the next
//!   keyframe. If none is queued, inter frames are rejected until one
//!   arrives.

use std::collections::VecDeque;
use std::time::Duration;

use crate::media::message::{MessageKind, SharedMessage, MICROS_PER_MILLI};

/// Ordered, bounded buffer of shared messages
#[derive(Debug, Default)]
pub struct MessageQueue {
    msgs: VecDeque<SharedMessage>,
    /// Maximum number of messages (0 = unlimited)
    max_length: usize,
    /// Maximum timestamp span in microseconds (0 = unlimited)
    max_duration: i64,
    /// Trimmed metadata awaiting re-emission
    metadata: Option<SharedMessage>,
    /// Trimmed video sequence header awaiting re-emission
    video_header: Option<SharedMessage>,
    /// Trimmed audio sequence header awaiting re-emission
    audio_header: Option<SharedMessage>,
    /// Drop everything but headers, data and keyframes until a keyframe
    awaiting_keyframe: bool,
    /// Whether video has passed through this queue
    has_video: bool,
    /// Last audio/video timestamp accepted
    last_timestamp: Option<i64>,
    /// Messages dropped over the queue's lifetime
    dropped: u64,
}

impl MessageQueue {
    /// Create an unbounded queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue with length and duration limits (zero = unlimited)
    pub fn with_limits(max_length: usize, max_duration: Duration) -> Self {
        let mut queue = Self::new();
        queue.set_max_length(max_length);
        queue.set_max_duration(max_duration);
        queue
    }

    pub fn set_max_length(&mut self, max_length: usize) {
        self.max_length = max_length;
    }

    pub fn set_max_duration(&mut self, max_duration: Duration) {
        self.max_duration = i64::try_from(max_duration.as_micros()).unwrap_or(i64::MAX);
    }

    /// Reject inter frames until the next keyframe
    pub fn await_keyframe(&mut self) {
        self.awaiting_keyframe = true;
        self.has_video = true;
    }

    pub fn is_awaiting_keyframe(&self) -> bool {
        self.awaiting_keyframe
    }

    /// Append a message, then trim to the limits
    ///
    /// Returns the number of messages dropped by this call.
    pub fn enqueue(&mut self, msg: SharedMessage) -> usize {
        if msg.is_video() {
            self.has_video = true;
        }

        if self.awaiting_keyframe {
            if msg.is_keyframe() {
                self.awaiting_keyframe = false;
            } else if msg.is_av() && !msg.is_sequence_header() {
                self.dropped += 1;
                return 1;
            }
        }

        // A fresh header supersedes any retained one
        if msg.is_data() {
            self.metadata = None;
        } else if msg.is_sequence_header() {
            match msg.kind() {
                MessageKind::Video => self.video_header = None,
                _ => self.audio_header = None,
            }
        }

        if msg.is_av() {
            if let Some(last) = self.last_timestamp {
                if msg.timestamp() < last {
                    tracing::warn!(
                        last_ms = last / MICROS_PER_MILLI,
                        timestamp_ms = msg.timestamp_millis(),
                        "Out-of-order timestamp enqueued"
                    );
                }
            }
            self.last_timestamp = Some(msg.timestamp());
        }

        self.msgs.push_back(msg);
        self.shrink()
    }

    fn over_limit(&self) -> bool {
        (self.max_length > 0 && self.msgs.len() > self.max_length)
            || (self.max_duration > 0 && self.duration() > self.max_duration)
    }

    fn shrink(&mut self) -> usize {
        let mut dropped = 0;

        while self.over_limit() {
            let Some(msg) = self.msgs.pop_front() else {
                break;
            };
            self.retain_header(msg);
            dropped += 1;
        }

        if dropped > 0 && self.has_video {
            dropped += self.resync();
        }

        self.dropped += dropped as u64;
        dropped
    }

    /// Discard up to the first queued keyframe
    fn resync(&mut self) -> usize {
        let mut dropped = 0;

        while let Some(front) = self.msgs.front() {
            if front.is_keyframe() {
                return dropped;
            }
            if let Some(msg) = self.msgs.pop_front() {
                self.retain_header(msg);
                dropped += 1;
            }
        }

        self.awaiting_keyframe = true;
        dropped
    }

    fn retain_header(&mut self, msg: SharedMessage) {
        if msg.is_data() {
            self.metadata = Some(msg);
            return;
        }
        if !msg.is_sequence_header() {
            return;
        }

        match msg.kind() {
            MessageKind::Video => self.video_header = Some(msg),
            _ => self.audio_header = Some(msg),
        }
    }

    /// Drain up to `max` messages, oldest first (0 = all)
    ///
    /// Retained metadata and sequence headers come first and do not count
    /// toward `max`.
    pub fn dump_packets(&mut self, max: usize) -> Vec<SharedMessage> {
        let count = if max == 0 {
            self.msgs.len()
        } else {
            max.min(self.msgs.len())
        };

        let mut result = Vec::with_capacity(count + 3);

        let retained = [
            self.metadata.take(),
            self.video_header.take(),
            self.audio_header.take(),
        ];
        if retained.iter().any(Option::is_some) {
            let base = self.msgs.front().map(|m| m.timestamp());
            for header in retained.into_iter().flatten() {
                let rebased = match base {
                    Some(ts) => header.with_timestamp(ts),
                    None => header,
                };
                result.push(rebased);
            }
        }

        result.extend(self.msgs.drain(..count));
        result
    }

    /// Timestamp span of queued audio/video, in microseconds
    pub fn duration(&self) -> i64 {
        let first = self.msgs.iter().find(|m| m.is_av());
        let last = self.msgs.iter().rev().find(|m| m.is_av());

        match (first, last) {
            (Some(first), Some(last)) => (last.timestamp() - first.timestamp()).max(0),
            _ => 0,
        }
    }

    /// Number of queued messages, excluding retained headers
    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }

    /// Messages dropped over the queue's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Release every queued and retained message
    pub fn clear(&mut self) {
        self.msgs.clear();
        self.metadata = None;
        self.video_header = None;
        self.audio_header = None;
    }
}
