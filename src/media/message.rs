//! Shared media messages
//!
//! A [`SharedMessage`] is one timestamped audio, video or data unit. Cloning
//! only bumps a reference count; the payload is freed when the last holder
//! (publisher path, GOP cache, consumer queues) drops it.
//!
//! Messages are immutable once built. Anything that needs a different
//! timestamp (jitter correction, header rebasing) gets a new header that
//! shares the same payload via [`SharedMessage::with_timestamp`].

use std::sync::Arc;

use bytes::Bytes;

use super::flv;

/// Microseconds per millisecond
pub const MICROS_PER_MILLI: i64 = 1_000;

/// Type of media message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Audio frame or audio sequence header
    Audio,
    /// Video frame or video sequence header
    Video,
    /// Script data (onMetaData)
    Data,
}

#[derive(Debug)]
struct MessageInner {
    kind: MessageKind,
    /// Monotonic timestamp in microseconds
    timestamp: i64,
    stream_id: u32,
    payload: Bytes,
    keyframe: bool,
    sequence_header: bool,
}

/// Reference-counted, immutable media message
#[derive(Debug, Clone)]
pub struct SharedMessage {
    inner: Arc<MessageInner>,
}

impl SharedMessage {
    /// Wrap a demuxed FLV tag body, classifying keyframes and sequence headers
    pub fn new(stream_id: u32, kind: MessageKind, timestamp: i64, payload: Bytes) -> Self {
        let (keyframe, sequence_header) = match kind {
            MessageKind::Video => (
                flv::is_video_keyframe(&payload),
                flv::is_video_sequence_header(&payload),
            ),
            MessageKind::Audio => (false, flv::is_audio_sequence_header(&payload)),
            MessageKind::Data => (false, false),
        };

        Self::build(stream_id, kind, timestamp, payload, keyframe, sequence_header)
    }

    /// Create a video message with explicit flags
    pub fn video(timestamp: i64, payload: Bytes, is_keyframe: bool, is_header: bool) -> Self {
        Self::build(1, MessageKind::Video, timestamp, payload, is_keyframe, is_header)
    }

    /// Create an audio message with explicit flags
    pub fn audio(timestamp: i64, payload: Bytes, is_header: bool) -> Self {
        Self::build(1, MessageKind::Audio, timestamp, payload, false, is_header)
    }

    /// Create a data message
    pub fn data(timestamp: i64, payload: Bytes) -> Self {
        Self::build(1, MessageKind::Data, timestamp, payload, false, false)
    }

    fn build(
        stream_id: u32,
        kind: MessageKind,
        timestamp: i64,
        payload: Bytes,
        keyframe: bool,
        sequence_header: bool,
    ) -> Self {
        Self {
            inner: Arc::new(MessageInner {
                kind,
                timestamp,
                stream_id,
                payload,
                // A sequence header is never a decodable frame
                keyframe: keyframe && !sequence_header,
                sequence_header,
            }),
        }
    }

    /// Copy-on-write: same payload, new timestamp
    pub fn with_timestamp(&self, timestamp: i64) -> Self {
        if timestamp == self.inner.timestamp {
            return self.clone();
        }

        Self {
            inner: Arc::new(MessageInner {
                kind: self.inner.kind,
                timestamp,
                stream_id: self.inner.stream_id,
                payload: self.inner.payload.clone(),
                keyframe: self.inner.keyframe,
                sequence_header: self.inner.sequence_header,
            }),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.inner.kind
    }

    /// Timestamp in microseconds
    pub fn timestamp(&self) -> i64 {
        self.inner.timestamp
    }

    /// Timestamp in milliseconds
    pub fn timestamp_millis(&self) -> i64 {
        self.inner.timestamp / MICROS_PER_MILLI
    }

    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    /// Payload size in bytes
    pub fn size(&self) -> usize {
        self.inner.payload.len()
    }

    pub fn is_audio(&self) -> bool {
        self.inner.kind == MessageKind::Audio
    }

    pub fn is_video(&self) -> bool {
        self.inner.kind == MessageKind::Video
    }

    pub fn is_data(&self) -> bool {
        self.inner.kind == MessageKind::Data
    }

    /// Audio or video
    pub fn is_av(&self) -> bool {
        !self.is_data()
    }

    /// Video keyframe (never true for sequence headers)
    pub fn is_keyframe(&self) -> bool {
        self.inner.keyframe
    }

    pub fn is_sequence_header(&self) -> bool {
        self.inner.sequence_header
    }

    /// Number of holders of this message header
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Whether both handles point at the same message
    pub fn ptr_eq(&self, other: &SharedMessage) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
