//! GOP (Group of Pictures) cache for late-joiner support
//!
//! When a new client subscribes to an existing stream, they need to receive:
//! 1. The metadata and sequence headers (SPS/PPS for video, AudioSpecificConfig for audio)
//! 2. The most recent keyframe
//! 3. All frames since that keyframe
//!
//! This allows the decoder to start decoding from the keyframe without
//! waiting for the next one. The cached frames always start with a keyframe
//! or are empty.

use crate::consumer::Consumer;

use super::message::SharedMessage;

/// Audio messages after the last video before the stream is treated as pure audio
const PURE_AUDIO_GUESS_COUNT: usize = 115;

/// GOP cache for one live source
#[derive(Debug)]
pub struct GopCache {
    /// Whether frames are cached at all
    enabled: bool,
    /// Clear the cache when it holds more frames than this (0 = unlimited)
    max_frames: usize,
    /// Video frames in the current GOP
    cached_video_count: usize,
    /// Audio frames since the last video frame
    audio_after_last_video_count: usize,
    /// Video sequence header
    video_header: Option<SharedMessage>,
    /// Audio sequence header
    audio_header: Option<SharedMessage>,
    /// Metadata
    metadata: Option<SharedMessage>,
    /// Frames since the last keyframe
    frames: Vec<SharedMessage>,
    /// Payload bytes held by `frames`
    size: usize,
}

impl GopCache {
    /// Create an enabled cache without a frame limit
    pub fn new() -> Self {
        Self::with_max_frames(0)
    }

    /// Create an enabled cache with a frame limit
    pub fn with_max_frames(max_frames: usize) -> Self {
        Self {
            enabled: true,
            max_frames,
            cached_video_count: 0,
            audio_after_last_video_count: 0,
            video_header: None,
            audio_header: None,
            metadata: None,
            frames: Vec::new(),
            size: 0,
        }
    }

    /// Enable or disable frame caching; disabling clears cached frames
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.clear();
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_max_frames(&mut self, max_frames: usize) {
        self.max_frames = max_frames;
    }

    /// Reset for a new publish session
    pub fn on_publish(&mut self) {
        self.clear();
        self.video_header = None;
        self.audio_header = None;
        self.metadata = None;
    }

    /// Cache a published message
    ///
    /// Sequence headers and metadata are always retained. Frames are cached
    /// from a keyframe onwards; a new keyframe starts a new GOP.
    pub fn cache(&mut self, msg: &SharedMessage) {
        if msg.is_data() {
            self.metadata = Some(msg.clone());
            return;
        }

        if msg.is_sequence_header() {
            if msg.is_video() {
                self.video_header = Some(msg.clone());
            } else {
                self.audio_header = Some(msg.clone());
            }
            return;
        }

        if !self.enabled {
            return;
        }

        if msg.is_video() {
            self.cached_video_count += 1;
            self.audio_after_last_video_count = 0;
        } else {
            self.audio_after_last_video_count += 1;
        }

        if self.audio_after_last_video_count > PURE_AUDIO_GUESS_COUNT {
            if !self.frames.is_empty() {
                tracing::warn!(
                    frames = self.frames.len(),
                    "Clearing GOP cache, stream looks like pure audio"
                );
                self.clear();
            }
            return;
        }

        if msg.is_keyframe() {
            self.clear();
            self.cached_video_count = 1;
        } else if self.frames.is_empty() {
            // Not decodable without a keyframe in front
            return;
        }

        self.size += msg.size();
        self.frames.push(msg.clone());

        if self.max_frames > 0 && self.frames.len() > self.max_frames {
            tracing::warn!(
                max_frames = self.max_frames,
                frames = self.frames.len(),
                videos = self.cached_video_count,
                "GOP cache exceeded max frames, clearing"
            );
            self.clear();
        }
    }

    /// Drop cached frames, keeping headers and metadata
    pub fn clear(&mut self) {
        self.frames.clear();
        self.size = 0;
        self.cached_video_count = 0;
        self.audio_after_last_video_count = 0;
    }

    /// Metadata followed by the video and audio sequence headers
    pub fn headers(&self) -> Vec<SharedMessage> {
        [&self.metadata, &self.video_header, &self.audio_header]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Headers followed by cached frames, oldest first
    ///
    /// Empty frames when disabled; headers are still returned.
    pub fn snapshot(&self) -> Vec<SharedMessage> {
        let mut result = self.headers();
        result.reserve(self.frames.len());
        result.extend(self.frames.iter().cloned());
        result
    }

    /// Push headers and cached frames into a new consumer
    ///
    /// No-op when caching is disabled. Returns the number of messages pushed.
    pub fn dump(&self, consumer: &Consumer) -> usize {
        if !self.enabled {
            return 0;
        }

        let messages = self.snapshot();
        for msg in &messages {
            consumer.enqueue(msg);
        }

        tracing::debug!(
            consumer = consumer.id(),
            count = messages.len(),
            duration_ms = self.gop_duration().unwrap_or(0) / super::message::MICROS_PER_MILLI,
            "Dispatched cached GOP"
        );
        messages.len()
    }

    /// Push only metadata and sequence headers into a new consumer
    pub fn dump_headers(&self, consumer: &Consumer) -> usize {
        let headers = self.headers();
        for msg in &headers {
            consumer.enqueue(msg);
        }
        headers.len()
    }

    pub fn video_header(&self) -> Option<&SharedMessage> {
        self.video_header.as_ref()
    }

    pub fn audio_header(&self) -> Option<&SharedMessage> {
        self.audio_header.as_ref()
    }

    pub fn metadata(&self) -> Option<&SharedMessage> {
        self.metadata.as_ref()
    }

    /// Whether no frames are cached
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of cached frames
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Payload bytes held by cached frames
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether no video has been cached in the current GOP
    pub fn pure_audio(&self) -> bool {
        self.cached_video_count == 0
    }

    /// Timestamp of the first cached frame, in microseconds
    pub fn start_time(&self) -> Option<i64> {
        self.frames.first().map(|m| m.timestamp())
    }

    /// Timestamp span of cached frames, in microseconds
    pub fn gop_duration(&self) -> Option<i64> {
        let first = self.frames.first()?.timestamp();
        let last = self.frames.last()?.timestamp();
        Some(last - first)
    }
}

impl Default for GopCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn keyframe(ms: i64) -> SharedMessage {
        SharedMessage::video(ms * 1_000, Bytes::from(vec![0x17, 0x01, ms as u8]), true, false)
    }

    fn inter(ms: i64) -> SharedMessage {
        SharedMessage::video(ms * 1_000, Bytes::from(vec![0x27, 0x01, ms as u8]), false, false)
    }

    fn audio(ms: i64) -> SharedMessage {
        SharedMessage::audio(ms * 1_000, Bytes::from(vec![0xAF, 0x01, ms as u8]), false)
    }

    fn audio_header() -> SharedMessage {
        SharedMessage::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]), true)
    }

    fn video_header() -> SharedMessage {
        SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00, 0x01]), true, true)
    }

    #[test]
    fn test_late_joiner_gets_latest_gop_only() {
        let mut cache = GopCache::new();
        let a = audio_header();
        let k1 = keyframe(0);
        let f1 = inter(33);
        let f2 = inter(66);
        let k2 = keyframe(100);
        let f3 = inter(133);

        for msg in [&a, &k1, &f1, &f2, &k2, &f3] {
            cache.cache(msg);
        }

        let dumped = cache.snapshot();
        assert_eq!(dumped.len(), 3);
        assert!(dumped[0].ptr_eq(&a));
        assert!(dumped[1].ptr_eq(&k2));
        assert!(dumped[2].ptr_eq(&f3));
    }

    #[test]
    fn test_keyframe_clears() {
        let mut cache = GopCache::new();

        cache.cache(&keyframe(0));
        cache.cache(&inter(33));
        cache.cache(&inter(66));
        assert_eq!(cache.frame_count(), 3);

        cache.cache(&keyframe(100));
        assert_eq!(cache.frame_count(), 1);
    }

    #[test]
    fn test_starts_with_keyframe() {
        let mut cache = GopCache::new();

        // Publisher joined mid-GOP
        cache.cache(&inter(0));
        cache.cache(&audio(10));
        assert!(cache.is_empty());

        cache.cache(&keyframe(33));
        cache.cache(&audio(40));
        assert_eq!(cache.frame_count(), 2);
        assert!(cache.snapshot()[0].is_keyframe());
    }

    #[test]
    fn test_headers_ordering() {
        let mut cache = GopCache::new();
        let meta = SharedMessage::data(0, Bytes::from_static(b"onMetaData"));

        cache.cache(&audio_header());
        cache.cache(&video_header());
        cache.cache(&meta);
        cache.cache(&keyframe(0));

        let dumped = cache.snapshot();
        assert_eq!(dumped.len(), 4);
        assert!(dumped[0].is_data());
        assert!(dumped[1].is_video() && dumped[1].is_sequence_header());
        assert!(dumped[2].is_audio() && dumped[2].is_sequence_header());
        assert!(dumped[3].is_keyframe());
    }

    #[test]
    fn test_disabled_keeps_headers_only() {
        let mut cache = GopCache::new();
        cache.cache(&keyframe(0));
        cache.cache(&inter(33));

        cache.set_enabled(false);
        assert!(cache.is_empty());

        cache.cache(&video_header());
        cache.cache(&keyframe(66));
        assert!(cache.is_empty());
        assert_eq!(cache.headers().len(), 1);
    }

    #[test]
    fn test_on_publish_clears_everything() {
        let mut cache = GopCache::new();
        cache.cache(&video_header());
        cache.cache(&audio_header());
        cache.cache(&keyframe(0));

        cache.on_publish();

        assert!(cache.video_header().is_none());
        assert!(cache.audio_header().is_none());
        assert!(cache.metadata().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_max_frames() {
        let mut cache = GopCache::with_max_frames(3);

        cache.cache(&keyframe(0));
        cache.cache(&inter(33));
        cache.cache(&inter(66));
        assert_eq!(cache.frame_count(), 3);

        // Fourth frame exceeds the limit
        cache.cache(&inter(99));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_pure_audio_guess() {
        let mut cache = GopCache::new();
        cache.cache(&keyframe(0));
        assert!(!cache.pure_audio());

        for i in 0..PURE_AUDIO_GUESS_COUNT {
            cache.cache(&audio(i as i64 + 1));
        }
        assert_eq!(cache.frame_count(), PURE_AUDIO_GUESS_COUNT + 1);

        cache.cache(&audio(1_000));
        assert!(cache.is_empty());
        assert!(cache.pure_audio());
    }

    #[test]
    fn test_size_and_duration() {
        let mut cache = GopCache::new();

        assert!(cache.start_time().is_none());
        cache.cache(&keyframe(100));
        cache.cache(&inter(133));
        cache.cache(&inter(166));

        assert_eq!(cache.size(), 9);
        assert_eq!(cache.start_time(), Some(100_000));
        assert_eq!(cache.gop_duration(), Some(66_000));
    }

    #[test]
    fn test_cache_holds_reference() {
        let mut cache = GopCache::new();
        let k = keyframe(0);

        cache.cache(&k);
        assert_eq!(k.ref_count(), 2);

        cache.cache(&keyframe(33));
        assert_eq!(k.ref_count(), 1);
    }
}
