//! Live source: one published stream and its consumers
//!
//! The source owns the publish slot, the GOP cache and the consumer list.
//! Publishing a message caches it and enqueues it into every consumer's
//! private queue; a slow consumer only ever loses its own messages.
//!
//! Lock order is source, then consumer. A consumer never calls back into the
//! source while holding its own lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::consumer::{Consumer, ConsumerShared, MessageQueue};
use crate::error::{Error, Result};
use crate::media::gop::GopCache;
use crate::media::message::{MessageKind, SharedMessage};
use crate::stats::StreamStats;

use super::config::{Reloadable, StreamConfig};
use super::key::StreamKey;

/// Log a slow-consumer warning every this many drops
pub const DROP_LOG_INTERVAL: u64 = 100;

/// State of a live source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// A publisher holds the publish slot
    Active,
    /// No publisher
    Idle,
}

#[derive(Debug, Default)]
struct PublishCounters {
    messages: u64,
    bytes: u64,
    video_frames: u64,
    audio_frames: u64,
    keyframes: u64,
    last_timestamp: i64,
}

struct SourceState {
    config: StreamConfig,
    /// Applied on the next publish
    pending_config: Option<StreamConfig>,
    /// Session id of the active publisher
    publisher: Option<u64>,
    gop: GopCache,
    consumers: Vec<Arc<ConsumerShared>>,
    /// Whether the current publish carried video
    has_video: bool,
    counters: PublishCounters,
    published_at: Option<Instant>,
    idle_since: Instant,
}

impl SourceState {
    fn apply_config(&mut self) {
        if let Some(config) = self.pending_config.take() {
            self.config = config;
        }
        self.gop.set_enabled(self.config.gop_cache);
        self.gop.set_max_frames(self.config.gop_cache_max_frames);
    }
}

/// One live stream
pub struct LiveSource {
    key: StreamKey,
    state: Mutex<SourceState>,
    next_consumer_id: AtomicU64,
    created_at: Instant,
}

impl LiveSource {
    /// Create an idle source
    pub fn new(key: StreamKey, config: StreamConfig) -> Self {
        let mut gop = GopCache::with_max_frames(config.gop_cache_max_frames);
        gop.set_enabled(config.gop_cache);

        Self {
            key,
            state: Mutex::new(SourceState {
                config,
                pending_config: None,
                publisher: None,
                gop,
                consumers: Vec::new(),
                has_video: false,
                counters: PublishCounters::default(),
                published_at: None,
                idle_since: Instant::now(),
            }),
            next_consumer_id: AtomicU64::new(1),
            created_at: Instant::now(),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Claim the publish slot
    ///
    /// Fails with [`Error::AlreadyPublishing`] if another publisher holds it;
    /// the existing publisher is unaffected.
    pub fn on_publish(self: &Arc<Self>, session_id: u64) -> Result<Publisher> {
        let mut state = self.state.lock();

        if let Some(current) = state.publisher {
            tracing::warn!(
                stream = %self.key,
                session_id = session_id,
                publisher = current,
                "Publish rejected, stream already has a publisher"
            );
            return Err(Error::AlreadyPublishing(self.key.clone()));
        }

        state.apply_config();
        state.gop.on_publish();
        state.has_video = false;
        state.counters = PublishCounters::default();
        state.publisher = Some(session_id);
        state.published_at = Some(Instant::now());

        tracing::info!(
            stream = %self.key,
            session_id = session_id,
            consumers = state.consumers.len(),
            gop_cache = state.config.gop_cache,
            "Publish started"
        );

        Ok(Publisher {
            source: Arc::clone(self),
            session_id,
            active: true,
        })
    }

    fn dispatch(&self, session_id: u64, msg: &SharedMessage) -> Result<()> {
        let mut state = self.state.lock();

        if state.publisher != Some(session_id) {
            return Err(Error::InvalidState(format!(
                "session {} is not publishing {}",
                session_id, self.key
            )));
        }

        let counters = &mut state.counters;
        counters.messages += 1;
        counters.bytes += msg.size() as u64;
        counters.last_timestamp = msg.timestamp();
        match msg.kind() {
            MessageKind::Video => {
                counters.video_frames += 1;
                if msg.is_keyframe() {
                    counters.keyframes += 1;
                }
            }
            MessageKind::Audio => counters.audio_frames += 1,
            MessageKind::Data => {}
        }
        if msg.is_video() {
            state.has_video = true;
        }

        state.gop.cache(msg);

        for consumer in &state.consumers {
            let dropped = consumer.enqueue(msg) as u64;
            if dropped == 0 {
                continue;
            }

            let total = consumer.dropped();
            if total / DROP_LOG_INTERVAL != total.saturating_sub(dropped) / DROP_LOG_INTERVAL {
                tracing::warn!(
                    stream = %self.key,
                    consumer = consumer.id(),
                    dropped = total,
                    "Slow consumer, dropping messages"
                );
            }
        }

        if msg.is_keyframe() {
            let depth = state.consumers.iter().map(|c| c.queue_len()).max().unwrap_or(0);
            tracing::debug!(
                stream = %self.key,
                consumers = state.consumers.len(),
                max_queue_depth = depth,
                gop_frames = state.gop.frame_count(),
                "Queue depth"
            );
        }

        tracing::trace!(
            stream = %self.key,
            kind = ?msg.kind(),
            timestamp_ms = msg.timestamp_millis(),
            size = msg.size(),
            consumers = state.consumers.len(),
            "Message dispatched"
        );

        Ok(())
    }

    /// Release the publish slot, clear the cache and close every consumer
    ///
    /// Ignored if `session_id` is not the active publisher.
    pub fn on_unpublish(&self, session_id: u64) {
        let (consumers, counters, duration) = {
            let mut state = self.state.lock();

            if state.publisher != Some(session_id) {
                tracing::warn!(
                    stream = %self.key,
                    expected = ?state.publisher,
                    actual = session_id,
                    "Unpublish mismatch"
                );
                return;
            }

            state.publisher = None;
            state.gop.on_publish();
            state.has_video = false;
            state.idle_since = Instant::now();

            let duration = state.published_at.take().map(|t| t.elapsed()).unwrap_or_default();
            let counters = std::mem::take(&mut state.counters);
            (std::mem::take(&mut state.consumers), counters, duration)
        };

        for consumer in &consumers {
            consumer.close();
        }

        tracing::info!(
            stream = %self.key,
            session_id = session_id,
            duration_ms = duration.as_millis() as u64,
            messages = counters.messages,
            bytes = counters.bytes,
            consumers_closed = consumers.len(),
            "Publish ended"
        );
    }

    /// Attach a new consumer
    ///
    /// With the GOP cache enabled the consumer starts with the cached headers
    /// and GOP. Otherwise it gets the headers only and waits for the next
    /// keyframe.
    pub fn create_consumer(self: &Arc<Self>) -> Consumer {
        let mut state = self.state.lock();

        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let queue = MessageQueue::with_limits(
            state.config.queue_max_length,
            state.config.queue_max_duration,
        );
        let shared = Arc::new(ConsumerShared::new(id, queue, state.config.jitter));
        let consumer = Consumer::new(Arc::clone(&shared), Arc::clone(self));

        let dumped = if state.gop.enabled() {
            state.gop.dump(&consumer)
        } else {
            if state.has_video {
                shared.await_keyframe();
            }
            state.gop.dump_headers(&consumer)
        };

        state.consumers.push(shared);

        tracing::info!(
            stream = %self.key,
            consumer = id,
            consumers = state.consumers.len(),
            dumped = dumped,
            publishing = state.publisher.is_some(),
            "Consumer created"
        );

        consumer
    }

    /// Detach a consumer; called when the consumer is dropped
    pub(crate) fn on_consumer_destroy(&self, id: u64) {
        let mut state = self.state.lock();
        let before = state.consumers.len();
        state.consumers.retain(|c| c.id() != id);

        if state.consumers.len() != before {
            if state.consumers.is_empty() {
                state.idle_since = Instant::now();
            }
            tracing::debug!(
                stream = %self.key,
                consumer = id,
                consumers = state.consumers.len(),
                "Consumer destroyed"
            );
        }
    }

    pub fn state(&self) -> StreamState {
        if self.state.lock().publisher.is_some() {
            StreamState::Active
        } else {
            StreamState::Idle
        }
    }

    /// Session id of the active publisher
    pub fn publisher_id(&self) -> Option<u64> {
        self.state.lock().publisher
    }

    pub fn has_publisher(&self) -> bool {
        self.publisher_id().is_some()
    }

    /// Number of attached consumers
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Config in effect for the current publish
    pub fn config(&self) -> StreamConfig {
        self.state.lock().config.clone()
    }

    /// Cached headers and GOP, as a new consumer would receive them
    pub fn gop_snapshot(&self) -> Vec<SharedMessage> {
        self.state.lock().gop.snapshot()
    }

    /// Whether the source has had no publisher and no consumers for `timeout`
    pub fn is_idle_for(&self, timeout: Duration) -> bool {
        let state = self.state.lock();
        state.publisher.is_none() && state.consumers.is_empty() && state.idle_since.elapsed() > timeout
    }

    /// Snapshot of publish and fan-out counters
    pub fn stats(&self) -> StreamStats {
        let state = self.state.lock();
        let counters = &state.counters;

        StreamStats {
            stream_key: self.key.to_string(),
            state: if state.publisher.is_some() {
                StreamState::Active
            } else {
                StreamState::Idle
            },
            publisher_id: state.publisher,
            consumers: state.consumers.len(),
            messages: counters.messages,
            bytes_received: counters.bytes,
            video_frames: counters.video_frames,
            audio_frames: counters.audio_frames,
            keyframes: counters.keyframes,
            last_timestamp_ms: counters.last_timestamp / crate::media::message::MICROS_PER_MILLI,
            consumer_drops: state.consumers.iter().map(|c| c.dropped()).sum(),
            gop_frames: state.gop.frame_count(),
            gop_bytes: state.gop.size(),
            publish_duration: state.published_at.map(|t| t.elapsed()).unwrap_or_default(),
            age: self.created_at.elapsed(),
        }
    }
}

impl Reloadable for LiveSource {
    fn on_reload(&self, config: &StreamConfig) {
        let mut state = self.state.lock();
        if state.config == *config {
            return;
        }

        state.pending_config = Some(config.clone());
        tracing::info!(
            stream = %self.key,
            publishing = state.publisher.is_some(),
            "Stream config reloaded, applies on next publish"
        );
    }
}

impl std::fmt::Debug for LiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSource")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

/// The publish slot of a source, held by the publishing connection
///
/// Dropping it unpublishes.
pub struct Publisher {
    source: Arc<LiveSource>,
    session_id: u64,
    active: bool,
}

impl Publisher {
    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn source(&self) -> &Arc<LiveSource> {
        &self.source
    }

    /// Wrap a demuxed payload and fan it out
    ///
    /// `timestamp` is in microseconds.
    pub fn on_publish_message(
        &self,
        stream_id: u32,
        payload: Bytes,
        timestamp: i64,
        kind: MessageKind,
    ) -> Result<SharedMessage> {
        let msg = SharedMessage::new(stream_id, kind, timestamp, payload);
        self.publish(&msg)?;
        Ok(msg)
    }

    /// Fan out an already built message
    pub fn publish(&self, msg: &SharedMessage) -> Result<()> {
        self.source.dispatch(self.session_id, msg)
    }

    /// Release the publish slot
    pub fn unpublish(mut self) {
        self.active = false;
        self.source.on_unpublish(self.session_id);
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        if self.active {
            self.source.on_unpublish(self.session_id);
        }
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("stream", self.source.key())
            .field("session_id", &self.session_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerWait;
    use crate::media::jitter::JitterAlgorithm;
    use crate::media::message::MICROS_PER_MILLI;

    fn source(config: StreamConfig) -> Arc<LiveSource> {
        Arc::new(LiveSource::new(StreamKey::new("live", "test"), config.jitter(JitterAlgorithm::Off)))
    }

    fn keyframe(ms: i64) -> SharedMessage {
        SharedMessage::video(ms * MICROS_PER_MILLI, Bytes::from_static(&[0x17, 0x01]), true, false)
    }

    fn inter(ms: i64) -> SharedMessage {
        SharedMessage::video(ms * MICROS_PER_MILLI, Bytes::from_static(&[0x27, 0x01]), false, false)
    }

    #[test]
    fn test_second_publisher_rejected() {
        let source = source(StreamConfig::default());
        let first = source.on_publish(1).unwrap();

        let second = source.on_publish(2);
        assert!(matches!(second, Err(Error::AlreadyPublishing(_))));

        // First publisher unaffected
        assert_eq!(source.publisher_id(), Some(1));
        first.publish(&keyframe(0)).unwrap();
        assert_eq!(source.stats().messages, 1);
    }

    #[test]
    fn test_fan_out_shares_messages() {
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();
        let a = source.create_consumer();
        let b = source.create_consumer();

        let msg = keyframe(0);
        publisher.publish(&msg).unwrap();

        let from_a = a.dump_packets(0);
        let from_b = b.dump_packets(0);
        assert_eq!(from_a.len(), 1);
        assert!(from_a[0].ptr_eq(&msg));
        assert!(from_b[0].ptr_eq(&msg));
    }

    #[test]
    fn test_slow_consumer_isolated() {
        let source = source(StreamConfig::default().queue_max_length(10));
        let publisher = source.on_publish(1).unwrap();
        let slow = source.create_consumer();
        let fast = source.create_consumer();

        let mut delivered = 0;
        for i in 0..100 {
            let msg = if i % 5 == 0 { keyframe(i * 10) } else { inter(i * 10) };
            publisher.publish(&msg).unwrap();
            delivered += fast.dump_packets(0).len();
            assert!(slow.len() <= 10);
        }

        assert_eq!(delivered, 100);
        assert_eq!(fast.stats().dropped, 0);
        assert!(slow.stats().dropped > 0);
    }

    #[test]
    fn test_late_joiner_gets_gop() {
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();

        let header = SharedMessage::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12]), true);
        for msg in [&header, &keyframe(0), &inter(33), &keyframe(66), &inter(99)] {
            publisher.publish(msg).unwrap();
        }

        let consumer = source.create_consumer();
        let got: Vec<i64> = consumer.dump_packets(0).iter().map(|m| m.timestamp_millis()).collect();
        assert_eq!(got, vec![0, 66, 99]);
    }

    #[test]
    fn test_gop_disabled_waits_for_keyframe() {
        let source = source(StreamConfig::default().gop_cache(false));
        let publisher = source.on_publish(1).unwrap();

        let header = SharedMessage::video(0, Bytes::from_static(&[0x17, 0x00]), true, true);
        publisher.publish(&header).unwrap();
        publisher.publish(&keyframe(0)).unwrap();
        publisher.publish(&inter(33)).unwrap();

        let consumer = source.create_consumer();
        publisher.publish(&inter(66)).unwrap();
        publisher.publish(&keyframe(100)).unwrap();

        let out = consumer.dump_packets(0);
        assert_eq!(out.len(), 2);
        assert!(out[0].is_sequence_header());
        assert!(out[1].is_keyframe());
    }

    #[test]
    fn test_unpublish_closes_consumers() {
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();
        let consumer = source.create_consumer();
        publisher.publish(&keyframe(0)).unwrap();

        publisher.unpublish();

        assert!(consumer.is_closed());
        assert_eq!(source.state(), StreamState::Idle);
        assert_eq!(source.consumer_count(), 0);
        assert!(source.gop_snapshot().is_empty());
        // Queued messages remain drainable
        assert_eq!(consumer.dump_packets(0).len(), 1);
    }

    #[test]
    fn test_publisher_drop_unpublishes() {
        let source = source(StreamConfig::default());
        {
            let _publisher = source.on_publish(7).unwrap();
            assert!(source.has_publisher());
        }
        assert!(!source.has_publisher());
        assert!(source.on_publish(8).is_ok());
    }

    #[test]
    fn test_consumer_drop_detaches() {
        let source = source(StreamConfig::default());
        let consumer = source.create_consumer();
        assert_eq!(source.consumer_count(), 1);

        drop(consumer);
        assert_eq!(source.consumer_count(), 0);
    }

    #[test]
    fn test_stale_publisher_rejected() {
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();
        source.on_unpublish(1);

        assert!(matches!(publisher.publish(&keyframe(0)), Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_reload_applies_on_next_publish() {
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();

        source.on_reload(&StreamConfig::default().gop_cache(false));
        assert!(source.config().gop_cache);

        publisher.unpublish();
        let _publisher = source.on_publish(2).unwrap();
        assert!(!source.config().gop_cache);
    }

    #[test]
    fn test_on_publish_message_classifies() {
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();

        let msg = publisher
            .on_publish_message(1, Bytes::from_static(&[0x17, 0x01, 0x00]), 40_000, MessageKind::Video)
            .unwrap();
        assert!(msg.is_keyframe());
        assert_eq!(source.stats().keyframes, 1);
    }

    #[tokio::test]
    async fn test_unpublish_wakes_waiter() {
        let scheduler = crate::coroutine::Scheduler::current().unwrap();
        let source = source(StreamConfig::default());
        let publisher = source.on_publish(1).unwrap();
        let consumer = source.create_consumer();

        let mut waiter = scheduler
            .spawn("player", async move { consumer.wait(None).await })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.unpublish();

        assert_eq!(waiter.join().await.unwrap(), ConsumerWait::Closed);
    }
}
