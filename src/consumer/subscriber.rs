//! Subscriber side of a live source
//!
//! A [`Consumer`] bridges the publisher's coroutine and the subscriber's
//! coroutine. The publisher enqueues under the consumer's lock and signals its
//! [`Condition`]; the subscriber parks in [`Consumer::wait`] and drains with
//! [`Consumer::dump_packets`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::coroutine::{self, Condition, WaitResult};
use crate::error::{Error, Result};
use crate::media::jitter::{Jitter, JitterAlgorithm};
use crate::media::message::{SharedMessage, MICROS_PER_MILLI};
use crate::registry::LiveSource;
use crate::stats::ConsumerStats;

use super::queue::MessageQueue;

/// Sleep interval of a paused consumer's wait
pub const PULSE: Duration = Duration::from_millis(500);

/// Outcome of [`Consumer::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerWait {
    /// Messages are ready, or the waiter was explicitly woken
    Ready,
    /// The timeout elapsed first
    TimedOut,
    /// The source unpublished and the queue is drained
    Closed,
}

#[derive(Debug)]
struct ConsumerState {
    queue: MessageQueue,
    jitter: Jitter,
    algorithm: JitterAlgorithm,
    paused: bool,
    closed: bool,
    /// Batch thresholds of a parked waiter: (min messages, min duration in us)
    waiting: Option<(usize, i64)>,
    delivered: u64,
}

impl ConsumerState {
    fn batch_ready(&self, min_msgs: usize, min_duration: i64) -> bool {
        self.queue.len() > min_msgs && self.queue.duration() >= min_duration
    }
}

/// State shared between a consumer and the source fanning out to it
#[derive(Debug)]
pub(crate) struct ConsumerShared {
    id: u64,
    state: Mutex<ConsumerState>,
    cond: Condition,
    created_at: Instant,
}

impl ConsumerShared {
    pub(crate) fn new(id: u64, queue: MessageQueue, algorithm: JitterAlgorithm) -> Self {
        Self {
            id,
            state: Mutex::new(ConsumerState {
                queue,
                jitter: Jitter::new(),
                algorithm,
                paused: false,
                closed: false,
                waiting: None,
                delivered: 0,
            }),
            cond: Condition::new(),
            created_at: Instant::now(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Jitter-correct and queue a message, waking a waiter whose batch is ready
    ///
    /// Returns the number of messages dropped by overflow.
    pub(crate) fn enqueue(&self, msg: &SharedMessage) -> usize {
        let mut state = self.state.lock();
        if state.closed {
            return 0;
        }

        let algorithm = state.algorithm;
        let corrected = state.jitter.correct(msg, algorithm);
        let dropped = state.queue.enqueue(corrected);

        let wake = match state.waiting {
            Some((min_msgs, min_duration)) => state.batch_ready(min_msgs, min_duration),
            None => false,
        };
        if wake {
            state.waiting = None;
        }
        drop(state);

        if wake {
            self.cond.broadcast();
        }
        dropped
    }

    /// Mark closed and wake any waiter
    pub(crate) fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.waiting = None;
        }
        self.cond.broadcast();
    }

    pub(crate) fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().queue.dropped()
    }

    pub(crate) fn await_keyframe(&self) {
        self.state.lock().queue.await_keyframe();
    }

    fn stats(&self) -> ConsumerStats {
        let state = self.state.lock();
        ConsumerStats {
            id: self.id,
            queue_len: state.queue.len(),
            queue_duration: Duration::from_micros(state.queue.duration().max(0) as u64),
            dropped: state.queue.dropped(),
            delivered: state.delivered,
            jitter_time_ms: state.jitter.time() / MICROS_PER_MILLI,
            paused: state.paused,
            closed: state.closed,
            age: self.created_at.elapsed(),
        }
    }
}

/// A subscriber's cursor into a live source
///
/// Dropping the consumer detaches it from the source.
pub struct Consumer {
    shared: Arc<ConsumerShared>,
    source: Arc<LiveSource>,
}

impl Consumer {
    pub(crate) fn new(shared: Arc<ConsumerShared>, source: Arc<LiveSource>) -> Self {
        Self { shared, source }
    }

    /// Consumer id, unique within its source
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The source this consumer reads from
    pub fn source(&self) -> &Arc<LiveSource> {
        &self.source
    }

    pub(crate) fn enqueue(&self, msg: &SharedMessage) -> usize {
        self.shared.enqueue(msg)
    }

    /// Wait until at least one message is queued
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<ConsumerWait> {
        self.wait_batch(0, Duration::ZERO, timeout).await
    }

    /// Wait until more than `min_msgs` messages spanning at least
    /// `min_duration` are queued
    ///
    /// Fails with [`Error::Interrupted`] if the calling coroutine is
    /// interrupted. A paused consumer sleeps one [`PULSE`] (or the timeout,
    /// if shorter) and reports `TimedOut`. Once the source unpublishes, a
    /// paused or drained consumer reports `Closed`.
    pub async fn wait_batch(
        &self,
        min_msgs: usize,
        min_duration: Duration,
        timeout: Option<Duration>,
    ) -> Result<ConsumerWait> {
        coroutine::pull()?;

        let min_duration = i64::try_from(min_duration.as_micros()).unwrap_or(i64::MAX);

        let ticket = {
            let mut state = self.shared.state.lock();

            if state.closed {
                return Ok(if state.paused || state.queue.is_empty() {
                    ConsumerWait::Closed
                } else {
                    ConsumerWait::Ready
                });
            }

            if state.paused {
                None
            } else if state.batch_ready(min_msgs, min_duration) {
                return Ok(ConsumerWait::Ready);
            } else {
                state.waiting = Some((min_msgs, min_duration));
                Some(self.shared.cond.prepare())
            }
        };

        let Some(ticket) = ticket else {
            let pulse = timeout.map_or(PULSE, |t| t.min(PULSE));
            coroutine::sleep(pulse).await?;
            return Ok(if self.is_closed() {
                ConsumerWait::Closed
            } else {
                ConsumerWait::TimedOut
            });
        };

        let result = ticket.wait(timeout).await;

        let mut state = self.shared.state.lock();
        state.waiting = None;

        match result {
            WaitResult::Signaled if state.closed && state.queue.is_empty() => Ok(ConsumerWait::Closed),
            WaitResult::Signaled => Ok(ConsumerWait::Ready),
            WaitResult::TimedOut => Ok(ConsumerWait::TimedOut),
            WaitResult::Interrupted => Err(Error::Interrupted),
        }
    }

    /// Drain up to `max` queued messages (0 = all)
    ///
    /// Returns nothing while paused.
    pub fn dump_packets(&self, max: usize) -> Vec<SharedMessage> {
        let mut state = self.shared.state.lock();
        if state.paused {
            return Vec::new();
        }

        let msgs = state.queue.dump_packets(max);
        state.delivered += msgs.len() as u64;
        msgs
    }

    /// Pause or resume delivery
    pub fn set_paused(&self, paused: bool) {
        let mut state = self.shared.state.lock();
        if state.paused != paused {
            tracing::debug!(consumer = self.shared.id, paused = paused, "Consumer pause toggled");
        }
        state.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.shared.state.lock().paused
    }

    /// Change the jitter algorithm for subsequent messages
    pub fn set_jitter(&self, algorithm: JitterAlgorithm) {
        self.shared.state.lock().algorithm = algorithm;
    }

    /// Release a parked waiter without new messages
    pub fn wakeup(&self) {
        self.shared.state.lock().waiting = None;
        self.shared.cond.broadcast();
    }

    /// Whether the source unpublished
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.shared.queue_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of this consumer's counters
    pub fn stats(&self) -> ConsumerStats {
        self.shared.stats()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.source.on_consumer_destroy(self.shared.id);
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.shared.id)
            .field("source", self.source.key())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_test::{assert_pending, assert_ready};

    use super::*;
    use crate::registry::{StreamConfig, StreamKey};

    fn source() -> Arc<LiveSource> {
        Arc::new(LiveSource::new(
            StreamKey::new("live", "consumer"),
            StreamConfig::default().jitter(JitterAlgorithm::Off),
        ))
    }

    fn audio(ms: i64) -> SharedMessage {
        SharedMessage::audio(ms * MICROS_PER_MILLI, Bytes::from_static(&[0xAF, 0x01]), false)
    }

    #[test]
    fn test_wait_batch_holds_until_both_thresholds() {
        let source = source();
        let consumer = source.create_consumer();

        let mut wait = tokio_test::task::spawn(consumer.wait_batch(2, Duration::from_millis(100), None));
        assert_pending!(wait.poll());

        // Enough messages, not enough span
        for ms in [0, 10, 20] {
            consumer.enqueue(&audio(ms));
        }
        assert!(!wait.is_woken());
        assert_pending!(wait.poll());

        consumer.enqueue(&audio(120));
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()).unwrap(), ConsumerWait::Ready);
        drop(wait);

        assert_eq!(consumer.dump_packets(0).len(), 4);
    }

    #[test]
    fn test_wait_batch_needs_more_than_min_msgs() {
        let source = source();
        let consumer = source.create_consumer();

        let mut wait = tokio_test::task::spawn(consumer.wait_batch(1, Duration::ZERO, None));
        assert_pending!(wait.poll());

        consumer.enqueue(&audio(0));
        assert!(!wait.is_woken());

        consumer.enqueue(&audio(10));
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()).unwrap(), ConsumerWait::Ready);
    }

    #[tokio::test]
    async fn test_paused_consumer_delivers_nothing() {
        let source = source();
        let consumer = source.create_consumer();
        consumer.enqueue(&audio(0));
        consumer.enqueue(&audio(10));

        consumer.set_paused(true);
        assert!(consumer.is_paused());
        assert!(consumer.dump_packets(0).is_empty());

        let started = Instant::now();
        let result = consumer.wait(Some(Duration::from_millis(20))).await.unwrap();
        assert_eq!(result, ConsumerWait::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(consumer.len(), 2);

        consumer.set_paused(false);
        assert_eq!(consumer.wait(None).await.unwrap(), ConsumerWait::Ready);
        assert_eq!(consumer.dump_packets(0).len(), 2);
        assert_eq!(consumer.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_paused_consumer_sees_unpublish() {
        let source = source();
        let publisher = source.on_publish(1).unwrap();
        let consumer = source.create_consumer();

        publisher.publish(&audio(0)).unwrap();
        consumer.set_paused(true);
        publisher.unpublish();

        for _ in 0..3 {
            let result = consumer.wait(Some(Duration::from_millis(20))).await.unwrap();
            assert_eq!(result, ConsumerWait::Closed);
        }
    }

    #[test]
    fn test_wakeup_releases_parked_waiter() {
        let source = source();
        let consumer = source.create_consumer();

        let mut wait = tokio_test::task::spawn(consumer.wait(None));
        assert_pending!(wait.poll());

        consumer.wakeup();
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()).unwrap(), ConsumerWait::Ready);
        drop(wait);

        assert!(consumer.is_empty());
    }

    #[test]
    fn test_set_jitter_applies_to_later_messages() {
        let source = source();
        let consumer = source.create_consumer();

        consumer.enqueue(&audio(1_000));
        consumer.set_jitter(JitterAlgorithm::Zero);
        consumer.enqueue(&audio(1_040));
        consumer.enqueue(&audio(1_080));

        let times: Vec<i64> = consumer
            .dump_packets(0)
            .iter()
            .map(|m| m.timestamp_millis())
            .collect();
        assert_eq!(times, vec![1_000, 0, 40]);
    }
}
