//! End-to-end publish/subscribe through the registry

use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio_test::{assert_pending, assert_ready};

use livecore::coroutine::{self, WaitResult};
use livecore::{
    Condition, ConsumerWait, Error, JitterAlgorithm, MessageKind, Scheduler, SchedulerConfig,
    SharedMessage, StreamConfig, StreamKey, StreamRegistry,
};
use livecore::registry::RegistryConfig;

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn registry(stream: StreamConfig) -> StreamRegistry {
    StreamRegistry::with_config(RegistryConfig::default().stream(stream.jitter(JitterAlgorithm::Off)))
}

fn video(ms: i64, keyframe: bool) -> Bytes {
    let first = if keyframe { 0x17 } else { 0x27 };
    Bytes::from(vec![first, 0x01, (ms % 256) as u8])
}

#[tokio::test]
async fn test_gop_round_trip() {
    init_tracing();
    let registry = registry(StreamConfig::default());
    let key = StreamKey::new("live", "gop");
    let publisher = registry.publish(&key, 1).await.unwrap();

    let a = publisher
        .on_publish_message(1, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]), 0, MessageKind::Audio)
        .unwrap();
    publisher.on_publish_message(1, video(0, true), 0, MessageKind::Video).unwrap();
    publisher.on_publish_message(1, video(33, false), 33_000, MessageKind::Video).unwrap();
    publisher.on_publish_message(1, video(66, false), 66_000, MessageKind::Video).unwrap();
    let k2 = publisher
        .on_publish_message(1, video(100, true), 100_000, MessageKind::Video)
        .unwrap();
    let f3 = publisher
        .on_publish_message(1, video(133, false), 133_000, MessageKind::Video)
        .unwrap();

    let consumer = registry.subscribe(&key).await.unwrap();
    let dumped = consumer.dump_packets(0);

    assert_eq!(dumped.len(), 3);
    assert!(dumped[0].ptr_eq(&a));
    assert!(dumped[1].ptr_eq(&k2));
    assert!(dumped[2].ptr_eq(&f3));
}

#[tokio::test]
async fn test_delivery_order_matches_publish_order() {
    init_tracing();
    let registry = registry(StreamConfig::default());
    let key = StreamKey::new("live", "order");
    let scheduler = Scheduler::current().unwrap();

    let publisher = registry.publish(&key, 1).await.unwrap();
    let consumer = registry.subscribe(&key).await.unwrap();

    let mut player = scheduler
        .spawn("player", async move {
            let mut received = Vec::new();
            loop {
                match consumer.wait(Some(Duration::from_secs(2))).await? {
                    ConsumerWait::Closed => return Ok(received),
                    ConsumerWait::TimedOut => return Err(Error::InvalidState("stalled".into())),
                    ConsumerWait::Ready => {
                        received.extend(consumer.dump_packets(0).iter().map(|m| m.timestamp()));
                    }
                }
            }
        })
        .unwrap();

    let mut published = Vec::new();
    for i in 0..200i64 {
        let ts = i * 10_000;
        let kind = if i % 3 == 0 { MessageKind::Audio } else { MessageKind::Video };
        let payload = match kind {
            MessageKind::Audio => Bytes::from_static(&[0xAF, 0x01, 0x00]),
            _ => video(i, i % 30 == 1),
        };
        publisher.on_publish_message(1, payload, ts, kind).unwrap();
        published.push(ts);

        if i % 16 == 0 {
            coroutine::yield_now().await;
        }
    }
    publisher.unpublish();

    let received = player.join().await.unwrap();
    assert_eq!(received, published);
}

#[tokio::test]
async fn test_slow_consumer_never_blocks_publisher() {
    init_tracing();
    let registry = registry(StreamConfig::default().queue_max_length(50));
    let key = StreamKey::new("live", "slow");

    let publisher = registry.publish(&key, 1).await.unwrap();
    let never_reads = registry.subscribe(&key).await.unwrap();

    for i in 0..10_000i64 {
        let payload = video(i, i % 25 == 0);
        publisher
            .on_publish_message(1, payload, i * 40_000, MessageKind::Video)
            .unwrap();
        assert!(never_reads.len() <= 50);
    }

    let stats = never_reads.stats();
    assert!(stats.dropped > 9_000);
    assert_eq!(registry.stats(&key).await.unwrap().unwrap().messages, 10_000);
}

#[tokio::test]
async fn test_second_publisher_rejected() {
    init_tracing();
    let registry = registry(StreamConfig::default());
    let key = StreamKey::new("live", "busy");

    let first = registry.publish(&key, 1).await.unwrap();
    let consumer = registry.subscribe(&key).await.unwrap();

    match registry.publish(&key, 2).await {
        Err(Error::AlreadyPublishing(k)) => assert_eq!(k, key),
        other => panic!("expected AlreadyPublishing, got {:?}", other.map(|p| p.session_id())),
    }

    first.on_publish_message(1, video(0, true), 0, MessageKind::Video).unwrap();
    assert_eq!(consumer.len(), 1);
    assert!(!consumer.is_closed());
}

#[test]
fn test_wait_wakes_on_publish() {
    let registry_config = RegistryConfig::default();
    let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    let registry = StreamRegistry::with_config(registry_config);
    let key = StreamKey::new("live", "wake");

    let (publisher, consumer) = rt.block_on(async {
        (
            registry.publish(&key, 1).await.unwrap(),
            registry.subscribe(&key).await.unwrap(),
        )
    });

    let mut wait = tokio_test::task::spawn(consumer.wait(None));
    assert_pending!(wait.poll());

    publisher
        .publish(&SharedMessage::audio(0, Bytes::from_static(&[0xAF, 0x01]), false))
        .unwrap();

    assert!(wait.is_woken());
    let result = assert_ready!(wait.poll());
    assert_eq!(result.unwrap(), ConsumerWait::Ready);
}

#[tokio::test]
async fn test_interrupt_before_wait() {
    init_tracing();
    let scheduler = Scheduler::spawn_service(SchedulerConfig::named("media")).unwrap();
    let cond = Arc::new(Condition::new());
    let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

    let waiter_cond = Arc::clone(&cond);
    let mut waiter = scheduler
        .spawn("waiter", async move {
            let _ = gate_rx.await;
            Ok(waiter_cond.wait(None).await)
        })
        .unwrap();

    waiter.interrupt();
    gate_tx.send(()).unwrap();

    assert_eq!(waiter.join().await.unwrap(), WaitResult::Interrupted);
    assert_eq!(cond.waiters(), 0);
    scheduler.shutdown();
}
