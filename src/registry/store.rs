//! Stream registry implementation
//!
//! The central registry that maps stream keys to live sources and hands out
//! publish slots and consumers.

use std::collections::HashMap;
use std::sync::Arc;

use crate::consumer::Consumer;
use crate::coroutine::{self, Coroutine, Mutex, Runnable, Scheduler};
use crate::error::Result;
use crate::stats::StreamStats;

use super::config::{RegistryConfig, Reloadable, StreamConfig};
use super::key::StreamKey;
use super::source::{LiveSource, Publisher};

/// Central registry for all live sources
///
/// The source table is guarded by a coroutine mutex, so lookups park the
/// calling coroutine rather than the thread and remain interruptible.
pub struct StreamRegistry {
    /// Map of stream key to live source
    sources: Mutex<HashMap<StreamKey, Arc<LiveSource>>>,

    /// Settings for sources created from now on
    stream_config: parking_lot::Mutex<StreamConfig>,

    /// Configuration
    config: RegistryConfig,
}

impl StreamRegistry {
    /// Create a new stream registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new stream registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            sources: Mutex::new(HashMap::new()),
            stream_config: parking_lot::Mutex::new(config.stream.clone()),
            config,
        }
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the source for a key, creating an idle one if needed
    pub async fn fetch_or_create(&self, key: &StreamKey) -> Result<Arc<LiveSource>> {
        let mut sources = self.sources.lock().await?;
        Ok(self.entry(&mut sources, key))
    }

    fn entry(&self, sources: &mut HashMap<StreamKey, Arc<LiveSource>>, key: &StreamKey) -> Arc<LiveSource> {
        if let Some(source) = sources.get(key) {
            return Arc::clone(source);
        }

        let config = self.stream_config.lock().clone();
        let source = Arc::new(LiveSource::new(key.clone(), config));
        sources.insert(key.clone(), Arc::clone(&source));

        tracing::debug!(stream = %key, sources = sources.len(), "Source created");
        source
    }

    /// Look up an existing source
    pub async fn find(&self, key: &StreamKey) -> Result<Option<Arc<LiveSource>>> {
        Ok(self.sources.lock().await?.get(key).cloned())
    }

    /// Claim the publish slot of a stream
    ///
    /// Fails with `AlreadyPublishing` if the stream has an active publisher.
    pub async fn publish(&self, key: &StreamKey, session_id: u64) -> Result<Publisher> {
        // Attach before releasing the table so cleanup cannot orphan the source
        let mut sources = self.sources.lock().await?;
        self.entry(&mut sources, key).on_publish(session_id)
    }

    /// Attach a consumer to a stream
    ///
    /// A stream without a publisher is created idle; the consumer starts
    /// receiving once someone publishes.
    pub async fn subscribe(&self, key: &StreamKey) -> Result<Consumer> {
        let mut sources = self.sources.lock().await?;
        Ok(self.entry(&mut sources, key).create_consumer())
    }

    /// Get total number of sources
    pub async fn stream_count(&self) -> Result<usize> {
        Ok(self.sources.lock().await?.len())
    }

    /// Get stream statistics
    pub async fn stats(&self, key: &StreamKey) -> Result<Option<StreamStats>> {
        Ok(self.find(key).await?.map(|source| source.stats()))
    }

    /// Statistics of every source
    pub async fn all_stats(&self) -> Result<Vec<StreamStats>> {
        let sources = self.sources.lock().await?;
        Ok(sources.values().map(|source| source.stats()).collect())
    }

    /// Apply a new stream config to every source and to future ones
    ///
    /// Each source picks it up on its next publish.
    pub async fn reload(&self, config: &StreamConfig) -> Result<()> {
        *self.stream_config.lock() = config.clone();

        let sources = self.sources.lock().await?;
        for source in sources.values() {
            source.on_reload(config);
        }
        Ok(())
    }

    /// Run cleanup once
    ///
    /// Removes sources that have had no publisher and no consumers for
    /// longer than `idle_stream_timeout`, unless a caller still holds the
    /// source from `fetch_or_create` or `find`. Returns how many were removed.
    pub async fn cleanup(&self) -> Result<usize> {
        let mut sources = self.sources.lock().await?;
        let timeout = self.config.idle_stream_timeout;

        let before = sources.len();
        sources.retain(|key, source| {
            let idle = Arc::strong_count(source) == 1 && source.is_idle_for(timeout);
            if idle {
                tracing::info!(stream = %key, "Source removed by cleanup");
            }
            !idle
        });

        Ok(before - sources.len())
    }

    /// Spawn the background cleanup coroutine
    ///
    /// Interrupt the returned coroutine to stop it.
    pub fn spawn_cleanup_task(self: &Arc<Self>, scheduler: &Scheduler) -> Result<Coroutine<()>> {
        scheduler.start(
            "registry-cleanup",
            CleanupTask {
                registry: Arc::clone(self),
            },
        )
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct CleanupTask {
    registry: Arc<StreamRegistry>,
}

impl Runnable for CleanupTask {
    type Output = ();

    async fn cycle(self) -> Result<()> {
        let interval = self.registry.config.cleanup_interval;

        loop {
            let tick = async {
                coroutine::sleep(interval).await?;
                self.registry.cleanup().await
            };

            match tick.await {
                Ok(removed) if removed > 0 => {
                    tracing::debug!(removed = removed, "Registry cleanup pass");
                }
                Ok(_) => {}
                Err(e) if e.is_interrupted() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::error::Error;
    use crate::media::message::SharedMessage;

    #[tokio::test]
    async fn test_publish_twice_rejected() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        let _publisher = registry.publish(&key, 1).await.unwrap();

        // Can't register another publisher
        let result = registry.publish(&key, 2).await;
        assert!(matches!(result, Err(Error::AlreadyPublishing(_))));
    }

    #[tokio::test]
    async fn test_subscribe_and_receive() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");

        let publisher = registry.publish(&key, 1).await.unwrap();
        let consumer = registry.subscribe(&key).await.unwrap();
        assert!(consumer.dump_packets(0).is_empty());

        let frame = SharedMessage::video(0, Bytes::from_static(&[0x17, 0x01]), true, false);
        publisher.publish(&frame).unwrap();

        let received = consumer.dump_packets(0);
        assert_eq!(received.len(), 1);
        assert!(received[0].is_keyframe());

        drop(consumer);
        let stats = registry.stats(&key).await.unwrap().unwrap();
        assert_eq!(stats.consumers, 0);
    }

    #[tokio::test]
    async fn test_subscribe_before_publish() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "later");

        let consumer = registry.subscribe(&key).await.unwrap();
        assert_eq!(registry.stream_count().await.unwrap(), 1);

        let publisher = registry.publish(&key, 1).await.unwrap();
        publisher
            .publish(&SharedMessage::audio(0, Bytes::from_static(&[0xAF, 0x01]), false))
            .unwrap();

        assert_eq!(consumer.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_removes_idle() {
        let config = RegistryConfig::default().idle_stream_timeout(Duration::from_millis(10));
        let registry = StreamRegistry::with_config(config);
        let idle = StreamKey::new("live", "idle");
        let busy = StreamKey::new("live", "busy");

        registry.fetch_or_create(&idle).await.unwrap();
        let _publisher = registry.publish(&busy, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(registry.cleanup().await.unwrap(), 1);

        assert!(registry.find(&idle).await.unwrap().is_none());
        assert!(registry.find(&busy).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cleanup_spares_held_source() {
        let config = RegistryConfig::default().idle_stream_timeout(Duration::ZERO);
        let registry = StreamRegistry::with_config(config);
        let key = StreamKey::new("live", "held");

        let source = registry.fetch_or_create(&key).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.cleanup().await.unwrap(), 0);

        // The held source is still the one the registry hands out
        let publisher = source.on_publish(1).unwrap();
        assert!(matches!(
            registry.publish(&key, 2).await,
            Err(Error::AlreadyPublishing(_))
        ));
        assert!(Arc::ptr_eq(&registry.find(&key).await.unwrap().unwrap(), &source));

        drop(publisher);
        drop(source);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(registry.cleanup().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reload_reaches_sources() {
        let registry = StreamRegistry::new();
        let key = StreamKey::new("live", "test_stream");
        let source = registry.fetch_or_create(&key).await.unwrap();

        registry
            .reload(&StreamConfig::default().queue_max_length(5))
            .await
            .unwrap();

        let _publisher = source.on_publish(1).unwrap();
        assert_eq!(source.config().queue_max_length, 5);

        let other = registry.fetch_or_create(&StreamKey::new("live", "new")).await.unwrap();
        assert_eq!(other.config().queue_max_length, 5);
    }

    #[tokio::test]
    async fn test_cleanup_task_stops_on_interrupt() {
        let scheduler = Scheduler::current().unwrap();
        let config = RegistryConfig::default()
            .cleanup_interval(Duration::from_millis(5))
            .idle_stream_timeout(Duration::ZERO);
        let registry = Arc::new(StreamRegistry::with_config(config));

        registry.fetch_or_create(&StreamKey::new("live", "a")).await.unwrap();
        let mut task = registry.spawn_cleanup_task(&scheduler).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.stream_count().await.unwrap(), 0);

        task.stop().await.unwrap();
    }
}
