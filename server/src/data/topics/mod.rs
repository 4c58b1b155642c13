//! Message bus topics
//!
//! Stream messaging with pluggable backends:
//! - In-memory (default) - local-only, for development and single-process
//! - Redis - Redis Streams, for deployments where producers live elsewhere
//!
//! Stream topics give at-least-once delivery with consumer groups. A
//! delivered message stays pending for its consumer until it is committed;
//! a restarted consumer re-reads its own pending messages before new ones,
//! and messages abandoned by a crashed consumer can be claimed by another.
//!
//! ## Configuration
//!
//! - `bus.backend = "memory"` → in-memory streams
//! - `bus.backend = "redis"` → Redis Streams (`bus.redis_url` required)

mod backend;
mod error;
mod memory;
mod redis;

use std::sync::Arc;
use std::time::Duration;

use prost::Message as ProstMessage;

pub use backend::{ReadCursor, StreamMessage, StreamStats, TopicBackend};
pub use error::TopicError;
pub use memory::MemoryTopicBackend;
pub use redis::RedisTopicBackend;

use crate::core::config::{BusBackend, BusConfig};

// ============================================================================
// TOPIC SERVICE
// ============================================================================

/// Central topic service - owns the bus backend
#[derive(Clone)]
pub struct TopicService {
    backend: Arc<dyn TopicBackend>,
}

impl TopicService {
    /// Create a topic service with the in-memory backend
    pub fn memory() -> Self {
        Self::with_backend(Arc::new(MemoryTopicBackend::new()))
    }

    /// Create a topic service on top of an existing backend
    pub fn with_backend(backend: Arc<dyn TopicBackend>) -> Self {
        Self { backend }
    }

    /// Connect to the configured backend and verify it is reachable
    pub async fn connect(config: &BusConfig) -> Result<Self, TopicError> {
        let backend: Arc<dyn TopicBackend> = match config.backend {
            BusBackend::Memory => Arc::new(MemoryTopicBackend::new()),
            BusBackend::Redis => {
                let url = config.redis_url.as_deref().ok_or_else(|| {
                    TopicError::Config("redis_url required for Redis backend".into())
                })?;
                tracing::debug!(url = %redis::sanitize_redis_url(url), "Connecting to Redis bus");
                Arc::new(RedisTopicBackend::new(url).await?)
            }
        };

        backend.health_check().await?;
        Ok(Self { backend })
    }

    /// Get the backend name
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Handle to a stream topic
    pub fn stream_topic(&self, name: &str) -> StreamTopic {
        StreamTopic {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Health check
    pub async fn health_check(&self) -> Result<(), TopicError> {
        self.backend.health_check().await
    }
}

// ============================================================================
// STREAM TOPIC (at-least-once)
// ============================================================================

/// Stream topic for at-least-once delivery
#[derive(Clone)]
pub struct StreamTopic {
    name: String,
    backend: Arc<dyn TopicBackend>,
}

impl StreamTopic {
    /// Publish a raw payload to the stream
    ///
    /// Returns the message ID for tracking.
    pub async fn publish(&self, payload: &[u8]) -> Result<String, TopicError> {
        self.backend.stream_publish(&self.name, payload).await
    }

    /// Publish a protobuf message to the stream
    pub async fn publish_message<M: ProstMessage>(&self, msg: &M) -> Result<String, TopicError> {
        self.publish(&msg.encode_to_vec()).await
    }

    /// Join a consumer group as `consumer`
    ///
    /// Creates the group when it does not exist yet. The subscriber starts in
    /// recovery mode and re-reads its own pending messages first.
    pub async fn subscribe(
        &self,
        group: &str,
        consumer: &str,
    ) -> Result<StreamTopicSubscriber, TopicError> {
        self.backend.ensure_group(&self.name, group).await?;
        Ok(StreamTopicSubscriber {
            name: self.name.clone(),
            group: group.to_string(),
            consumer: consumer.to_string(),
            backend: Arc::clone(&self.backend),
            recovering: true,
        })
    }

    /// Get stream statistics for a consumer group
    pub async fn stats(&self, group: &str) -> Result<StreamStats, TopicError> {
        self.backend.stream_stats(&self.name, group).await
    }

    /// Get the topic name
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Member of a consumer group on a stream topic
pub struct StreamTopicSubscriber {
    name: String,
    group: String,
    consumer: String,
    backend: Arc<dyn TopicBackend>,
    /// Serve own pending messages before new ones
    recovering: bool,
}

impl StreamTopicSubscriber {
    /// Pull the next batch of at most `max` messages
    ///
    /// While recovering, pending messages are returned without blocking. Once
    /// the pending list is empty, new messages are read, blocking up to
    /// `block`. An empty batch means the block time elapsed.
    pub async fn next_batch(
        &mut self,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, TopicError> {
        if self.recovering {
            let pending = self
                .backend
                .stream_read(
                    &self.name,
                    &self.group,
                    &self.consumer,
                    ReadCursor::Pending,
                    max,
                    Duration::ZERO,
                )
                .await?;
            if !pending.is_empty() {
                tracing::debug!(
                    topic = %self.name,
                    count = pending.len(),
                    "Re-reading pending messages"
                );
                return Ok(pending);
            }
            self.recovering = false;
        }

        self.backend
            .stream_read(
                &self.name,
                &self.group,
                &self.consumer,
                ReadCursor::New,
                max,
                block,
            )
            .await
    }

    /// Commit (acknowledge) a batch of messages
    ///
    /// On failure the messages stay pending for this consumer and the next
    /// pull re-reads them.
    pub async fn commit(&mut self, ids: &[String]) -> Result<(), TopicError> {
        let result = self.backend.stream_ack(&self.name, &self.group, ids).await;
        if result.is_err() {
            self.recovering = true;
        }
        result
    }

    /// Re-create the consumer group after it was lost (e.g. stream key deleted)
    ///
    /// Returns to recovery mode so anything still pending is re-read first.
    pub async fn rejoin(&mut self) -> Result<(), TopicError> {
        self.backend.ensure_group(&self.name, &self.group).await?;
        self.recovering = true;
        Ok(())
    }

    /// Claim messages other consumers left pending for at least `min_idle_ms`
    pub async fn claim(
        &self,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, TopicError> {
        self.backend
            .stream_claim(&self.name, &self.group, &self.consumer, min_idle_ms, count)
            .await
    }

    /// Get stream statistics for this consumer group
    pub async fn stats(&self) -> Result<StreamStats, TopicError> {
        self.backend.stream_stats(&self.name, &self.group).await
    }

    pub fn topic(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}
