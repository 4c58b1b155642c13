//! In-memory topic backend
//!
//! Stream topics backed by a `VecDeque` with simulated consumer groups:
//! a group-wide delivery cursor plus a pending list of delivered but
//! unacknowledged messages.
//!
//! ## Limitations
//!
//! This backend is suitable for local development, tests and single-process
//! deployments:
//! - Process crash = all messages lost (no persistence)
//! - Redelivery only happens within the process (a consumer that re-reads
//!   its pending list, or a claim after the idle timeout)
//!
//! For durability across restarts, use the Redis backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Notify;

use super::backend::{ReadCursor, StreamMessage, StreamStats, TopicBackend};
use super::error::TopicError;

/// Default stream max length (trimmed on publish)
const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

/// Message stored in memory stream
#[derive(Clone)]
struct StreamEntry {
    id: u64,
    payload: Vec<u8>,
}

/// Consumer group state for a stream
#[derive(Clone, Default)]
struct ConsumerGroup {
    /// Highest message ID handed out to any consumer of the group
    last_delivered: u64,
    /// Pending messages: message_id -> (consumer, delivery_time)
    pending: HashMap<u64, (String, Instant)>,
    /// Consumers that have read from the group
    consumers: HashSet<String>,
}

/// Stream state
#[derive(Clone)]
struct StreamState {
    messages: VecDeque<StreamEntry>,
    groups: HashMap<String, ConsumerGroup>,
    next_id: u64,
    max_len: usize,
}

impl StreamState {
    fn with_max_len(max_len: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            groups: HashMap::new(),
            next_id: 1,
            max_len,
        }
    }

    fn payload(&self, id: u64) -> Option<&[u8]> {
        self.messages
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.payload.as_slice())
    }
}

/// Shared state for memory backend
struct SharedState {
    streams: RwLock<HashMap<String, StreamState>>,
    /// Per-stream notifiers for immediate reader wakeup (avoids polling)
    stream_notifiers: RwLock<HashMap<String, Arc<Notify>>>,
    max_len: usize,
}

/// In-memory topic backend
#[derive(Clone)]
pub struct MemoryTopicBackend {
    state: Arc<SharedState>,
}

impl Default for MemoryTopicBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTopicBackend {
    /// Create a new in-memory topic backend
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_STREAM_MAX_LEN)
    }

    /// Create with a custom stream length cap
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            state: Arc::new(SharedState {
                streams: RwLock::new(HashMap::new()),
                stream_notifiers: RwLock::new(HashMap::new()),
                max_len,
            }),
        }
    }

    /// Trim stream to max length
    fn trim_stream(stream: &mut StreamState) {
        while stream.messages.len() > stream.max_len {
            if let Some(entry) = stream.messages.pop_front() {
                for group in stream.groups.values_mut() {
                    group.pending.remove(&entry.id);
                }
            }
        }
    }

    /// Get or create a Notify for a stream topic
    fn get_or_create_notifier(&self, topic: &str) -> Arc<Notify> {
        {
            let notifiers = self.state.stream_notifiers.read();
            if let Some(n) = notifiers.get(topic) {
                return Arc::clone(n);
            }
        }
        let mut notifiers = self.state.stream_notifiers.write();
        if let Some(n) = notifiers.get(topic) {
            return Arc::clone(n);
        }
        let n = Arc::new(Notify::new());
        notifiers.insert(topic.to_string(), Arc::clone(&n));
        n
    }

    /// Take up to `count` undelivered messages and mark them pending for `consumer`
    fn take_new(&self, topic: &str, group: &str, consumer: &str, count: usize) -> Vec<StreamMessage> {
        let mut streams = self.state.streams.write();
        let max_len = self.state.max_len;
        let stream = streams
            .entry(topic.to_string())
            .or_insert_with(|| StreamState::with_max_len(max_len));
        let StreamState {
            messages, groups, ..
        } = stream;
        let cg = groups.entry(group.to_string()).or_default();
        cg.consumers.insert(consumer.to_string());

        let now = Instant::now();
        let last_delivered = cg.last_delivered;
        let mut batch = Vec::new();
        for entry in messages.iter().filter(|e| e.id > last_delivered) {
            if batch.len() >= count {
                break;
            }
            cg.pending.insert(entry.id, (consumer.to_string(), now));
            batch.push(StreamMessage {
                id: entry.id.to_string(),
                payload: Some(entry.payload.clone()),
            });
        }
        if let Some(last) = batch.last().and_then(|m| m.id.parse::<u64>().ok()) {
            cg.last_delivered = last;
        }
        batch
    }

    /// Re-deliver messages this consumer received but never acknowledged
    fn take_pending(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Vec<StreamMessage> {
        let mut streams = self.state.streams.write();
        let Some(stream) = streams.get_mut(topic) else {
            return Vec::new();
        };
        let StreamState {
            messages, groups, ..
        } = stream;
        let Some(cg) = groups.get_mut(group) else {
            return Vec::new();
        };
        cg.consumers.insert(consumer.to_string());

        let mut ids: Vec<u64> = cg
            .pending
            .iter()
            .filter(|(_, (owner, _))| owner == consumer)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids.truncate(count);

        let now = Instant::now();
        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let payload = messages.iter().find(|e| e.id == id).map(|e| e.payload.clone());
            cg.pending.insert(id, (consumer.to_string(), now));
            batch.push(StreamMessage {
                id: id.to_string(),
                payload,
            });
        }
        batch
    }
}

#[async_trait]
impl TopicBackend for MemoryTopicBackend {
    async fn stream_publish(&self, topic: &str, payload: &[u8]) -> Result<String, TopicError> {
        let id = {
            let mut streams = self.state.streams.write();
            let max_len = self.state.max_len;
            let stream = streams
                .entry(topic.to_string())
                .or_insert_with(|| StreamState::with_max_len(max_len));

            let id = stream.next_id;
            stream.next_id += 1;

            stream.messages.push_back(StreamEntry {
                id,
                payload: payload.to_vec(),
            });

            Self::trim_stream(stream);
            id
        };

        self.get_or_create_notifier(topic).notify_waiters();

        Ok(id.to_string())
    }

    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), TopicError> {
        let mut streams = self.state.streams.write();
        let max_len = self.state.max_len;
        let stream = streams
            .entry(topic.to_string())
            .or_insert_with(|| StreamState::with_max_len(max_len));
        stream.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn stream_read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, TopicError> {
        if cursor == ReadCursor::Pending {
            return Ok(self.take_pending(topic, group, consumer, count));
        }

        let notifier = self.get_or_create_notifier(topic);
        let deadline = tokio::time::Instant::now() + block;

        loop {
            // Register for wakeup before checking, so a publish in between is not missed
            let notified = notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.take_new(topic, group, consumer, count);
            if !batch.is_empty() {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn stream_ack(
        &self,
        topic: &str,
        group: &str,
        ids: &[String],
    ) -> Result<(), TopicError> {
        if ids.is_empty() {
            return Ok(());
        }

        let mut streams = self.state.streams.write();
        let stream = streams
            .get_mut(topic)
            .ok_or_else(|| TopicError::Stream(format!("stream not found: {}", topic)))?;

        let cg = stream.groups.get_mut(group).ok_or_else(|| {
            TopicError::ConsumerGroup(format!("consumer group not found: {}", group))
        })?;

        for id in ids {
            let id: u64 = id
                .parse()
                .map_err(|_| TopicError::Stream(format!("invalid message id: {}", id)))?;
            cg.pending.remove(&id);
        }
        Ok(())
    }

    async fn stream_claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, TopicError> {
        let mut streams = self.state.streams.write();
        let Some(stream) = streams.get_mut(topic) else {
            return Ok(vec![]);
        };

        let now = Instant::now();
        let min_idle = Duration::from_millis(min_idle_ms);

        let mut idle_ids: Vec<u64> = match stream.groups.get(group) {
            Some(cg) => cg
                .pending
                .iter()
                .filter(|(_, (_, delivered))| now.duration_since(*delivered) >= min_idle)
                .map(|(&id, _)| id)
                .collect(),
            None => return Ok(vec![]),
        };
        idle_ids.sort_unstable();
        idle_ids.truncate(count);

        let mut claimed = Vec::with_capacity(idle_ids.len());
        for id in idle_ids {
            let payload = stream.payload(id).map(<[u8]>::to_vec);
            if let Some(cg) = stream.groups.get_mut(group) {
                cg.pending.insert(id, (consumer.to_string(), now));
                cg.consumers.insert(consumer.to_string());
            }
            claimed.push(StreamMessage {
                id: id.to_string(),
                payload,
            });
        }

        Ok(claimed)
    }

    async fn stream_stats(&self, topic: &str, group: &str) -> Result<StreamStats, TopicError> {
        let streams = self.state.streams.read();
        let Some(stream) = streams.get(topic) else {
            return Ok(StreamStats::default());
        };

        let Some(cg) = stream.groups.get(group) else {
            return Ok(StreamStats {
                length: stream.messages.len() as u64,
                ..Default::default()
            });
        };

        let now = Instant::now();
        let oldest_pending_ms = cg
            .pending
            .values()
            .map(|(_, delivered)| now.duration_since(*delivered).as_millis() as u64)
            .max();

        Ok(StreamStats {
            length: stream.messages.len() as u64,
            pending: cg.pending.len() as u64,
            consumers: cg.consumers.len() as u64,
            oldest_pending_ms,
        })
    }

    async fn health_check(&self) -> Result<(), TopicError> {
        // In-memory backend is always healthy
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NO_BLOCK: Duration = Duration::from_millis(0);

    async fn read_new(backend: &MemoryTopicBackend, consumer: &str, count: usize) -> Vec<StreamMessage> {
        backend
            .stream_read("stream", "group1", consumer, ReadCursor::New, count, NO_BLOCK)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_stream_publish_read_ack() {
        let backend = MemoryTopicBackend::new();

        let id = backend.stream_publish("stream", b"msg1").await.unwrap();
        assert_eq!(id, "1");

        backend.ensure_group("stream", "group1").await.unwrap();
        let batch = read_new(&backend, "consumer1", 10).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, "1");
        assert_eq!(batch[0].payload.as_deref(), Some(&b"msg1"[..]));

        let stats = backend.stream_stats("stream", "group1").await.unwrap();
        assert_eq!(stats.pending, 1);

        backend
            .stream_ack("stream", "group1", &[batch[0].id.clone()])
            .await
            .unwrap();

        let stats = backend.stream_stats("stream", "group1").await.unwrap();
        assert_eq!(stats.length, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.consumers, 1);
    }

    #[tokio::test]
    async fn test_read_respects_batch_size() {
        let backend = MemoryTopicBackend::new();
        for i in 0..5 {
            backend
                .stream_publish("stream", format!("m{i}").as_bytes())
                .await
                .unwrap();
        }

        let first = read_new(&backend, "c", 2).await;
        let second = read_new(&backend, "c", 2).await;
        let third = read_new(&backend, "c", 2).await;
        let ids: Vec<_> = first
            .iter()
            .chain(&second)
            .chain(&third)
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3", "4", "5"]);
        assert!(read_new(&backend, "c", 2).await.is_empty());
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered_from_pending() {
        let backend = MemoryTopicBackend::new();
        backend.stream_publish("stream", b"a").await.unwrap();
        backend.stream_publish("stream", b"b").await.unwrap();

        let batch = read_new(&backend, "c", 10).await;
        assert_eq!(batch.len(), 2);

        // Consumer "crashes" before acknowledging; on restart it reads its pending list
        let redelivered = backend
            .stream_read("stream", "group1", "c", ReadCursor::Pending, 10, NO_BLOCK)
            .await
            .unwrap();
        assert_eq!(redelivered, batch);

        // New cursor does not hand the same messages out again
        assert!(read_new(&backend, "c", 10).await.is_empty());

        let ids: Vec<String> = redelivered.iter().map(|m| m.id.clone()).collect();
        backend.stream_ack("stream", "group1", &ids).await.unwrap();
        let pending = backend
            .stream_read("stream", "group1", "c", ReadCursor::Pending, 10, NO_BLOCK)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_pending_is_per_consumer() {
        let backend = MemoryTopicBackend::new();
        backend.stream_publish("stream", b"a").await.unwrap();
        let _ = read_new(&backend, "c1", 10).await;

        let other = backend
            .stream_read("stream", "group1", "c2", ReadCursor::Pending, 10, NO_BLOCK)
            .await
            .unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_read_times_out_with_empty_batch() {
        let backend = MemoryTopicBackend::new();
        let batch = backend
            .stream_read(
                "stream",
                "group1",
                "c",
                ReadCursor::New,
                10,
                Duration::from_millis(20),
            )
            .await
            .unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_publish() {
        let backend = MemoryTopicBackend::new();
        let reader = backend.clone();
        let handle = tokio::spawn(async move {
            reader
                .stream_read(
                    "stream",
                    "group1",
                    "c",
                    ReadCursor::New,
                    10,
                    Duration::from_secs(5),
                )
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        backend.stream_publish("stream", b"late").await.unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_claim_idle_messages() {
        let backend = MemoryTopicBackend::new();
        backend.stream_publish("stream", b"stuck").await.unwrap();
        let _ = read_new(&backend, "crashed", 10).await;

        let claimed = backend
            .stream_claim("stream", "group1", "rescuer", 0, 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload.as_deref(), Some(&b"stuck"[..]));

        // Now pending for the rescuer, not the crashed consumer
        let crashed_pending = backend
            .stream_read("stream", "group1", "crashed", ReadCursor::Pending, 10, NO_BLOCK)
            .await
            .unwrap();
        assert!(crashed_pending.is_empty());
    }

    #[tokio::test]
    async fn test_claim_skips_recent_messages() {
        let backend = MemoryTopicBackend::new();
        backend.stream_publish("stream", b"fresh").await.unwrap();
        let _ = read_new(&backend, "c", 10).await;

        let claimed = backend
            .stream_claim("stream", "group1", "other", 60_000, 10)
            .await
            .unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn test_trim_drops_oldest_and_their_pending() {
        let backend = MemoryTopicBackend::with_max_len(2);
        backend.stream_publish("stream", b"1").await.unwrap();
        let _ = read_new(&backend, "c", 1).await;
        backend.stream_publish("stream", b"2").await.unwrap();
        backend.stream_publish("stream", b"3").await.unwrap();

        let stats = backend.stream_stats("stream", "group1").await.unwrap();
        assert_eq!(stats.length, 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_ack_unknown_stream_fails() {
        let backend = MemoryTopicBackend::new();
        let result = backend
            .stream_ack("missing", "group1", &["1".to_string()])
            .await;
        assert!(matches!(result, Err(TopicError::Stream(_))));
    }

    #[tokio::test]
    async fn test_ack_invalid_id_fails() {
        let backend = MemoryTopicBackend::new();
        backend.ensure_group("stream", "group1").await.unwrap();
        let result = backend
            .stream_ack("stream", "group1", &["not-a-number".to_string()])
            .await;
        assert!(matches!(result, Err(TopicError::Stream(_))));
    }

    #[test]
    fn test_backend_name() {
        let backend = MemoryTopicBackend::new();
        assert_eq!(backend.backend_name(), "memory");
    }
}
