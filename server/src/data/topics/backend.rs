//! Topic backend trait definition
//!
//! Defines the interface for stream topic implementations (memory and Redis).
//! Streams are at-least-once: one consumer per message within a group, and a
//! message stays pending until it is acknowledged (committed).

use std::time::Duration;

use async_trait::async_trait;

use super::error::TopicError;

/// Message received from a stream with its ID for acknowledgment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    /// Unique message ID (Redis stream ID or memory sequence)
    pub id: String,
    /// Message payload, `None` when the entry was trimmed from the stream
    /// while still pending
    pub payload: Option<Vec<u8>>,
}

/// Which part of a consumer group a read is served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Messages already delivered to this consumer but never acknowledged
    Pending,
    /// Messages never delivered to any consumer of the group
    New,
}

/// Topic backend trait
///
/// Both in-memory and Redis backends implement this trait. Reads are
/// batch-oriented so the caller controls how much is in flight: nothing new
/// is delivered until the caller asks for the next batch.
#[async_trait]
pub trait TopicBackend: Send + Sync {
    /// Publish message to stream topic
    ///
    /// Returns the message ID. Messages persist until acknowledged.
    async fn stream_publish(&self, topic: &str, payload: &[u8]) -> Result<String, TopicError>;

    /// Create the consumer group for a stream if it does not exist yet
    ///
    /// A new group starts from the beginning of the stream so messages
    /// published before the first consumer are not lost.
    async fn ensure_group(&self, topic: &str, group: &str) -> Result<(), TopicError>;

    /// Read up to `count` messages for `consumer`
    ///
    /// `ReadCursor::New` blocks up to `block` when nothing is available and
    /// returns an empty batch on timeout. `ReadCursor::Pending` never blocks.
    async fn stream_read(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, TopicError>;

    /// Acknowledge a set of messages in a single call
    ///
    /// Removes the messages from the pending list so they are never
    /// re-delivered.
    async fn stream_ack(&self, topic: &str, group: &str, ids: &[String])
    -> Result<(), TopicError>;

    /// Claim pending messages that have been idle too long
    ///
    /// Used for recovery when consumers crash without acknowledging.
    async fn stream_claim(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, TopicError>;

    /// Get stream statistics for monitoring
    async fn stream_stats(&self, topic: &str, group: &str) -> Result<StreamStats, TopicError>;

    /// Health check (validates connection)
    async fn health_check(&self) -> Result<(), TopicError>;

    /// Backend name for debugging/logging
    fn backend_name(&self) -> &'static str;
}

/// Stream statistics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamStats {
    /// Total messages in the stream
    pub length: u64,
    /// Messages pending acknowledgment
    pub pending: u64,
    /// Number of consumers in the group
    pub consumers: u64,
    /// Oldest pending message age in milliseconds
    pub oldest_pending_ms: Option<u64>,
}
