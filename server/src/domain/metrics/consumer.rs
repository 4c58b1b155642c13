//! Bus consumer loop
//!
//! Single writer of the aggregator. Pulls a batch, decodes and applies every
//! message, then commits the whole batch. The next batch is pulled only after
//! the commit, so at most one batch is in flight.
//!
//! Delivery is at-least-once: a crash between apply and commit re-applies
//! the batch on restart. Gauges and histograms tolerate this; a counter may
//! see a redelivered lower raw value as a reset.
//!
//! A pull is never abandoned to do other work: a blocking Redis read that is
//! dropped can still hand messages to this consumer, which would then sit
//! unseen in its pending list. Claiming runs between pulls instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::aggregate::{Aggregator, ApplyResult};
use super::decode::{DecodeOptions, decode};
use super::stats::PipelineStats;
use crate::core::constants::{
    CLAIM_MAX_COUNT, DEFAULT_BATCH_SIZE, DEFAULT_BLOCK_MS, DEFAULT_CLAIM_INTERVAL_SECS,
    DEFAULT_CLAIM_MIN_IDLE_MS, READ_ERROR_BACKOFF_MS,
};
use crate::data::topics::{StreamMessage, StreamTopicSubscriber, TopicError};

/// Consumer loop tuning
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Maximum messages per pull
    pub batch_size: usize,
    /// How long a pull waits for new messages
    pub block: Duration,
    /// How often to look for messages abandoned by other consumers
    pub claim_interval: Duration,
    /// Minimum pending time before a message may be claimed
    pub claim_min_idle_ms: u64,
    /// Pause after a failed pull
    pub read_error_backoff: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            block: Duration::from_millis(DEFAULT_BLOCK_MS),
            claim_interval: Duration::from_secs(DEFAULT_CLAIM_INTERVAL_SECS),
            claim_min_idle_ms: DEFAULT_CLAIM_MIN_IDLE_MS,
            read_error_backoff: Duration::from_millis(READ_ERROR_BACKOFF_MS),
        }
    }
}

pub struct ConsumerLoop {
    aggregator: Arc<Aggregator>,
    stats: Arc<PipelineStats>,
    decode_options: DecodeOptions,
    settings: ConsumerSettings,
    /// Last ingestion sequence number handed out
    sequence: u64,
}

impl ConsumerLoop {
    pub fn new(
        aggregator: Arc<Aggregator>,
        stats: Arc<PipelineStats>,
        decode_options: DecodeOptions,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            aggregator,
            stats,
            decode_options,
            settings,
            sequence: 0,
        }
    }

    /// Spawn the loop
    ///
    /// The task ends once `shutdown_rx` turns true: it stops pulling, and a
    /// batch already pulled is applied and committed first.
    pub fn start(
        self,
        subscriber: StreamTopicSubscriber,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(subscriber, shutdown_rx))
    }

    async fn run(
        mut self,
        mut subscriber: StreamTopicSubscriber,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::debug!(
            topic = %subscriber.topic(),
            group = %subscriber.group(),
            consumer = %subscriber.consumer(),
            batch_size = self.settings.batch_size,
            "Consumer loop started"
        );

        let mut next_claim = Instant::now() + self.settings.claim_interval;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            if Instant::now() >= next_claim {
                self.claim_stuck_messages(&mut subscriber).await;
                next_claim = Instant::now() + self.settings.claim_interval;
            }

            tokio::select! {
                biased;
                // Only shutdown may interrupt a pull. Whatever the dropped
                // read delivered stays pending for this consumer and is
                // re-read on restart or claimed by another member.
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        tracing::debug!("Consumer loop received shutdown, draining...");
                        break;
                    }
                }
                result = subscriber.next_batch(self.settings.batch_size, self.settings.block) => {
                    match result {
                        Ok(batch) if batch.is_empty() => {}
                        Ok(batch) => self.process_batch(&mut subscriber, batch).await,
                        Err(e) => self.handle_read_error(&mut subscriber, e).await,
                    }
                }
            }
        }

        tracing::debug!(
            last_sequence = self.sequence,
            "Consumer loop drained and stopped"
        );
    }

    /// Apply every message of a batch, then commit all of them
    async fn process_batch(
        &mut self,
        subscriber: &mut StreamTopicSubscriber,
        batch: Vec<StreamMessage>,
    ) {
        self.stats.record_batch(batch.len());
        for msg in &batch {
            self.apply_message(msg);
        }

        let ids: Vec<String> = batch.into_iter().map(|m| m.id).collect();
        match subscriber.commit(&ids).await {
            Ok(()) => {
                tracing::trace!(count = ids.len(), "Committed batch");
                self.stats.record_commit(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, count = ids.len(), "Failed to commit batch, will be redelivered");
                self.stats.record_commit(false);
            }
        }
    }

    /// Decode one message and apply its samples
    ///
    /// An undecodable message is skipped as a whole and still committed, as is
    /// one whose payload was trimmed from the bus while pending.
    fn apply_message(&mut self, msg: &StreamMessage) {
        let Some(payload) = msg.payload.as_deref() else {
            tracing::warn!(msg_id = %msg.id, "Pending message was trimmed from the bus, skipping");
            self.stats.record_missing_payload();
            return;
        };
        let samples = match decode(payload, &self.decode_options) {
            Ok(samples) => samples,
            Err(e) => {
                tracing::warn!(
                    msg_id = %msg.id,
                    reason = e.reason_code(),
                    error = %e,
                    "Skipping undecodable message"
                );
                self.stats.record_decode_error(&e);
                return;
            }
        };

        for mut sample in samples {
            self.sequence += 1;
            sample.sequence = self.sequence;
            let result = self.aggregator.apply(sample);
            match &result {
                ApplyResult::Applied => {}
                ApplyResult::Reset { previous_value } => {
                    tracing::debug!(msg_id = %msg.id, previous_value, "Counter reset detected");
                }
                ApplyResult::Rejected(rejection) => {
                    tracing::debug!(
                        msg_id = %msg.id,
                        reason = rejection.reason_code(),
                        error = %rejection,
                        "Sample rejected"
                    );
                }
            }
            self.stats.record_apply(&result);
        }
    }

    async fn handle_read_error(&self, subscriber: &mut StreamTopicSubscriber, err: TopicError) {
        self.stats.record_read_error();
        match err {
            TopicError::ConsumerGroup(_) => {
                tracing::warn!(error = %err, "Consumer group lost, recreating...");
                if let Err(e) = subscriber.rejoin().await {
                    tracing::warn!(error = %e, "Failed to recreate consumer group");
                }
            }
            _ => {
                tracing::warn!(error = %err, "Bus read failed, retrying...");
            }
        }
        tokio::time::sleep(self.settings.read_error_backoff).await;
    }

    /// Take over messages other consumers of the group left pending
    async fn claim_stuck_messages(&mut self, subscriber: &mut StreamTopicSubscriber) {
        match subscriber
            .claim(self.settings.claim_min_idle_ms, CLAIM_MAX_COUNT)
            .await
        {
            Ok(messages) if messages.is_empty() => {
                tracing::trace!("No stuck messages to claim");
            }
            Ok(messages) => {
                let count = messages.len();
                tracing::debug!(count, "Claimed stuck messages");
                self.stats.record_claimed(count);
                self.process_batch(subscriber, messages).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to claim stuck messages");
            }
        }
    }
}
