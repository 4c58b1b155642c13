//! Pipeline counters
//!
//! Lock-free counters for throughput and every non-fatal failure class.
//! Exposed on `/metrics` as `metrics_exporter_*` and on `/health`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::aggregate::{ApplyRejection, ApplyResult};
use super::decode::DecodeError;

#[derive(Debug, Default)]
pub struct PipelineStats {
    messages: AtomicU64,
    batches: AtomicU64,
    samples_applied: AtomicU64,
    counter_resets: AtomicU64,
    malformed: AtomicU64,
    unsupported: AtomicU64,
    boundary_mismatch: AtomicU64,
    kind_mismatch: AtomicU64,
    naming_conflict: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    read_errors: AtomicU64,
    claimed: AtomicU64,
    evicted: AtomicU64,
    missing_payload: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages: u64,
    pub batches: u64,
    pub samples_applied: u64,
    pub counter_resets: u64,
    pub malformed: u64,
    pub unsupported: u64,
    pub boundary_mismatch: u64,
    pub kind_mismatch: u64,
    pub naming_conflict: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub read_errors: u64,
    pub claimed: u64,
    pub evicted: u64,
    pub missing_payload: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_batch(&self, messages: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(messages as u64, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self, err: &DecodeError) {
        match err {
            DecodeError::Malformed(_) => self.malformed.fetch_add(1, Ordering::Relaxed),
            DecodeError::UnsupportedKind(_) => self.unsupported.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_apply(&self, result: &ApplyResult) {
        match result {
            ApplyResult::Applied => {
                self.samples_applied.fetch_add(1, Ordering::Relaxed);
            }
            ApplyResult::Reset { .. } => {
                self.samples_applied.fetch_add(1, Ordering::Relaxed);
                self.counter_resets.fetch_add(1, Ordering::Relaxed);
            }
            ApplyResult::Rejected(ApplyRejection::BoundaryMismatch { .. }) => {
                self.boundary_mismatch.fetch_add(1, Ordering::Relaxed);
            }
            ApplyResult::Rejected(ApplyRejection::KindMismatch { .. }) => {
                self.kind_mismatch.fetch_add(1, Ordering::Relaxed);
            }
            // Name, label and reserved-name conflicts
            ApplyResult::Rejected(_) => {
                self.naming_conflict.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_commit(&self, ok: bool) {
        if ok {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commit_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_read_error(&self) {
        self.read_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_claimed(&self, count: usize) {
        self.claimed.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_missing_payload(&self) {
        self.missing_payload.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            samples_applied: self.samples_applied.load(Ordering::Relaxed),
            counter_resets: self.counter_resets.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            unsupported: self.unsupported.load(Ordering::Relaxed),
            boundary_mismatch: self.boundary_mismatch.load(Ordering::Relaxed),
            kind_mismatch: self.kind_mismatch.load(Ordering::Relaxed),
            naming_conflict: self.naming_conflict.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            missing_payload: self.missing_payload.load(Ordering::Relaxed),
        }
    }
}
