//! Metrics pipeline
//!
//! Bus payloads are decoded into samples, merged per series by the
//! aggregator, and read back as immutable snapshots for exposition.

pub mod aggregate;
pub mod consumer;
pub mod decode;
pub mod naming;
pub mod stats;
pub mod types;

pub use aggregate::{Aggregator, ApplyRejection, ApplyResult};
pub use consumer::{ConsumerLoop, ConsumerSettings};
pub use decode::{DecodeError, DecodeOptions, decode};
pub use stats::{PipelineStats, StatsSnapshot};
pub use types::{
    HistogramValue, MetricFamily, MetricIdentity, MetricKind, MetricSample, SamplePayload,
    SeriesState, SeriesValue, Snapshot,
};
