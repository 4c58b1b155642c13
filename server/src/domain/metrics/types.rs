//! Metric data model
//!
//! `MetricSample` is what the decoder produces and the aggregator consumes.
//! `SeriesState` is the aggregator's per-series record, shared read-only with
//! snapshots through `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

/// Series key: metric name plus its label set
///
/// Labels are kept sorted by key with unique keys, so two identities built
/// from the same name and label set compare equal regardless of input order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricIdentity {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricIdentity {
    /// Build an identity; a repeated label key keeps its last value
    pub fn new<I>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let labels: BTreeMap<String, String> = labels.into_iter().collect();
        Self {
            name: name.into(),
            labels: labels.into_iter().collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Labels sorted by key
    pub fn labels(&self) -> &[(String, String)] {
        &self.labels
    }
}

/// Aggregation semantics of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Monotonic cumulative total; reset-aware
    Counter,
    /// Last applied value wins
    Gauge,
    /// Bucket counts, sum and count; additive
    Histogram,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Explicit-bucket histogram value
///
/// `bucket_counts[i]` counts observations in `(bounds[i-1], bounds[i]]`, the
/// last bucket is `(bounds[last], +Inf)`. So `bucket_counts.len() ==
/// bounds.len() + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramValue {
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub sum: f64,
    pub count: u64,
}

/// Numeric payload of a sample
#[derive(Debug, Clone, PartialEq)]
pub enum SamplePayload {
    Scalar(f64),
    Histogram(HistogramValue),
}

/// One decoded data point
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub identity: MetricIdentity,
    pub kind: MetricKind,
    pub payload: SamplePayload,
    /// Source timestamp, nanoseconds since Unix epoch
    pub timestamp_nanos: u64,
    /// Ingestion order, assigned by the consumer loop
    pub sequence: u64,
    pub description: Option<String>,
    pub unit: Option<String>,
}

/// Accumulated value of a series
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesValue {
    Counter {
        /// Exposed total; never decreases
        accumulated: f64,
        /// Last raw cumulative value reported by the source
        last_raw: f64,
    },
    Gauge {
        value: f64,
    },
    Histogram(HistogramValue),
}

impl SeriesValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            SeriesValue::Counter { .. } => MetricKind::Counter,
            SeriesValue::Gauge { .. } => MetricKind::Gauge,
            SeriesValue::Histogram(_) => MetricKind::Histogram,
        }
    }
}

/// Per-series state owned by the aggregator
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesState {
    pub identity: MetricIdentity,
    pub value: SeriesValue,
    pub first_seen_nanos: u64,
    /// Newest source timestamp applied
    pub last_updated_nanos: u64,
    /// Sequence number of the last applied sample
    pub last_sequence: u64,
}

/// All series sharing one metric name
#[derive(Debug, Clone)]
pub struct MetricFamily {
    pub name: String,
    pub kind: MetricKind,
    pub description: Option<String>,
    pub unit: Option<String>,
    /// Sorted by identity
    pub series: Vec<Arc<SeriesState>>,
}

/// Immutable point-in-time view of the aggregator
///
/// Series are shared with the aggregator; later writes replace the
/// aggregator's `Arc` and never touch a snapshot's copy.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Sorted by name
    pub families: Vec<MetricFamily>,
}

impl Snapshot {
    pub fn series_count(&self) -> usize {
        self.families.iter().map(|f| f.series.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Look up one series
    pub fn get(&self, identity: &MetricIdentity) -> Option<&SeriesState> {
        self.families
            .iter()
            .find(|f| f.name == identity.name())?
            .series
            .iter()
            .find(|s| &s.identity == identity)
            .map(Arc::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_identity_label_order_does_not_matter() {
        let a = MetricIdentity::new("http_requests", labels(&[("method", "GET"), ("code", "200")]));
        let b = MetricIdentity::new("http_requests", labels(&[("code", "200"), ("method", "GET")]));
        assert_eq!(a, b);
        assert_eq!(a.labels()[0].0, "code");
    }

    #[test]
    fn test_identity_duplicate_key_keeps_last() {
        let id = MetricIdentity::new("m", labels(&[("k", "first"), ("k", "second")]));
        assert_eq!(id.labels(), &[("k".to_string(), "second".to_string())]);
    }

    #[test]
    fn test_identity_differs_by_labels() {
        let a = MetricIdentity::new("m", labels(&[("k", "a")]));
        let b = MetricIdentity::new("m", labels(&[("k", "b")]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MetricKind::Counter.to_string(), "counter");
        assert_eq!(
            SeriesValue::Gauge { value: 1.0 }.kind(),
            MetricKind::Gauge
        );
    }

    #[test]
    fn test_snapshot_get() {
        let id = MetricIdentity::new("m", labels(&[("k", "a")]));
        let state = Arc::new(SeriesState {
            identity: id.clone(),
            value: SeriesValue::Gauge { value: 3.0 },
            first_seen_nanos: 1,
            last_updated_nanos: 1,
            last_sequence: 0,
        });
        let snapshot = Snapshot {
            families: vec![MetricFamily {
                name: "m".into(),
                kind: MetricKind::Gauge,
                description: None,
                unit: None,
                series: vec![state],
            }],
        };
        assert_eq!(snapshot.series_count(), 1);
        assert!(snapshot.get(&id).is_some());
        assert!(snapshot.get(&MetricIdentity::new("m", Vec::new())).is_none());
    }
}
