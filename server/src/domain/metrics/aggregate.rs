//! Time-series aggregation
//!
//! The aggregator owns one `SeriesState` per `MetricIdentity` in a sharded
//! concurrent map. Series are stored behind `Arc` and updated copy-on-write
//! (`Arc::make_mut`), so a snapshot holding the previous `Arc` never sees a
//! partially applied sample.
//!
//! Per exposed metric name the aggregator also records a schema: the source
//! name, the kind and, for histograms, the bucket bounds seen first. Later
//! samples must match it. Keying schemas by the sanitised name keeps two
//! source names from rendering as one family.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;

use super::naming::{LabelConflict, check_labels, is_reserved_name, sanitize_metric_name};
use super::types::{
    HistogramValue, MetricFamily, MetricIdentity, MetricKind, MetricSample, SamplePayload,
    SeriesState, SeriesValue, Snapshot,
};

/// Outcome of applying one sample
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyResult {
    Applied,
    /// Counter raw value went down; the new raw value was added on top
    Reset { previous_value: f64 },
    Rejected(ApplyRejection),
}

/// Why a sample was not applied
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApplyRejection {
    #[error("histogram {name} bucket bounds differ from first observation")]
    BoundaryMismatch { name: String },
    #[error("metric {name} is a {registered}, sample is a {received}")]
    KindMismatch {
        name: String,
        registered: MetricKind,
        received: MetricKind,
    },
    #[error("metric {name} is exposed as {exposed}, already taken by {existing}")]
    NameCollision {
        name: String,
        exposed: String,
        existing: String,
    },
    #[error("metric {name} is exposed as {exposed}, reserved for exporter metrics")]
    ReservedName { name: String, exposed: String },
    #[error("metric {name} has more than one label exposed as {label}")]
    LabelCollision { name: String, label: String },
    #[error("metric {name} uses reserved label {label}")]
    ReservedLabel { name: String, label: String },
}

impl ApplyRejection {
    /// Stable reason code for logs and counters
    pub fn reason_code(&self) -> &'static str {
        match self {
            ApplyRejection::BoundaryMismatch { .. } => "boundary_mismatch",
            ApplyRejection::KindMismatch { .. } => "kind_mismatch",
            ApplyRejection::NameCollision { .. } => "name_collision",
            ApplyRejection::ReservedName { .. } => "reserved_name",
            ApplyRejection::LabelCollision { .. } => "label_collision",
            ApplyRejection::ReservedLabel { .. } => "reserved_label",
        }
    }
}

/// What is fixed for a metric name on first observation
#[derive(Debug, Clone)]
struct MetricSchema {
    /// Source name that claimed the exposed name
    name: String,
    kind: MetricKind,
    bounds: Option<Vec<f64>>,
    description: Option<String>,
    unit: Option<String>,
}

/// Concurrent series store
#[derive(Default)]
pub struct Aggregator {
    series: DashMap<MetricIdentity, Arc<SeriesState>>,
    schemas: DashMap<String, MetricSchema>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one sample into its series
    pub fn apply(&self, sample: MetricSample) -> ApplyResult {
        if let Err(rejection) = self.check_schema(&sample) {
            return ApplyResult::Rejected(rejection);
        }

        match self.series.entry(sample.identity.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(new_series(sample)));
                ApplyResult::Applied
            }
            Entry::Occupied(mut entry) => {
                let state = Arc::make_mut(entry.get_mut());
                merge(state, sample)
            }
        }
    }

    /// Register the schema for a new name, or validate against the existing one
    fn check_schema(&self, sample: &MetricSample) -> Result<(), ApplyRejection> {
        let name = sample.identity.name();
        let exposed = sanitize_metric_name(name);
        if is_reserved_name(&exposed) {
            return Err(ApplyRejection::ReservedName {
                name: name.to_string(),
                exposed,
            });
        }
        check_labels(&sample.identity, sample.kind).map_err(|conflict| match conflict {
            LabelConflict::Duplicate(label) => ApplyRejection::LabelCollision {
                name: name.to_string(),
                label,
            },
            LabelConflict::Reserved(label) => ApplyRejection::ReservedLabel {
                name: name.to_string(),
                label,
            },
        })?;

        let bounds = match &sample.payload {
            SamplePayload::Histogram(h) => Some(&h.bounds),
            SamplePayload::Scalar(_) => None,
        };

        match self.schemas.entry(exposed) {
            Entry::Vacant(entry) => {
                entry.insert(MetricSchema {
                    name: name.to_string(),
                    kind: sample.kind,
                    bounds: bounds.cloned(),
                    description: sample.description.clone(),
                    unit: sample.unit.clone(),
                });
                Ok(())
            }
            Entry::Occupied(mut entry) => {
                let exposed = entry.key().clone();
                let schema = entry.get_mut();
                if schema.name != name {
                    return Err(ApplyRejection::NameCollision {
                        name: name.to_string(),
                        exposed,
                        existing: schema.name.clone(),
                    });
                }
                if schema.kind != sample.kind {
                    return Err(ApplyRejection::KindMismatch {
                        name: name.to_string(),
                        registered: schema.kind,
                        received: sample.kind,
                    });
                }
                if schema.bounds.as_ref() != bounds {
                    return Err(ApplyRejection::BoundaryMismatch {
                        name: name.to_string(),
                    });
                }
                if sample.description.is_some() {
                    schema.description.clone_from(&sample.description);
                }
                if sample.unit.is_some() {
                    schema.unit.clone_from(&sample.unit);
                }
                Ok(())
            }
        }
    }

    /// Immutable view of all series, grouped by name
    pub fn snapshot(&self) -> Snapshot {
        let mut grouped: BTreeMap<String, Vec<Arc<SeriesState>>> = BTreeMap::new();
        for entry in self.series.iter() {
            grouped
                .entry(entry.key().name().to_string())
                .or_default()
                .push(Arc::clone(entry.value()));
        }

        let families = grouped
            .into_iter()
            .map(|(name, mut series)| {
                series.sort_by(|a, b| a.identity.cmp(&b.identity));
                let schema = self
                    .schemas
                    .get(&sanitize_metric_name(&name))
                    .map(|s| s.value().clone());
                let kind = schema
                    .as_ref()
                    .map(|s| s.kind)
                    .unwrap_or_else(|| series[0].value.kind());
                MetricFamily {
                    kind,
                    description: schema.as_ref().and_then(|s| s.description.clone()),
                    unit: schema.and_then(|s| s.unit),
                    name,
                    series,
                }
            })
            .collect();

        Snapshot { families }
    }

    /// Remove series not updated within `max_age_nanos` of `now_nanos`
    ///
    /// Schemas are kept, so a returning series must still match its kind and
    /// bucket bounds. Series state is not: a returning counter starts a new
    /// series with its total back at 0, the same as after an exporter restart.
    pub fn evict_stale(&self, now_nanos: u64, max_age_nanos: u64) -> usize {
        let cutoff = now_nanos.saturating_sub(max_age_nanos);
        let before = self.series.len();
        self.series
            .retain(|_, state| state.last_updated_nanos >= cutoff);
        before.saturating_sub(self.series.len())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

fn new_series(sample: MetricSample) -> SeriesState {
    let value = match sample.payload {
        SamplePayload::Scalar(raw) => match sample.kind {
            MetricKind::Counter => SeriesValue::Counter {
                accumulated: 0.0,
                last_raw: raw,
            },
            _ => SeriesValue::Gauge { value: raw },
        },
        SamplePayload::Histogram(h) => SeriesValue::Histogram(h),
    };

    SeriesState {
        identity: sample.identity,
        value,
        first_seen_nanos: sample.timestamp_nanos,
        last_updated_nanos: sample.timestamp_nanos,
        last_sequence: sample.sequence,
    }
}

fn merge(state: &mut SeriesState, sample: MetricSample) -> ApplyResult {
    let result = match (&mut state.value, sample.payload) {
        (
            SeriesValue::Counter {
                accumulated,
                last_raw,
            },
            SamplePayload::Scalar(raw),
        ) => {
            if raw >= *last_raw {
                *accumulated += raw - *last_raw;
                *last_raw = raw;
                ApplyResult::Applied
            } else {
                let previous_value = *last_raw;
                *accumulated += raw;
                *last_raw = raw;
                ApplyResult::Reset { previous_value }
            }
        }
        (SeriesValue::Gauge { value }, SamplePayload::Scalar(raw)) => {
            *value = raw;
            ApplyResult::Applied
        }
        (SeriesValue::Histogram(current), SamplePayload::Histogram(incoming)) => {
            add_histogram(current, &incoming);
            ApplyResult::Applied
        }
        // Kind is fixed per name by the schema check
        (value, _) => {
            return ApplyResult::Rejected(ApplyRejection::KindMismatch {
                name: state.identity.name().to_string(),
                registered: value.kind(),
                received: sample.kind,
            });
        }
    };

    state.last_updated_nanos = state.last_updated_nanos.max(sample.timestamp_nanos);
    state.last_sequence = sample.sequence;
    result
}

fn add_histogram(current: &mut HistogramValue, incoming: &HistogramValue) {
    for (bucket, add) in current.bucket_counts.iter_mut().zip(&incoming.bucket_counts) {
        *bucket = bucket.saturating_add(*add);
    }
    current.sum += incoming.sum;
    current.count = current.count.saturating_add(incoming.count);
}
