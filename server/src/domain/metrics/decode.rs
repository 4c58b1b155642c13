//! Bus payload decoding
//!
//! A bus message carries one protobuf `ExportMetricsServiceRequest`. Every
//! data point becomes one `MetricSample`. The message is the unit of skip:
//! if any point is invalid the whole message is rejected and nothing from it
//! reaches the aggregator.

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::KeyValue;
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, HistogramDataPoint, Metric, NumberDataPoint, metric::Data,
    number_data_point,
};
use prost::Message;
use thiserror::Error;

use super::types::{HistogramValue, MetricIdentity, MetricKind, MetricSample, SamplePayload};
use crate::utils::otlp::extract_attributes;

/// Why a message was rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// Not valid protobuf, or a required field is missing or out of range
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// Well-formed but of a kind the aggregator cannot represent
    #[error("unsupported metric kind: {0}")]
    UnsupportedKind(String),
}

impl DecodeError {
    /// Stable reason code for logs and counters
    pub fn reason_code(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "malformed",
            DecodeError::UnsupportedKind(_) => "unsupported_kind",
        }
    }
}

impl From<prost::DecodeError> for DecodeError {
    fn from(err: prost::DecodeError) -> Self {
        DecodeError::Malformed(err.to_string())
    }
}

/// Decoder settings
#[derive(Debug, Clone, Default)]
pub struct DecodeOptions {
    /// Resource attribute keys copied onto every series as labels
    ///
    /// Data point attributes win when both define the same key.
    pub resource_labels: Vec<String>,
}

/// Decode one raw bus message
pub fn decode(raw: &[u8], options: &DecodeOptions) -> Result<Vec<MetricSample>, DecodeError> {
    let request = ExportMetricsServiceRequest::decode(raw)?;
    decode_request(&request, options)
}

/// Decode an already parsed request
pub fn decode_request(
    request: &ExportMetricsServiceRequest,
    options: &DecodeOptions,
) -> Result<Vec<MetricSample>, DecodeError> {
    let mut samples = Vec::new();

    for resource_metrics in &request.resource_metrics {
        let promoted: Vec<(String, String)> = resource_metrics
            .resource
            .as_ref()
            .map(|r| {
                extract_attributes(&r.attributes)
                    .into_iter()
                    .filter(|(k, _)| options.resource_labels.iter().any(|l| l == k))
                    .collect()
            })
            .unwrap_or_default();

        for scope_metrics in &resource_metrics.scope_metrics {
            for metric in &scope_metrics.metrics {
                decode_metric(metric, &promoted, &mut samples)?;
            }
        }
    }

    Ok(samples)
}

/// Metric-level fields shared by all of its points
struct MetricBase<'a> {
    name: &'a str,
    description: Option<String>,
    unit: Option<String>,
    promoted: &'a [(String, String)],
}

impl MetricBase<'_> {
    fn identity(&self, attrs: &[KeyValue]) -> MetricIdentity {
        let labels = self
            .promoted
            .iter()
            .cloned()
            .chain(extract_attributes(attrs));
        MetricIdentity::new(self.name, labels)
    }

    fn sample(
        &self,
        attrs: &[KeyValue],
        kind: MetricKind,
        payload: SamplePayload,
        timestamp_nanos: u64,
    ) -> MetricSample {
        MetricSample {
            identity: self.identity(attrs),
            kind,
            payload,
            timestamp_nanos,
            sequence: 0,
            description: self.description.clone(),
            unit: self.unit.clone(),
        }
    }
}

fn decode_metric(
    metric: &Metric,
    promoted: &[(String, String)],
    out: &mut Vec<MetricSample>,
) -> Result<(), DecodeError> {
    if metric.name.is_empty() {
        return Err(DecodeError::Malformed("metric name is empty".into()));
    }
    let name = metric.name.as_str();
    let data = metric
        .data
        .as_ref()
        .ok_or_else(|| DecodeError::Malformed(format!("metric {name} has no data")))?;

    let base = MetricBase {
        name,
        description: (!metric.description.is_empty()).then(|| metric.description.clone()),
        unit: (!metric.unit.is_empty()).then(|| metric.unit.clone()),
        promoted,
    };

    match data {
        Data::Gauge(gauge) => {
            for dp in &gauge.data_points {
                out.push(decode_number(&base, dp, MetricKind::Gauge)?);
            }
        }
        Data::Sum(sum) => {
            if is_delta(sum.aggregation_temporality) {
                return Err(DecodeError::UnsupportedKind(format!(
                    "delta sum {name}"
                )));
            }
            let kind = if sum.is_monotonic {
                MetricKind::Counter
            } else {
                MetricKind::Gauge
            };
            for dp in &sum.data_points {
                out.push(decode_number(&base, dp, kind)?);
            }
        }
        Data::Histogram(histogram) => {
            if is_delta(histogram.aggregation_temporality) {
                return Err(DecodeError::UnsupportedKind(format!(
                    "delta histogram {name}"
                )));
            }
            for dp in &histogram.data_points {
                out.push(decode_histogram(&base, dp)?);
            }
        }
        Data::ExponentialHistogram(_) => {
            return Err(DecodeError::UnsupportedKind(format!(
                "exponential histogram {name}"
            )));
        }
        Data::Summary(_) => {
            return Err(DecodeError::UnsupportedKind(format!("summary {name}")));
        }
    }

    Ok(())
}

/// Unspecified temporality is read as cumulative
fn is_delta(temporality: i32) -> bool {
    temporality == AggregationTemporality::Delta as i32
}

fn require_timestamp(name: &str, time_unix_nano: u64) -> Result<u64, DecodeError> {
    if time_unix_nano == 0 {
        return Err(DecodeError::Malformed(format!(
            "data point of {name} has no timestamp"
        )));
    }
    Ok(time_unix_nano)
}

fn decode_number(
    base: &MetricBase<'_>,
    dp: &NumberDataPoint,
    kind: MetricKind,
) -> Result<MetricSample, DecodeError> {
    let name = base.name;
    let timestamp = require_timestamp(name, dp.time_unix_nano)?;

    let value = match dp.value {
        Some(number_data_point::Value::AsDouble(d)) => d,
        Some(number_data_point::Value::AsInt(i)) => i as f64,
        None => {
            return Err(DecodeError::Malformed(format!(
                "data point of {name} has no value"
            )));
        }
    };

    if kind == MetricKind::Counter && !(value.is_finite() && value >= 0.0) {
        return Err(DecodeError::Malformed(format!(
            "counter {name} has invalid value {value}"
        )));
    }

    Ok(base.sample(
        &dp.attributes,
        kind,
        SamplePayload::Scalar(value),
        timestamp,
    ))
}

fn decode_histogram(
    base: &MetricBase<'_>,
    dp: &HistogramDataPoint,
) -> Result<MetricSample, DecodeError> {
    let name = base.name;
    let timestamp = require_timestamp(name, dp.time_unix_nano)?;

    let bounds = &dp.explicit_bounds;
    if bounds.iter().any(|b| !b.is_finite()) {
        return Err(DecodeError::Malformed(format!(
            "histogram {name} has non-finite bucket bound"
        )));
    }
    if bounds.windows(2).any(|w| w[0] >= w[1]) {
        return Err(DecodeError::Malformed(format!(
            "histogram {name} bucket bounds are not strictly increasing"
        )));
    }
    if dp.bucket_counts.len() != bounds.len() + 1 {
        return Err(DecodeError::Malformed(format!(
            "histogram {name} has {} bucket counts for {} bounds",
            dp.bucket_counts.len(),
            bounds.len()
        )));
    }
    let bucket_total = dp
        .bucket_counts
        .iter()
        .try_fold(0u64, |acc, c| acc.checked_add(*c))
        .ok_or_else(|| {
            DecodeError::Malformed(format!("histogram {name} bucket counts overflow"))
        })?;
    if bucket_total != dp.count {
        return Err(DecodeError::Malformed(format!(
            "histogram {name} count {} does not match bucket total {bucket_total}",
            dp.count
        )));
    }

    let payload = SamplePayload::Histogram(HistogramValue {
        bounds: bounds.clone(),
        bucket_counts: dp.bucket_counts.clone(),
        sum: dp.sum.unwrap_or(0.0),
        count: dp.count,
    });

    Ok(base.sample(&dp.attributes, MetricKind::Histogram, payload, timestamp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::metrics::v1::{
        ExponentialHistogram, Gauge, Histogram, ResourceMetrics, ScopeMetrics, Sum, Summary,
    };
    use opentelemetry_proto::tonic::resource::v1::Resource;

    use crate::utils::otlp::string_attr;

    const TS: u64 = 1_700_000_000_000_000_000;

    fn request(resource_attrs: Vec<KeyValue>, metrics: Vec<Metric>) -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: Some(Resource {
                    attributes: resource_attrs,
                    ..Default::default()
                }),
                scope_metrics: vec![ScopeMetrics {
                    metrics,
                    ..Default::default()
                }],
                ..Default::default()
            }],
        }
    }

    fn number_point(value: number_data_point::Value, attrs: Vec<KeyValue>) -> NumberDataPoint {
        NumberDataPoint {
            attributes: attrs,
            time_unix_nano: TS,
            value: Some(value),
            ..Default::default()
        }
    }

    fn metric(name: &str, data: Data) -> Metric {
        Metric {
            name: name.to_string(),
            data: Some(data),
            ..Default::default()
        }
    }

    fn gauge(name: &str, value: f64) -> Metric {
        metric(
            name,
            Data::Gauge(Gauge {
                data_points: vec![number_point(
                    number_data_point::Value::AsDouble(value),
                    vec![],
                )],
            }),
        )
    }

    fn sum(name: &str, monotonic: bool, temporality: AggregationTemporality, value: f64) -> Metric {
        metric(
            name,
            Data::Sum(Sum {
                data_points: vec![number_point(
                    number_data_point::Value::AsDouble(value),
                    vec![],
                )],
                aggregation_temporality: temporality as i32,
                is_monotonic: monotonic,
            }),
        )
    }

    fn histogram_point(bounds: Vec<f64>, counts: Vec<u64>, count: u64) -> HistogramDataPoint {
        HistogramDataPoint {
            time_unix_nano: TS,
            explicit_bounds: bounds,
            bucket_counts: counts,
            count,
            sum: Some(12.5),
            ..Default::default()
        }
    }

    fn histogram(name: &str, dp: HistogramDataPoint) -> Metric {
        metric(
            name,
            Data::Histogram(Histogram {
                data_points: vec![dp],
                aggregation_temporality: AggregationTemporality::Cumulative as i32,
            }),
        )
    }

    fn decode_one(m: Metric) -> Result<Vec<MetricSample>, DecodeError> {
        let raw = request(vec![], vec![m]).encode_to_vec();
        decode(&raw, &DecodeOptions::default())
    }

    #[test]
    fn test_decode_gauge() {
        let samples = decode_one(gauge("temperature", 21.5)).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].kind, MetricKind::Gauge);
        assert_eq!(samples[0].payload, SamplePayload::Scalar(21.5));
        assert_eq!(samples[0].timestamp_nanos, TS);
        assert_eq!(samples[0].identity.name(), "temperature");
    }

    #[test]
    fn test_decode_monotonic_cumulative_sum_is_counter() {
        let samples =
            decode_one(sum("requests", true, AggregationTemporality::Cumulative, 42.0)).unwrap();
        assert_eq!(samples[0].kind, MetricKind::Counter);
    }

    #[test]
    fn test_decode_unspecified_temporality_is_cumulative() {
        let samples =
            decode_one(sum("requests", true, AggregationTemporality::Unspecified, 1.0)).unwrap();
        assert_eq!(samples[0].kind, MetricKind::Counter);
    }

    #[test]
    fn test_decode_non_monotonic_sum_is_gauge() {
        let samples =
            decode_one(sum("queue_depth", false, AggregationTemporality::Cumulative, -3.0))
                .unwrap();
        assert_eq!(samples[0].kind, MetricKind::Gauge);
        assert_eq!(samples[0].payload, SamplePayload::Scalar(-3.0));
    }

    #[test]
    fn test_decode_int_value() {
        let m = metric(
            "open_files",
            Data::Gauge(Gauge {
                data_points: vec![number_point(number_data_point::Value::AsInt(7), vec![])],
            }),
        );
        let samples = decode_one(m).unwrap();
        assert_eq!(samples[0].payload, SamplePayload::Scalar(7.0));
    }

    #[test]
    fn test_decode_truncated_payload_is_malformed() {
        // Field 1, length-delimited, claims 5 bytes but only 1 follows
        let raw = [0x0a, 0x05, 0x01];
        let err = decode(&raw, &DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
        assert_eq!(err.reason_code(), "malformed");
    }

    #[test]
    fn test_decode_empty_request_has_no_samples() {
        let samples = decode(&[], &DecodeOptions::default()).unwrap();
        assert!(samples.is_empty());
    }

    #[test]
    fn test_decode_missing_name_is_malformed() {
        let err = decode_one(gauge("", 1.0)).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_missing_data_is_malformed() {
        let m = Metric {
            name: "no_data".into(),
            ..Default::default()
        };
        assert!(matches!(decode_one(m), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_missing_value_is_malformed() {
        let m = metric(
            "g",
            Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint {
                    time_unix_nano: TS,
                    ..Default::default()
                }],
            }),
        );
        assert!(matches!(decode_one(m), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_missing_timestamp_is_malformed() {
        let m = metric(
            "g",
            Data::Gauge(Gauge {
                data_points: vec![NumberDataPoint {
                    value: Some(number_data_point::Value::AsDouble(1.0)),
                    ..Default::default()
                }],
            }),
        );
        assert!(matches!(decode_one(m), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_negative_counter_is_malformed() {
        let err =
            decode_one(sum("requests", true, AggregationTemporality::Cumulative, -1.0)).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_nan_counter_is_malformed() {
        let err = decode_one(sum(
            "requests",
            true,
            AggregationTemporality::Cumulative,
            f64::NAN,
        ))
        .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_delta_sum_is_unsupported() {
        let err =
            decode_one(sum("requests", true, AggregationTemporality::Delta, 1.0)).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedKind(_)));
        assert_eq!(err.reason_code(), "unsupported_kind");
    }

    #[test]
    fn test_decode_summary_and_exponential_are_unsupported() {
        let summary = metric("latency", Data::Summary(Summary::default()));
        assert!(matches!(
            decode_one(summary),
            Err(DecodeError::UnsupportedKind(_))
        ));

        let exp = metric(
            "latency",
            Data::ExponentialHistogram(ExponentialHistogram::default()),
        );
        assert!(matches!(
            decode_one(exp),
            Err(DecodeError::UnsupportedKind(_))
        ));
    }

    #[test]
    fn test_decode_histogram() {
        let dp = histogram_point(vec![0.1, 1.0], vec![2, 3, 1], 6);
        let samples = decode_one(histogram("latency", dp)).unwrap();
        assert_eq!(samples[0].kind, MetricKind::Histogram);
        match &samples[0].payload {
            SamplePayload::Histogram(h) => {
                assert_eq!(h.bounds, vec![0.1, 1.0]);
                assert_eq!(h.bucket_counts, vec![2, 3, 1]);
                assert_eq!(h.count, 6);
                assert_eq!(h.sum, 12.5);
            }
            other => panic!("expected histogram, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_histogram_validation() {
        let unsorted = histogram_point(vec![1.0, 0.5], vec![1, 1, 1], 3);
        let duplicate = histogram_point(vec![1.0, 1.0], vec![1, 1, 1], 3);
        let infinite = histogram_point(vec![f64::INFINITY], vec![1, 1], 2);
        let wrong_len = histogram_point(vec![1.0], vec![1, 1, 1], 3);
        let wrong_count = histogram_point(vec![1.0], vec![1, 1], 5);

        for dp in [unsorted, duplicate, infinite, wrong_len, wrong_count] {
            let err = decode_one(histogram("latency", dp)).unwrap_err();
            assert!(matches!(err, DecodeError::Malformed(_)), "{err}");
        }
    }

    #[test]
    fn test_decode_histogram_bucket_overflow_is_malformed() {
        let dp = histogram_point(vec![1.0], vec![u64::MAX, 2], 1);
        let err = decode_one(histogram("latency", dp)).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)), "{err}");
    }

    #[test]
    fn test_decode_delta_histogram_is_unsupported() {
        let m = metric(
            "latency",
            Data::Histogram(Histogram {
                data_points: vec![histogram_point(vec![1.0], vec![1, 1], 2)],
                aggregation_temporality: AggregationTemporality::Delta as i32,
            }),
        );
        assert!(matches!(decode_one(m), Err(DecodeError::UnsupportedKind(_))));
    }

    #[test]
    fn test_one_bad_point_rejects_whole_message() {
        let raw = request(vec![], vec![gauge("good", 1.0), gauge("", 2.0)]).encode_to_vec();
        assert!(decode(&raw, &DecodeOptions::default()).is_err());
    }

    #[test]
    fn test_decode_labels_and_resource_promotion() {
        let m = metric(
            "requests",
            Data::Gauge(Gauge {
                data_points: vec![number_point(
                    number_data_point::Value::AsDouble(1.0),
                    vec![string_attr("method", "GET"), string_attr("env", "point")],
                )],
            }),
        );
        let req = request(
            vec![
                string_attr("service.name", "checkout"),
                string_attr("env", "resource"),
                string_attr("host.name", "ignored"),
            ],
            vec![m],
        );
        let options = DecodeOptions {
            resource_labels: vec!["service.name".into(), "env".into()],
        };

        let samples = decode(&req.encode_to_vec(), &options).unwrap();
        let labels = samples[0].identity.labels();
        assert_eq!(
            labels,
            &[
                ("env".to_string(), "point".to_string()),
                ("method".to_string(), "GET".to_string()),
                ("service.name".to_string(), "checkout".to_string()),
            ]
        );
    }

    #[test]
    fn test_decode_carries_description_and_unit() {
        let mut m = gauge("temperature", 1.0);
        m.description = "Room temperature".into();
        m.unit = "Cel".into();
        let samples = decode_one(m).unwrap();
        assert_eq!(samples[0].description.as_deref(), Some("Room temperature"));
        assert_eq!(samples[0].unit.as_deref(), Some("Cel"));
    }
}
