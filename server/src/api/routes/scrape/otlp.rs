//! OTLP encoding of a snapshot
//!
//! The whole snapshot goes into one `ResourceMetrics` with an empty resource;
//! promoted resource attributes are already part of each series' labels.
//! Counters export as monotonic cumulative sums carrying the accumulated
//! value, so a reader sees a counter that never goes backwards.

use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::{InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::metrics::v1::{
    AggregationTemporality, Gauge, Histogram, HistogramDataPoint, Metric, NumberDataPoint,
    ResourceMetrics, ScopeMetrics, Sum, metric::Data, number_data_point,
};

use crate::core::constants::APP_NAME_LOWER;
use crate::domain::metrics::{MetricFamily, MetricKind, SeriesState, SeriesValue, Snapshot};
use crate::utils::otlp::string_attr;

const CUMULATIVE: i32 = AggregationTemporality::Cumulative as i32;

/// Build an export request holding every series in the snapshot
pub fn encode(snapshot: &Snapshot) -> ExportMetricsServiceRequest {
    let metrics = snapshot.families.iter().map(encode_family).collect();

    ExportMetricsServiceRequest {
        resource_metrics: vec![ResourceMetrics {
            resource: None,
            scope_metrics: vec![ScopeMetrics {
                scope: Some(InstrumentationScope {
                    name: APP_NAME_LOWER.to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Default::default()
                }),
                metrics,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

fn encode_family(family: &MetricFamily) -> Metric {
    let data = match family.kind {
        MetricKind::Counter => Data::Sum(Sum {
            data_points: family.series.iter().filter_map(|s| number_point(s)).collect(),
            aggregation_temporality: CUMULATIVE,
            is_monotonic: true,
        }),
        MetricKind::Gauge => Data::Gauge(Gauge {
            data_points: family.series.iter().filter_map(|s| number_point(s)).collect(),
        }),
        MetricKind::Histogram => Data::Histogram(Histogram {
            data_points: family
                .series
                .iter()
                .filter_map(|s| histogram_point(s))
                .collect(),
            aggregation_temporality: CUMULATIVE,
        }),
    };

    Metric {
        name: family.name.clone(),
        description: family.description.clone().unwrap_or_default(),
        unit: family.unit.clone().unwrap_or_default(),
        data: Some(data),
        ..Default::default()
    }
}

fn attributes(series: &SeriesState) -> Vec<KeyValue> {
    series
        .identity
        .labels()
        .iter()
        .map(|(k, v)| string_attr(k, v))
        .collect()
}

fn number_point(series: &SeriesState) -> Option<NumberDataPoint> {
    let value = match &series.value {
        SeriesValue::Counter { accumulated, .. } => *accumulated,
        SeriesValue::Gauge { value } => *value,
        SeriesValue::Histogram(_) => return None,
    };
    Some(NumberDataPoint {
        attributes: attributes(series),
        start_time_unix_nano: series.first_seen_nanos,
        time_unix_nano: series.last_updated_nanos,
        value: Some(number_data_point::Value::AsDouble(value)),
        ..Default::default()
    })
}

fn histogram_point(series: &SeriesState) -> Option<HistogramDataPoint> {
    let SeriesValue::Histogram(h) = &series.value else {
        return None;
    };
    Some(HistogramDataPoint {
        attributes: attributes(series),
        start_time_unix_nano: series.first_seen_nanos,
        time_unix_nano: series.last_updated_nanos,
        count: h.count,
        sum: Some(h.sum),
        bucket_counts: h.bucket_counts.clone(),
        explicit_bounds: h.bounds.clone(),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::metrics::{
        Aggregator, DecodeOptions, HistogramValue, MetricIdentity, MetricSample, SamplePayload,
        decode::decode_request,
    };

    fn sample(name: &str, kind: MetricKind, payload: SamplePayload, ts: u64) -> MetricSample {
        MetricSample {
            identity: MetricIdentity::new(name, [("host".to_string(), "a".to_string())]),
            kind,
            payload,
            timestamp_nanos: ts,
            sequence: 0,
            description: None,
            unit: None,
        }
    }

    #[test]
    fn test_encode_counter_as_monotonic_cumulative_sum() {
        let agg = Aggregator::new();
        agg.apply(sample("requests", MetricKind::Counter, SamplePayload::Scalar(10.0), 100));
        agg.apply(sample("requests", MetricKind::Counter, SamplePayload::Scalar(17.0), 200));

        let req = encode(&agg.snapshot());
        let scope = &req.resource_metrics[0].scope_metrics[0];
        assert_eq!(scope.scope.as_ref().unwrap().name, APP_NAME_LOWER);

        let Some(Data::Sum(sum)) = &scope.metrics[0].data else {
            panic!("expected sum");
        };
        assert!(sum.is_monotonic);
        assert_eq!(sum.aggregation_temporality, CUMULATIVE);
        let dp = &sum.data_points[0];
        assert_eq!(dp.value, Some(number_data_point::Value::AsDouble(7.0)));
        assert_eq!(dp.start_time_unix_nano, 100);
        assert_eq!(dp.time_unix_nano, 200);
        assert_eq!(dp.attributes[0].key, "host");
    }

    #[test]
    fn test_encoded_snapshot_decodes_to_same_series() {
        let agg = Aggregator::new();
        agg.apply(sample("temp", MetricKind::Gauge, SamplePayload::Scalar(21.5), 100));
        agg.apply(sample(
            "latency",
            MetricKind::Histogram,
            SamplePayload::Histogram(HistogramValue {
                bounds: vec![1.0],
                bucket_counts: vec![1, 2],
                sum: 3.5,
                count: 3,
            }),
            100,
        ));

        let snapshot = agg.snapshot();
        let samples = decode_request(&encode(&snapshot), &DecodeOptions::default()).unwrap();
        assert_eq!(samples.len(), 2);
        for s in samples {
            let series = snapshot.get(&s.identity).unwrap();
            assert_eq!(series.value.kind(), s.kind);
        }
    }

    #[test]
    fn test_encode_empty_snapshot() {
        let req = encode(&Snapshot::default());
        assert!(req.resource_metrics[0].scope_metrics[0].metrics.is_empty());
    }
}
