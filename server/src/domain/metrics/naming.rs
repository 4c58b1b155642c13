//! Exposition names
//!
//! Metric and label names are mapped onto the Prometheus character sets
//! before rendering. Distinct source names can map to the same exposed name,
//! so the aggregator checks every sample against these rules before it
//! creates state for it.

use std::collections::HashSet;

use crate::core::constants::SELF_METRICS_PREFIX;

use super::types::{MetricIdentity, MetricKind};

/// Label added to every histogram bucket line
pub const BUCKET_LABEL: &str = "le";

/// Map a name onto `[a-zA-Z_:][a-zA-Z0-9_:]*`
pub fn sanitize_metric_name(name: &str) -> String {
    sanitize(name, true)
}

/// Map a name onto `[a-zA-Z_][a-zA-Z0-9_]*`
pub fn sanitize_label_name(name: &str) -> String {
    sanitize(name, false)
}

fn sanitize(name: &str, allow_colon: bool) -> String {
    let mut out = String::with_capacity(name.len() + 1);
    for (i, c) in name.chars().enumerate() {
        let valid = c.is_ascii_alphabetic()
            || c == '_'
            || (allow_colon && c == ':')
            || (i > 0 && c.is_ascii_digit());
        if valid {
            out.push(c);
        } else if i == 0 && c.is_ascii_digit() {
            out.push('_');
            out.push(c);
        } else {
            out.push('_');
        }
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Why an identity cannot be exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelConflict {
    /// Two source keys sanitise to this key
    Duplicate(String),
    /// This key is written by the renderer itself
    Reserved(String),
}

/// Check that the label keys of `identity` stay unique once sanitised
pub fn check_labels(identity: &MetricIdentity, kind: MetricKind) -> Result<(), LabelConflict> {
    let mut seen = HashSet::with_capacity(identity.labels().len());
    for (key, _) in identity.labels() {
        let exposed = sanitize_label_name(key);
        if kind == MetricKind::Histogram && exposed == BUCKET_LABEL {
            return Err(LabelConflict::Reserved(exposed));
        }
        if !seen.insert(exposed.clone()) {
            return Err(LabelConflict::Duplicate(exposed));
        }
    }
    Ok(())
}

/// Whether an exposed metric name lies in the exporter's own namespace
pub fn is_reserved_name(exposed: &str) -> bool {
    exposed
        .strip_prefix(SELF_METRICS_PREFIX)
        .is_some_and(|rest| rest.starts_with('_'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(labels: &[(&str, &str)]) -> MetricIdentity {
        MetricIdentity::new(
            "m",
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())),
        )
    }

    #[test]
    fn test_sanitize_names() {
        assert_eq!(sanitize_metric_name("http.server.duration"), "http_server_duration");
        assert_eq!(sanitize_metric_name("ns:metric"), "ns:metric");
        assert_eq!(sanitize_metric_name("9lives"), "_9lives");
        assert_eq!(sanitize_label_name("k8s.pod:name"), "k8s_pod_name");
        assert_eq!(sanitize_label_name(""), "_");
    }

    #[test]
    fn test_labels_colliding_after_sanitize() {
        let result = check_labels(&identity(&[("k.1", "a"), ("k_1", "b")]), MetricKind::Gauge);
        assert_eq!(result, Err(LabelConflict::Duplicate("k_1".into())));
        assert!(check_labels(&identity(&[("k.1", "a"), ("k.2", "b")]), MetricKind::Gauge).is_ok());
    }

    #[test]
    fn test_le_reserved_only_for_histograms() {
        let with_le = identity(&[("le", "user")]);
        assert_eq!(
            check_labels(&with_le, MetricKind::Histogram),
            Err(LabelConflict::Reserved("le".into()))
        );
        assert!(check_labels(&with_le, MetricKind::Counter).is_ok());
    }

    #[test]
    fn test_reserved_name_prefix() {
        assert!(is_reserved_name("metrics_exporter_series"));
        assert!(!is_reserved_name("metrics_exporterish"));
        assert!(!is_reserved_name("http_requests"));
    }
}
