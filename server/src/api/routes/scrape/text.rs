//! Prometheus text exposition format (version 0.0.4)
//!
//! One block per family: `# HELP` (when a description is known), `# TYPE`,
//! then one line per series: `name{labels} value timestamp_ms`. Histograms
//! expand to cumulative `_bucket` lines ending in `le="+Inf"`, then `_sum`
//! and `_count`.

use std::fmt::Write;

use crate::core::constants::SELF_METRICS_PREFIX;
use crate::domain::metrics::naming::{BUCKET_LABEL, sanitize_label_name, sanitize_metric_name};
use crate::domain::metrics::{
    HistogramValue, MetricFamily, SeriesState, SeriesValue, Snapshot, StatsSnapshot,
};
use crate::utils::time::nanos_to_millis;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render a snapshot, followed by pipeline self-metrics when given
pub fn render(snapshot: &Snapshot, self_metrics: Option<&SelfMetrics>) -> String {
    let mut out = String::new();
    for family in &snapshot.families {
        write_family(&mut out, family);
    }
    if let Some(self_metrics) = self_metrics {
        write_self_metrics(&mut out, self_metrics);
    }
    out
}

/// Pipeline state exported alongside the aggregated series
pub struct SelfMetrics {
    pub stats: StatsSnapshot,
    pub series: usize,
}

fn write_family(out: &mut String, family: &MetricFamily) {
    let name = sanitize_metric_name(&family.name);

    if let Some(help) = &family.description {
        let _ = writeln!(out, "# HELP {name} {}", escape_help(help));
    }
    let _ = writeln!(out, "# TYPE {name} {}", family.kind.as_str());

    for series in &family.series {
        match &series.value {
            SeriesValue::Counter { accumulated, .. } => {
                write_sample(out, &name, series, &labels(series), *accumulated);
            }
            SeriesValue::Gauge { value } => {
                write_sample(out, &name, series, &labels(series), *value);
            }
            SeriesValue::Histogram(h) => write_histogram(out, &name, series, h),
        }
    }
}

fn write_histogram(out: &mut String, name: &str, series: &SeriesState, h: &HistogramValue) {
    let base = labels(series);
    let bucket_name = format!("{name}_bucket");

    let mut cumulative = 0u64;
    for (bound, count) in h.bounds.iter().zip(&h.bucket_counts) {
        cumulative = cumulative.saturating_add(*count);
        let le = with_label(&base, BUCKET_LABEL, &format_value(*bound));
        write_sample(out, &bucket_name, series, &le, cumulative as f64);
    }
    let inf = with_label(&base, BUCKET_LABEL, "+Inf");
    write_sample(out, &bucket_name, series, &inf, h.count as f64);

    write_sample(out, &format!("{name}_sum"), series, &base, h.sum);
    write_sample(out, &format!("{name}_count"), series, &base, h.count as f64);
}

fn write_sample(out: &mut String, name: &str, series: &SeriesState, labels: &str, value: f64) {
    let _ = writeln!(
        out,
        "{name}{labels} {} {}",
        format_value(value),
        nanos_to_millis(series.last_updated_nanos)
    );
}

/// `{k="v",...}` or empty when the series has no labels
fn labels(series: &SeriesState) -> String {
    let pairs: Vec<String> = series
        .identity
        .labels()
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", sanitize_label_name(k), escape_label_value(v)))
        .collect();
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

/// Append one label to an already rendered label set
fn with_label(rendered: &str, key: &str, value: &str) -> String {
    let label = format!("{key}=\"{}\"", escape_label_value(value));
    match rendered.strip_suffix('}') {
        Some(open) => format!("{open},{label}}}"),
        None => format!("{{{label}}}"),
    }
}

fn write_self_metrics(out: &mut String, metrics: &SelfMetrics) {
    let s = &metrics.stats;
    let counters: [(&str, &str, u64); 15] = [
        ("messages", "Bus messages received.", s.messages),
        ("batches", "Batches pulled from the bus.", s.batches),
        ("samples_applied", "Samples merged into series state.", s.samples_applied),
        ("counter_resets", "Counter resets detected.", s.counter_resets),
        ("malformed_messages", "Messages skipped as malformed.", s.malformed),
        ("unsupported_messages", "Messages skipped for unsupported metric kinds.", s.unsupported),
        ("boundary_mismatches", "Histogram samples rejected for changed bucket bounds.", s.boundary_mismatch),
        ("kind_mismatches", "Samples rejected for a metric kind change.", s.kind_mismatch),
        ("naming_conflicts", "Samples rejected for names or labels that collide once exposed.", s.naming_conflict),
        ("commits", "Batches committed to the bus.", s.commits),
        ("commit_failures", "Batch commits that failed.", s.commit_failures),
        ("read_errors", "Failed bus reads.", s.read_errors),
        ("claimed_messages", "Messages claimed from other consumers.", s.claimed),
        ("evicted_series", "Series removed as stale.", s.evicted),
        ("missing_payload_messages", "Pending messages trimmed from the bus before they were applied.", s.missing_payload),
    ];

    for (suffix, help, value) in counters {
        let name = format!("{SELF_METRICS_PREFIX}_{suffix}_total");
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} counter");
        let _ = writeln!(out, "{name} {value}");
    }

    let name = format!("{SELF_METRICS_PREFIX}_series");
    let _ = writeln!(out, "# HELP {name} Series currently held.");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {}", metrics.series);
}

/// Float formatting Prometheus accepts (`NaN`, `+Inf`, `-Inf`)
fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

fn escape_label_value(value: &str) -> String {
    let mut out = String::new();
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out
}

fn escape_help(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n")
}
