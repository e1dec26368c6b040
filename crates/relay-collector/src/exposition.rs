//! Prometheus text exposition (format version 0.0.4).

use std::fmt::Write;

use relay_protocol::Labels;

use crate::aggregator::AggregateEntry;
use crate::aggregator::AggregateValue;

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Renders a snapshot. Entries must be ordered by name, as [`Aggregator::snapshot`]
/// returns them, so that each metric family gets a single `HELP`/`TYPE` header.
///
/// [`Aggregator::snapshot`]: crate::aggregator::Aggregator::snapshot
pub fn render(entries: &[AggregateEntry]) -> String {
    let mut out = String::new();
    let mut family: Option<&str> = None;

    for entry in entries {
        if family != Some(entry.name.as_str()) {
            family = Some(entry.name.as_str());
            if !entry.help.is_empty() {
                let _ = writeln!(out, "# HELP {} {}", entry.name, escape_help(&entry.help));
            }
            let _ = writeln!(out, "# TYPE {} {}", entry.name, entry.metric_type);
        }
        render_entry(&mut out, entry);
    }
    out
}

fn render_entry(out: &mut String, entry: &AggregateEntry) {
    let name = &entry.name;
    let labels = &entry.labels;
    match &entry.value {
        AggregateValue::Counter(value) | AggregateValue::Gauge(value) => {
            sample(out, name, &format_labels(labels, None), *value);
        }
        AggregateValue::Histogram { buckets, sum, count } => {
            let bucket_name = format!("{name}_bucket");
            for (bound, cumulative) in buckets {
                let le = format_value(*bound);
                sample(out, &bucket_name, &format_labels(labels, Some(("le", &le))), *cumulative as f64);
            }
            sample(out, &bucket_name, &format_labels(labels, Some(("le", "+Inf"))), *count as f64);
            sample(out, &format!("{name}_sum"), &format_labels(labels, None), *sum);
            sample(out, &format!("{name}_count"), &format_labels(labels, None), *count as f64);
        }
        AggregateValue::Summary { quantiles, sum, count } => {
            for (quantile, estimate) in quantiles {
                let q = format_value(*quantile);
                sample(out, name, &format_labels(labels, Some(("quantile", &q))), *estimate);
            }
            sample(out, &format!("{name}_sum"), &format_labels(labels, None), *sum);
            sample(out, &format!("{name}_count"), &format_labels(labels, None), *count as f64);
        }
    }
}

fn sample(out: &mut String, name: &str, labels: &str, value: f64) {
    let _ = writeln!(out, "{name}{labels} {}", format_value(value));
}

fn format_labels(labels: &Labels, extra: Option<(&str, &str)>) -> String {
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain(extra)
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    if pairs.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", pairs.join(","))
    }
}

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

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
