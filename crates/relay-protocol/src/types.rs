//! Metric descriptors and observation payloads.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

/// Label set attached to an observation, kept sorted by label name.
pub type Labels = BTreeMap<String, String>;

/// Kind of metric, decides how the collector combines observations.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    #[display("counter")]
    Counter,
    #[display("gauge")]
    Gauge,
    #[display("histogram")]
    Histogram,
    #[display("summary")]
    Summary,
}

/// Type-specific parameters of a metric.
///
/// Options travel verbatim from the registering process to the collector; the
/// client never rewrites them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricOptions {
    /// Quantiles reported by a summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<Vec<f64>>,
    /// Upper bounds of histogram buckets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buckets: Option<Vec<f64>>,
}

impl MetricOptions {
    pub fn with_quantiles(mut self, quantiles: impl Into<Vec<f64>>) -> Self {
        self.quantiles = Some(quantiles.into());
        self
    }

    pub fn with_buckets(mut self, buckets: impl Into<Vec<f64>>) -> Self {
        self.buckets = Some(buckets.into());
        self
    }

    /// True when no option was supplied at all.
    pub fn is_empty(&self) -> bool {
        self.quantiles.is_none() && self.buckets.is_none()
    }
}

/// Immutable definition of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub help: String,
    #[serde(default)]
    pub options: MetricOptions,
}

impl MetricDescriptor {
    pub fn new(
        metric_type: MetricType,
        name: impl Into<String>,
        help: impl Into<String>,
        options: MetricOptions,
    ) -> Self {
        Self {
            name: name.into(),
            metric_type,
            help: help.into(),
            options,
        }
    }

    /// Builds the payload for one data point of this metric.
    ///
    /// `opts` is only present when the descriptor was registered with options.
    pub fn observation(&self, value: f64, keys: Labels) -> Observation {
        Observation {
            metric_type: self.metric_type,
            name: self.name.clone(),
            help: self.help.clone(),
            keys,
            value,
            action: None,
            opts: (!self.options.is_empty()).then(|| self.options.clone()),
        }
    }
}

/// How the collector applies an observation's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Counter: add; gauge: set; histogram and summary: record a sample
    #[display("observe")]
    Observe,
    #[display("increment")]
    Increment,
    #[display("decrement")]
    Decrement,
}

/// One reported data point, the payload of a single wire record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub keys: Labels,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<MetricOptions>,
}

impl Observation {
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Action to apply, plain observations carry none on the wire.
    pub fn action(&self) -> Action {
        self.action.unwrap_or(Action::Observe)
    }
}

/// Checks a name against the exposition format grammar `[a-zA-Z_:][a-zA-Z0-9_:]*`.
pub fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Checks a label key against `[a-zA-Z_][a-zA-Z0-9_]*`. Keys starting with `__` are
/// reserved for internal use and rejected too.
pub fn is_valid_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    !name.starts_with("__") && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
