//! Error types surfaced to callers of the registration API.

use relay_protocol::MetricType;
use thiserror::Error;

/// Registration failures. These are the only errors a metric-emitting caller ever sees.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Metric `{name}` is already registered as a {existing} with different parameters")]
    DuplicateMetric { name: String, existing: MetricType },

    #[error("Invalid metric name `{0}`")]
    InvalidMetricName(String),
}
