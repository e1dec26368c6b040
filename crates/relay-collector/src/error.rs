//! Error types for the collector.

use core::error::Error;

use derive_more::Display;
use error_stack::Report;
use relay_protocol::Action;
use relay_protocol::MetricType;

/// Result type for collector start-up and serving.
pub type CollectorResult<T> = Result<T, Report<CollectorError>>;

/// Errors that stop the collector from serving.
#[derive(Debug, Display)]
pub enum CollectorError {
    /// Listener could not be bound
    #[display("Failed to bind {addr}")]
    Bind { addr: String },

    /// Scrape endpoint stopped with an error
    #[display("Scrape server error on {addr}")]
    Scrape { addr: String },
}

impl Error for CollectorError {}

/// Reasons an observation is discarded by the aggregator.
///
/// The aggregate is left untouched whenever one of these is returned.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    #[error("Metric `{name}` is a {existing}, rejecting {received} observation")]
    TypeMismatch {
        name: String,
        existing: MetricType,
        received: MetricType,
    },

    #[error("Invalid metric name `{0}`")]
    InvalidName(String),

    #[error("Invalid label `{label}` on metric `{name}`: {reason}")]
    InvalidLabel {
        name: String,
        label: String,
        reason: &'static str,
    },

    #[error("Invalid value {value} for metric `{name}`: {reason}")]
    InvalidValue {
        name: String,
        value: f64,
        reason: &'static str,
    },

    #[error("Action {action} is not supported by {metric_type} metric `{name}`")]
    UnsupportedAction {
        name: String,
        metric_type: MetricType,
        action: Action,
    },
}
