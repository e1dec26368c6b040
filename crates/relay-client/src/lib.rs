//! Metrics client for processes that report to a metrics-relay collector.
//!
//! A [`Client`] bundles a metric registry with one background delivery worker.
//! Registering metrics is synchronous and may fail; emitting observations only
//! enqueues and never fails, whatever the state of the collector connection.
//!
//! # Examples
//!
//! ```no_run
//! use relay_client::{Client, ClientConfig, MetricFilter, NO_LABELS};
//! use relay_protocol::{MetricOptions, MetricType};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(ClientConfig::new("127.0.0.1:9394"));
//! let requests = client.register(
//!     MetricType::Counter,
//!     "http_requests_total",
//!     "Total HTTP requests",
//!     MetricOptions::default(),
//! )?;
//! requests.increment([("route", "/health")]);
//!
//! let same = client.find_registered_metric(
//!     "http_requests_total",
//!     &MetricFilter::from(MetricType::Counter),
//! );
//! assert_eq!(same, Some(requests));
//!
//! // in a forked child, before emitting anything
//! client.after_fork();
//! # let _ = NO_LABELS;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod metric;
pub mod registry;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use relay_protocol::MetricDescriptor;
use relay_protocol::MetricOptions;
use relay_protocol::MetricType;
use relay_protocol::Observation;

pub use config::ClientConfig;
pub use error::RegistryError;
pub use metric::RegisteredMetric;
pub use metric::NO_LABELS;
pub use registry::MetricFilter;
pub use registry::MetricRegistry;
pub use worker::ConnectionState;
pub use worker::DeliveryWorker;
pub use worker::WorkerStats;

/// Destination of observations emitted by registered metrics.
pub trait ObservationSink: Send + Sync {
    /// Accepts one observation. Must not block on I/O and must not fail.
    fn submit(&self, observation: Observation);
}

impl<T> ObservationSink for Arc<T>
where T: ObservationSink + ?Sized
{
    fn submit(&self, observation: Observation) {
        (**self).submit(observation);
    }
}

/// Client context: registry plus the delivery worker it feeds.
pub struct Client {
    registry: MetricRegistry,
    worker: Arc<DeliveryWorker>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let custom_labels = config.custom_labels.clone();
        let worker = Arc::new(DeliveryWorker::new(config));
        let sink: Arc<dyn ObservationSink> = worker.clone();
        Self {
            registry: MetricRegistry::new(sink, custom_labels),
            worker,
        }
    }

    /// Client configured from `METRICS_RELAY_HOST` / `METRICS_RELAY_PORT`.
    pub fn from_env() -> Self {
        Self::new(ClientConfig::from_env())
    }

    pub fn register(
        &self,
        metric_type: MetricType,
        name: impl Into<String>,
        help: impl Into<String>,
        options: MetricOptions,
    ) -> Result<RegisteredMetric, RegistryError> {
        self.registry.register(metric_type, name, help, options)
    }

    pub fn find_registered_metric(
        &self,
        name: &str,
        filter: &MetricFilter,
    ) -> Option<RegisteredMetric> {
        self.registry.find(name, filter)
    }

    pub fn metrics(&self) -> Vec<MetricDescriptor> {
        self.registry.descriptors()
    }

    /// Sends a prepared observation as-is, bypassing the registry.
    pub fn send(&self, observation: Observation) {
        self.worker.enqueue(observation);
    }

    pub fn worker(&self) -> &DeliveryWorker {
        &self.worker
    }

    /// Post-fork hook, see [`DeliveryWorker::after_fork`].
    pub fn after_fork(&self) {
        self.worker.after_fork();
    }

    /// Stops delivery, flushing for at most `timeout`.
    pub fn stop(&self, timeout: Duration) -> bool {
        self.worker.stop(timeout)
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}
