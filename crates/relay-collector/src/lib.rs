//! Collector side of metrics-relay.
//!
//! The collector receives observations from local client processes over a
//! length-prefixed TCP stream, folds them into an [`Aggregator`] and exposes the
//! aggregate on `GET /metrics` for scraping.

pub mod aggregator;
pub mod config;
pub mod error;
pub mod exposition;
pub mod poem;
pub mod server;

pub use aggregator::AggregateEntry;
pub use aggregator::AggregateValue;
pub use aggregator::Aggregator;
pub use aggregator::AggregatorConfig;
pub use aggregator::AggregatorStats;
pub use config::CollectorArgs;
pub use config::CollectorConfig;
pub use error::CollectorError;
pub use error::CollectorResult;
pub use error::MergeError;
pub use server::CollectorServer;
pub use server::CollectorStats;
