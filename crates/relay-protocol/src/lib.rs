//! Shared wire definitions for metrics-relay
//!
//! This crate contains the types exchanged between metric-emitting client processes
//! and the collector: metric descriptors, observations and the length-prefixed record
//! codec that frames them on the socket.

pub mod codec;
pub mod error;
pub mod types;

pub use codec::RecordCodec;
pub use codec::DEFAULT_MAX_FRAME_LENGTH;
pub use error::MalformedRecord;
pub use error::TransportError;
pub use types::is_valid_label_name;
pub use types::is_valid_metric_name;
pub use types::Action;
pub use types::Labels;
pub use types::MetricDescriptor;
pub use types::MetricOptions;
pub use types::MetricType;
pub use types::Observation;
