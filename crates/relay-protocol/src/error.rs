//! Error types for the record transport.

use thiserror::Error;

/// Failures that break a connection: I/O errors or framing that cannot be resynchronised.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Frame of {length} bytes exceeds the limit of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },
}

/// A complete frame whose payload is not a valid observation.
///
/// The frame boundary is still known, so decoding continues with the next record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed record of {length} bytes: {reason}")]
pub struct MalformedRecord {
    pub length: usize,
    pub reason: String,
}
