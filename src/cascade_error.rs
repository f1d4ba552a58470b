//! CascadeError: Unified error type for cascade-partitioner public APIs
//!
//! Recoverable failures (transport framing, payload decoding, rejected
//! configuration) are reported through this type. Protocol invariant
//! violations inside a balance pass are not recoverable and abort the pass
//! with a panic instead.

use thiserror::Error;

/// Unified error type for cascade-partitioner operations.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// A message exchanged with `neighbor` could not be completed or framed.
    #[error("Communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// A summary or shipment payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(String),
    /// Partitioner parameters failed validation.
    #[error("Invalid partitioner parameters: {0}")]
    InvalidParams(String),
    /// The global average load must be finite and non-negative.
    #[error("Invalid global load average {0}")]
    InvalidGlobalAverage(f64),
    /// A stage handle does not refer to a registered member.
    #[error("Unknown stage member {0}")]
    UnknownMember(usize),
    /// An operation was begun on a member that still has pending requests.
    #[error("Stage member {0} still has pending communication")]
    MemberBusy(usize),
    /// A structural invariant check failed.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
}

/// Plain-text error carried as the `source` of [`CascadeError::CommError`].
#[derive(Debug, Error)]
#[error("{0}")]
pub struct CommError(pub String);

impl From<bincode::Error> for CascadeError {
    fn from(e: bincode::Error) -> Self {
        CascadeError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for CascadeError {
    fn from(e: serde_json::Error) -> Self {
        CascadeError::InvalidParams(e.to_string())
    }
}
