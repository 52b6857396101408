//! Typed errors and result aliases for the topic bus.

use thiserror::Error;

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors that can occur on the topic bus.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BusError {
    /// Topic names must be non-empty.
    #[error("Invalid topic name: {0:?}")]
    InvalidTopic(String),

    /// The payload could not be converted to JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
