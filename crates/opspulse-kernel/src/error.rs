//! Crate-level error types for `opspulse-kernel`.
//!
//! [`KernelError`] wraps each sub-module's typed error via `#[from]` so the
//! `?` operator converts them automatically.

use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::metrics::CollectError;

/// Crate-level error type for `opspulse-kernel`.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KernelError {
    /// A configuration-related error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A bus communication error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// A metrics source failed to produce a snapshot.
    #[error("Collection error: {0}")]
    Collect(#[from] CollectError),

    /// The requested metrics category does not exist.
    #[error("Unknown metrics category: {0}")]
    InvalidCategory(String),

    /// A pricing table failed validation.
    #[error("Invalid pricing for model '{model}': {reason}")]
    InvalidPricing { model: String, reason: String },

    /// A low-level I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
