//! Error types for the monitoring crate.

use opspulse_kernel::KernelError;
use opspulse_kernel::bus::BusError;
use opspulse_kernel::metrics::{CollectError, MetricsCategory};
use thiserror::Error;

/// Errors raised by trackers, the aggregator and the log browser.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MonitoringError {
    /// The system sampler cannot run on this host.
    #[error("System sampler initialization failed: {0}")]
    SamplerInit(String),

    /// A single category could not be collected.
    #[error(transparent)]
    Collect(#[from] CollectError),

    /// No source is configured for the requested category.
    #[error("No {0} source configured")]
    SourceDisabled(MetricsCategory),

    #[error("Invalid log type: {0:?}")]
    InvalidLogType(String),

    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MonitoringError {
    /// Whether the failure was caused by the caller's input.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            MonitoringError::InvalidLogType(_)
                | MonitoringError::Kernel(KernelError::InvalidCategory(_))
                | MonitoringError::Kernel(KernelError::InvalidPricing { .. })
        )
    }
}

pub type MonitoringResult<T> = Result<T, MonitoringError>;
