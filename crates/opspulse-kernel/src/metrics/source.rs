use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use super::types::MetricsCategory;

/// Why a single source could not produce a snapshot.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CollectError {
    /// The source is temporarily unable to answer; worth retrying.
    #[error("{category} source unavailable: {reason}")]
    Unavailable {
        category: MetricsCategory,
        reason: String,
    },

    /// The source did not answer within its time budget.
    #[error("{category} source timed out after {attempts} attempt(s)")]
    Timeout {
        category: MetricsCategory,
        attempts: usize,
    },

    /// Every retry attempt failed.
    #[error("{category} source failed after {attempts} attempt(s): {reason}")]
    Exhausted {
        category: MetricsCategory,
        attempts: usize,
        reason: String,
    },
}

impl CollectError {
    pub fn unavailable(category: MetricsCategory, reason: impl Into<String>) -> Self {
        CollectError::Unavailable {
            category,
            reason: reason.into(),
        }
    }

    pub fn category(&self) -> MetricsCategory {
        match self {
            CollectError::Unavailable { category, .. }
            | CollectError::Timeout { category, .. }
            | CollectError::Exhausted { category, .. } => *category,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectError::Unavailable { .. })
    }
}

/// A producer of one category of metrics.
///
/// Implementations hold their own state and are polled by the aggregator;
/// `collect` must not block the async runtime.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    type Snapshot: Clone + Send + Sync + 'static;

    fn category(&self) -> MetricsCategory;

    async fn collect(&self) -> Result<Self::Snapshot, CollectError>;
}

/// Type-erased handle to a source, as held by the aggregator.
pub type SharedSource<T> = Arc<dyn SnapshotSource<Snapshot = T>>;
