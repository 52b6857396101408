//! Retry policies and async retry helper.
//!
//! A retry run is a bounded loop: at most `max_attempts` calls, a policy
//! defined sleep between them, and an optional wall-clock budget covering
//! the whole run (attempts and sleeps).

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Delay strategy between retry attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay every attempt.
    Fixed { delay_ms: u64 },
    /// Delay increases linearly: `base_ms * attempt`.
    Linear { base_ms: u64 },
    /// Delay doubles every attempt, capped at `max_ms`.
    ExponentialBackoff { base_ms: u64, max_ms: u64 },
}

impl RetryPolicy {
    /// Returns the sleep duration before the given retry attempt (0-indexed).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let ms = match self {
            RetryPolicy::Fixed { delay_ms } => *delay_ms,
            RetryPolicy::Linear { base_ms } => base_ms.saturating_mul((attempt + 1) as u64),
            RetryPolicy::ExponentialBackoff { base_ms, max_ms } => 1u64
                .checked_shl(attempt as u32)
                .and_then(|s| base_ms.checked_mul(s))
                .unwrap_or(*max_ms)
                .min(*max_ms),
        };
        Duration::from_millis(ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::ExponentialBackoff {
            base_ms: 500,
            max_ms: 2_000,
        }
    }
}

/// How many attempts to make, which [`RetryPolicy`] to use and how long the
/// whole run may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts (1 = no retry).
    pub max_attempts: usize,
    pub policy: RetryPolicy,
    /// Upper bound for the whole run. `None` means unbounded.
    pub budget: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            policy: RetryPolicy::default(),
            budget: Some(Duration::from_millis(3_500)),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_attempts: usize, base_ms: u64, max_ms: u64) -> Self {
        Self {
            max_attempts,
            policy: RetryPolicy::ExponentialBackoff { base_ms, max_ms },
            budget: None,
        }
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = Some(budget);
        self
    }
}

/// Why a retry run gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { attempts: usize, error: E },

    /// An attempt failed with an error the caller marked as not retryable.
    #[error("aborted after {attempts} attempt(s): {error}")]
    Aborted { attempts: usize, error: E },

    /// The time budget ran out before an attempt succeeded.
    #[error("retry budget of {budget:?} exceeded after {attempts} attempt(s)")]
    BudgetExceeded {
        attempts: usize,
        budget: Duration,
        last: Option<E>,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::BudgetExceeded { attempts, .. } => *attempts,
        }
    }

    /// The last error returned by the operation, if any attempt completed.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::Aborted { error, .. } => Some(error),
            RetryError::BudgetExceeded { last, .. } => last.as_ref(),
        }
    }
}

/// Retry `f` up to `config.max_attempts` times within `config.budget`.
pub async fn retry_with_policy<F, Fut, T, E>(
    config: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0usize;
    let mut last: Option<E> = None;

    let run = async {
        loop {
            attempts += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !is_retryable(&e) => {
                    return Err(RetryError::Aborted {
                        attempts,
                        error: e,
                    });
                }
                Err(e) if attempts >= max_attempts => {
                    return Err(RetryError::Exhausted {
                        attempts,
                        error: e,
                    });
                }
                Err(e) => {
                    last = Some(e);
                    tokio::time::sleep(config.policy.delay_for(attempts - 1)).await;
                }
            }
        }
    };

    let Some(budget) = config.budget else {
        return run.await;
    };

    let outcome = tokio::time::timeout(budget, run).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(RetryError::BudgetExceeded {
            attempts,
            budget,
            last,
        }),
    }
}
