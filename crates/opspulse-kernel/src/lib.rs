//! OpsPulse Kernel
//!
//! Shared building blocks for the OpsPulse dashboard:
//! - [`metrics`]: snapshot record types and the [`metrics::SnapshotSource`] seam
//! - [`pricing`]: per-model LLM pricing table
//! - [`bus`]: topic based publish/subscribe abstraction
//! - [`retry`]: bounded retry loop with backoff and a total time budget
//! - [`config`]: multi-format configuration loading

// bus module
pub mod bus;
pub use bus::{Envelope, Publisher, TopicBus, TopicHandler};

// config module
pub mod config;

// error module
pub mod error;
pub use error::{KernelError, KernelResult};

// metrics module
pub mod metrics;

// pricing module
pub mod pricing;
pub use pricing::{ModelPricing, PricingSource, PricingTable};

// retry module
pub mod retry;
pub use retry::{RetryConfig, RetryError, RetryPolicy, retry_with_policy};
