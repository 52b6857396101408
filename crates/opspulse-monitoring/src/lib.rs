//! OpsPulse Monitoring - metrics collection and dashboard server
//!
//! This crate provides:
//! - Network and LLM usage trackers fed from the HTTP boundary
//! - A host sampler for CPU, memory, disk and OS network counters
//! - A periodic aggregator that publishes snapshots on the topic bus
//! - REST API and WebSocket feed for dashboards
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use opspulse_kernel::pricing::PricingTable;
//! use opspulse_monitoring::{DashboardConfig, DashboardServer, MonitoringConfig, MonitoringStack};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let stack = MonitoringStack::new(MonitoringConfig::default(), PricingTable::default())?;
//! let server = DashboardServer::new(DashboardConfig::new().with_port(8080), Arc::new(stack));
//! server
//!     .serve_with_shutdown(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregator;
pub mod dashboard;
pub mod error;
pub mod history;
pub mod llm;
pub mod logs;
pub mod network;
pub mod stack;
pub mod system;

pub use aggregator::{AggregatorConfig, AggregatorState, MetricsAggregator};
pub use dashboard::{
    ApiError, ApiResponse, ClientMessage, DashboardConfig, DashboardServer, ServerMessage,
    WebSocketHub,
};
pub use error::{MonitoringError, MonitoringResult};
pub use history::{HistorySink, JsonlHistorySink, NoopHistorySink};
pub use llm::LlmUsageTracker;
pub use logs::{LogBrowser, LogEntry, LogPage, LogQuery, LogStats};
pub use network::{ConnectionKind, NetworkTracker, normalize_path};
pub use stack::{MonitoringConfig, MonitoringStack, RetrySettings};
pub use system::SystemSampler;
