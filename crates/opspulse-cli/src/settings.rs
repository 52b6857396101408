//! Application configuration
//!
//! Layers, lowest first: serde defaults, the optional config file, then
//! `OPSPULSE__SECTION__KEY` environment variables.

use opspulse_kernel::config::{ConfigResult, load_with_env};
use opspulse_kernel::pricing::PricingTable;
use opspulse_monitoring::{DashboardConfig, MonitoringConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "OPSPULSE";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for `combined.log` and `error.log`. Also served by the
    /// log browsing endpoints.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: DashboardConfig,
    pub monitoring: MonitoringConfig,
    pub logging: LoggingConfig,
    pub pricing: PricingTable,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        load_with_env(path, ENV_PREFIX)
    }

    /// Apply command line overrides on top of the loaded values.
    pub fn with_overrides(mut self, host: Option<String>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.server.host = host;
        }
        if let Some(port) = port {
            self.server.port = port;
        }
        self
    }

    /// Problems that would stop the server from starting.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = self.pricing.validate() {
            problems.push(e.to_string());
        }
        if self.monitoring.collection_interval_ms == 0 {
            problems.push("monitoring.collection_interval_ms must be greater than zero".into());
        }
        if self.monitoring.retry.max_attempts == 0 {
            problems.push("monitoring.retry.max_attempts must be at least 1".into());
        }
        if self.monitoring.history_retention == 0 {
            problems.push("monitoring.history_retention must be at least 1".into());
        }
        problems
    }
}
