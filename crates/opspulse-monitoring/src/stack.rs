//! Wiring of trackers, sampler, bus and aggregator into one runnable unit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use opspulse_kernel::bus::TopicBus;
use opspulse_kernel::pricing::PricingTable;
use opspulse_kernel::retry::{RetryConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aggregator::{AggregatorConfig, MetricsAggregator};
use crate::error::MonitoringResult;
use crate::history::JsonlHistorySink;
use crate::llm::LlmUsageTracker;
use crate::logs::LogBrowser;
use crate::network::NetworkTracker;
use crate::system::SystemSampler;

/// Retry settings for a single source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total time allowed for all attempts of one source.
    pub budget_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 2_000,
            budget_ms: 3_500,
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: settings.max_attempts,
            policy: RetryPolicy::ExponentialBackoff {
                base_ms: settings.base_delay_ms,
                max_ms: settings.max_delay_ms,
            },
            budget: Some(Duration::from_millis(settings.budget_ms)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub collection_interval_ms: u64,
    pub cache_ttl_ms: u64,
    pub rate_interval_ms: u64,
    /// Directory for daily JSON-lines history files. Disabled when unset.
    pub history_dir: Option<PathBuf>,
    pub history_retention: usize,
    pub enable_system: bool,
    /// Keep running without system metrics when the sampler cannot start.
    pub allow_degraded_system: bool,
    pub retry: RetrySettings,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            collection_interval_ms: 5_000,
            cache_ttl_ms: 2_000,
            rate_interval_ms: 1_000,
            history_dir: None,
            history_retention: 720,
            enable_system: true,
            allow_degraded_system: false,
            retry: RetrySettings::default(),
        }
    }
}

impl MonitoringConfig {
    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            collection_interval: Duration::from_millis(self.collection_interval_ms.max(1)),
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            retry: RetryConfig::from(&self.retry),
            history_retention: self.history_retention,
        }
    }
}

/// Everything the dashboard needs, owned in one place.
pub struct MonitoringStack {
    pub network: Arc<NetworkTracker>,
    pub llm: Arc<LlmUsageTracker>,
    pub bus: TopicBus,
    pub aggregator: Arc<MetricsAggregator>,
    pub logs: Option<LogBrowser>,
    config: MonitoringConfig,
    token: CancellationToken,
    rate_ticker: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MonitoringStack {
    /// Build the stack. Fails when the pricing table is invalid, or when the
    /// system sampler cannot start and degraded mode is not allowed.
    pub fn new(config: MonitoringConfig, pricing: PricingTable) -> MonitoringResult<Self> {
        pricing.validate()?;

        let network = Arc::new(NetworkTracker::new());
        let llm = Arc::new(LlmUsageTracker::new(pricing));
        let bus = TopicBus::new();

        let mut aggregator =
            MetricsAggregator::new(network.clone(), llm.clone(), Arc::new(bus.clone()))
                .with_config(config.aggregator_config());

        if config.enable_system {
            match SystemSampler::new() {
                Ok(sampler) => aggregator = aggregator.with_system(Arc::new(sampler)),
                Err(e) if config.allow_degraded_system => {
                    warn!(error = %e, "System metrics disabled, continuing in degraded mode");
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(dir) = &config.history_dir {
            info!(dir = %dir.display(), "Persisting metrics history");
            aggregator = aggregator.with_history_sink(Arc::new(JsonlHistorySink::new(dir)));
        }

        Ok(Self {
            network,
            llm,
            bus,
            aggregator: Arc::new(aggregator),
            logs: None,
            config,
            token: CancellationToken::new(),
            rate_ticker: parking_lot::Mutex::new(None),
        })
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.logs = Some(LogBrowser::new(dir));
        self
    }

    pub fn config(&self) -> &MonitoringConfig {
        &self.config
    }

    /// Start the rate ticker and the aggregation loop.
    pub fn start(&self) {
        let mut ticker = self.rate_ticker.lock();
        if ticker.is_none() {
            let interval = Duration::from_millis(self.config.rate_interval_ms.max(1));
            *ticker = Some(self.network.spawn_rate_ticker(interval, self.token.child_token()));
        }
        self.aggregator.start();
    }

    /// Stop background tasks, letting an in-flight aggregation finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        let ticker = self.rate_ticker.lock().take();
        if let Some(handle) = ticker {
            if let Err(e) = handle.await {
                warn!(error = %e, "Rate ticker ended abnormally");
            }
        }
        self.aggregator.stop().await;
    }
}
