//! LLM usage and cost tracker

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opspulse_kernel::metrics::{
    CollectError, LlmRequestRecord, LlmSnapshot, MetricsCategory, ModelReport, ModelUsageStats,
    RequestCost, SnapshotSource,
};
use opspulse_kernel::pricing::{PricingSource, PricingTable};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

/// Length of the window behind the overall tokens/s figure.
pub const TOKEN_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct TokenWindow {
    started: Instant,
    tokens: u64,
}

#[derive(Debug)]
struct UsageState {
    total_tokens: u64,
    request_count: u64,
    total_latency_ms: f64,
    total_cost: f64,
    tokens_per_second: f64,
    errors: u64,
    models: BTreeMap<String, ModelUsageStats>,
    window: TokenWindow,
}

impl UsageState {
    fn new() -> Self {
        Self {
            total_tokens: 0,
            request_count: 0,
            total_latency_ms: 0.0,
            total_cost: 0.0,
            tokens_per_second: 0.0,
            errors: 0,
            models: BTreeMap::new(),
            window: TokenWindow {
                started: Instant::now(),
                tokens: 0,
            },
        }
    }
}

/// Per-request cost and latency accounting, aggregated per model.
///
/// The usage table and the pricing table are independent: pricing can be
/// swapped at any time and only affects requests tracked afterwards.
pub struct LlmUsageTracker {
    usage: Mutex<UsageState>,
    pricing: RwLock<Arc<PricingTable>>,
}

impl Default for LlmUsageTracker {
    fn default() -> Self {
        Self::new(PricingTable::with_defaults())
    }
}

impl LlmUsageTracker {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            usage: Mutex::new(UsageState::new()),
            pricing: RwLock::new(Arc::new(pricing)),
        }
    }

    /// Current pricing table. The returned table never changes; an update
    /// installs a new one.
    pub fn pricing(&self) -> Arc<PricingTable> {
        Arc::clone(&self.pricing.read())
    }

    /// Replace the whole pricing table.
    pub fn update_pricing(&self, table: PricingTable) {
        let models = table.models.len();
        *self.pricing.write() = Arc::new(table);
        info!(models, "LLM pricing table updated");
    }

    pub fn track_request(&self, record: &LlmRequestRecord) -> RequestCost {
        let pricing = self.pricing();
        let (price, source) = pricing.resolve(&record.model);
        match source {
            PricingSource::Configured => {}
            PricingSource::DefaultTier => info!(
                model = %record.model,
                default_model = %pricing.default_model,
                "No pricing for model, using default tier"
            ),
            PricingSource::Unpriced => warn!(
                model = %record.model,
                "No pricing for model or default tier, cost recorded as zero"
            ),
        }

        let latency_ms = record.latency_ms();
        let tokens = record.total_tokens();
        let cost = price.calculate_cost(record.input_tokens, record.output_tokens);
        let tokens_per_second = if latency_ms > 0.0 {
            tokens as f64 / (latency_ms / 1000.0)
        } else {
            0.0
        };

        let now = Instant::now();
        let mut guard = self.usage.lock();
        let usage = &mut *guard;
        usage.total_tokens = usage.total_tokens.saturating_add(tokens);
        usage.request_count = usage.request_count.saturating_add(1);
        usage.total_latency_ms += latency_ms;
        usage.total_cost += cost;

        let stats = usage.models.entry(record.model.clone()).or_default();
        stats.requests = stats.requests.saturating_add(1);
        stats.input_tokens = stats.input_tokens.saturating_add(record.input_tokens);
        stats.output_tokens = stats.output_tokens.saturating_add(record.output_tokens);
        stats.total_tokens = stats.total_tokens.saturating_add(tokens);
        stats.total_latency_ms += latency_ms;
        stats.total_cost += cost;
        stats.average_latency_ms = stats.total_latency_ms / stats.requests as f64;
        stats.tokens_per_second = if stats.total_latency_ms > 0.0 {
            stats.total_tokens as f64 / stats.total_latency_ms * 1000.0
        } else {
            0.0
        };

        if let Some(error) = &record.error {
            stats.errors = stats.errors.saturating_add(1);
            usage.errors = usage.errors.saturating_add(1);
            warn!(model = %record.model, error = %error, "LLM request failed");
        }

        if now.duration_since(usage.window.started) >= TOKEN_WINDOW {
            usage.tokens_per_second = usage.window.tokens as f64;
            usage.window = TokenWindow {
                started: now,
                tokens,
            };
        } else {
            usage.window.tokens = usage.window.tokens.saturating_add(tokens);
        }

        RequestCost {
            cost,
            latency_ms,
            tokens_per_second,
        }
    }

    pub fn model_stats(&self, model: &str) -> Option<ModelUsageStats> {
        self.usage.lock().models.get(model).cloned()
    }

    pub fn collect(&self) -> LlmSnapshot {
        let pricing = self.pricing();
        let usage = self.usage.lock();
        let (average_latency_ms, average_cost) = if usage.request_count > 0 {
            let n = usage.request_count as f64;
            (usage.total_latency_ms / n, usage.total_cost / n)
        } else {
            (0.0, 0.0)
        };

        let models = usage
            .models
            .iter()
            .map(|(model, stats)| {
                let report = ModelReport {
                    usage: stats.clone(),
                    pricing: pricing.get(model).copied(),
                };
                (model.clone(), report)
            })
            .collect();

        LlmSnapshot {
            timestamp: Utc::now(),
            total_tokens: usage.total_tokens,
            request_count: usage.request_count,
            average_latency_ms,
            tokens_per_second: usage.tokens_per_second,
            average_cost,
            total_cost: usage.total_cost,
            errors: usage.errors,
            models,
        }
    }

    /// Clear all usage. Pricing is kept.
    pub fn reset(&self) {
        *self.usage.lock() = UsageState::new();
    }
}

#[async_trait]
impl SnapshotSource for LlmUsageTracker {
    type Snapshot = LlmSnapshot;

    fn category(&self) -> MetricsCategory {
        MetricsCategory::Llm
    }

    async fn collect(&self) -> Result<LlmSnapshot, CollectError> {
        Ok(LlmUsageTracker::collect(self))
    }
}
