//! Metrics record types
//!
//! Snapshots are plain data: built once by a source, then shared behind an
//! `Arc` and serialized to JSON for the bus, the HTTP API and history.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::KernelError;
use crate::pricing::ModelPricing;

/// Error rate (percent) at or above which the API is reported as degraded.
pub const DEGRADED_ERROR_RATE_PERCENT: f64 = 5.0;

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// Network
// ============================================================================

/// An incoming request as seen by the instrumentation layer.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub path: String,
    pub method: String,
    pub start: Instant,
    pub bytes_in: u64,
}

/// The matching response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseEvent {
    pub bytes_out: u64,
    pub status_code: u16,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTotals {
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficTotals {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub active: u64,
    pub total: u64,
    pub http: u64,
    pub websocket: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorStats {
    pub count: u64,
    /// Keyed by status family: 400, 500, ...
    pub by_family: BTreeMap<u16, u64>,
}

/// Running totals behind the headline network numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDetail {
    pub requests: RequestTotals,
    pub traffic: TrafficTotals,
    pub connections: ConnectionStats,
    pub latency: LatencyStats,
    pub errors: ErrorStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    pub timestamp: DateTime<Utc>,
    pub requests_per_second: u64,
    pub bytes_in_rate: u64,
    pub bytes_out_rate: u64,
    pub active_connections: u64,
    pub error_rate_percent: f64,
    pub average_latency_ms: f64,
    pub by_method: BTreeMap<String, u64>,
    pub by_normalized_path: BTreeMap<String, u64>,
    pub detail: NetworkDetail,
}

// ============================================================================
// LLM usage
// ============================================================================

/// One completed (or failed) LLM call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmRequestRecord {
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LlmRequestRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Wall-clock latency; clamped at zero when `end` precedes `start`.
    pub fn latency_ms(&self) -> f64 {
        let ms = (self.end - self.start).num_milliseconds();
        ms.max(0) as f64
    }
}

/// What a single tracked call cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RequestCost {
    pub cost: f64,
    pub latency_ms: f64,
    pub tokens_per_second: f64,
}

/// Cumulative usage for one model. Cleared only by an explicit reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelUsageStats {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub total_latency_ms: f64,
    pub total_cost: f64,
    pub average_latency_ms: f64,
    pub tokens_per_second: f64,
    pub errors: u64,
}

/// Per-model usage as reported, with the pricing in effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelReport {
    #[serde(flatten)]
    pub usage: ModelUsageStats,
    /// `None` serializes as the string `"unknown"`.
    #[serde(with = "pricing_or_unknown")]
    pub pricing: Option<ModelPricing>,
}

mod pricing_or_unknown {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use crate::pricing::ModelPricing;

    pub fn serialize<S: Serializer>(
        pricing: &Option<ModelPricing>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match pricing {
            Some(p) => p.serialize(serializer),
            None => serializer.serialize_str("unknown"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<ModelPricing>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Priced(ModelPricing),
            Label(String),
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Priced(p) => Some(p),
            Repr::Label(_) => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmSnapshot {
    pub timestamp: DateTime<Utc>,
    pub total_tokens: u64,
    pub request_count: u64,
    pub average_latency_ms: f64,
    pub tokens_per_second: f64,
    pub average_cost: f64,
    pub total_cost: f64,
    pub errors: u64,
    pub models: BTreeMap<String, ModelReport>,
}

// ============================================================================
// System
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

/// Interface traffic since the previous sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub card: String,
    pub vendor: String,
    pub device: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub name: String,
    pub mount_point: String,
    pub file_system: String,
    pub kind: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub removable: bool,
}

/// Static hardware description. Computed once per process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareInfo {
    pub cpu_model: String,
    pub cpu_cores: usize,
    pub cpu_threads: usize,
    pub cpu_speed_mhz: u64,
    pub gpu: Vec<GpuInfo>,
    pub disks: Vec<DiskInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory: MemoryUsage,
    pub disk_usage: DiskUsage,
    /// Process uptime.
    pub uptime_seconds: u64,
    pub os_uptime_seconds: u64,
    pub load_average: [f64; 3],
    pub platform: String,
    pub hostname: String,
    pub network_io: NetworkIo,
    pub hardware_info: HardwareInfo,
}

// ============================================================================
// Aggregate
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricsCategory {
    Network,
    Llm,
    System,
}

impl MetricsCategory {
    pub const ALL: [MetricsCategory; 3] = [
        MetricsCategory::Network,
        MetricsCategory::Llm,
        MetricsCategory::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricsCategory::Network => "network",
            MetricsCategory::Llm => "llm",
            MetricsCategory::System => "system",
        }
    }
}

impl fmt::Display for MetricsCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricsCategory {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" => Ok(MetricsCategory::Network),
            "llm" => Ok(MetricsCategory::Llm),
            "system" => Ok(MetricsCategory::System),
            _ => Err(KernelError::InvalidCategory(s.to_string())),
        }
    }
}

/// One aggregation result. A section that could not be collected is `None`
/// and its category is listed in `failed_sections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemSnapshot>,
    #[serde(default)]
    pub failed_sections: Vec<MetricsCategory>,
}

impl MetricsSnapshot {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            network: None,
            llm: None,
            system: None,
            failed_sections: Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failed_sections.is_empty()
    }

    /// Pull a single section out as a [`CategorySnapshot`].
    pub fn section(&self, category: MetricsCategory) -> Option<CategorySnapshot> {
        match category {
            MetricsCategory::Network => self.network.clone().map(CategorySnapshot::Network),
            MetricsCategory::Llm => self.llm.clone().map(CategorySnapshot::Llm),
            MetricsCategory::System => self.system.clone().map(CategorySnapshot::System),
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let api_health = match &self.network {
            Some(n) if n.error_rate_percent < DEGRADED_ERROR_RATE_PERCENT => ApiHealth::Ok,
            Some(_) => ApiHealth::Degraded,
            None => ApiHealth::Unknown,
        };

        MetricsSummary {
            timestamp: self.timestamp,
            api_health,
            requests_per_second: self.network.as_ref().map_or(0, |n| n.requests_per_second),
            error_rate_percent: self.network.as_ref().map_or(0.0, |n| n.error_rate_percent),
            cpu_percent: self.system.as_ref().map_or(0.0, |s| s.cpu_percent),
            memory_used: self.system.as_ref().map_or(0, |s| s.memory.used),
            uptime_seconds: self.system.as_ref().map_or(0, |s| s.uptime_seconds),
            llm_requests: self.llm.as_ref().map_or(0, |l| l.request_count),
        }
    }
}

/// A single category's snapshot, tagged with its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", content = "data", rename_all = "lowercase")]
pub enum CategorySnapshot {
    Network(NetworkSnapshot),
    Llm(LlmSnapshot),
    System(SystemSnapshot),
}

impl CategorySnapshot {
    pub fn category(&self) -> MetricsCategory {
        match self {
            CategorySnapshot::Network(_) => MetricsCategory::Network,
            CategorySnapshot::Llm(_) => MetricsCategory::Llm,
            CategorySnapshot::System(_) => MetricsCategory::System,
        }
    }
}

/// Reduced snapshot kept in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub requests_per_second: Option<u64>,
    pub error_rate_percent: Option<f64>,
    pub average_latency_ms: Option<f64>,
    pub active_connections: Option<u64>,
    pub cpu_percent: Option<f64>,
    pub memory_used: Option<u64>,
    pub llm_requests: Option<u64>,
    pub llm_tokens: Option<u64>,
    pub llm_cost: Option<f64>,
    #[serde(default)]
    pub failed_sections: Vec<MetricsCategory>,
}

impl From<&MetricsSnapshot> for HistoryRecord {
    fn from(snapshot: &MetricsSnapshot) -> Self {
        let network = snapshot.network.as_ref();
        let system = snapshot.system.as_ref();
        let llm = snapshot.llm.as_ref();

        Self {
            timestamp: snapshot.timestamp,
            requests_per_second: network.map(|n| n.requests_per_second),
            error_rate_percent: network.map(|n| n.error_rate_percent),
            average_latency_ms: network.map(|n| n.average_latency_ms),
            active_connections: network.map(|n| n.active_connections),
            cpu_percent: system.map(|s| s.cpu_percent),
            memory_used: system.map(|s| s.memory.used),
            llm_requests: llm.map(|l| l.request_count),
            llm_tokens: llm.map(|l| l.total_tokens),
            llm_cost: llm.map(|l| l.total_cost),
            failed_sections: snapshot.failed_sections.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiHealth {
    #[serde(rename = "OK")]
    Ok,
    Degraded,
    Unknown,
}

/// Headline numbers for an overview panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub timestamp: DateTime<Utc>,
    pub api_health: ApiHealth,
    pub requests_per_second: u64,
    pub error_rate_percent: f64,
    pub cpu_percent: f64,
    pub memory_used: u64,
    pub uptime_seconds: u64,
    pub llm_requests: u64,
}
