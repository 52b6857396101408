//! Log browsing over JSON-lines log files.
//!
//! Each log type is a file `<dir>/<type>.log`. Lines are either the
//! dashboard's own shape (`timestamp, level, service, message, metadata`)
//! or `tracing-subscriber` JSON output, which is mapped onto the same shape.
//! Lines that match neither are skipped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{MonitoringError, MonitoringResult};

lazy_static! {
    static ref LOG_TYPE: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").expect("log type pattern is valid");
}

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    #[serde(default)]
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Filters and pagination for [`LogBrowser::browse`]. A filter value of
/// `"all"` is the same as no filter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    pub page: usize,
    #[serde(alias = "pageSize")]
    pub page_size: usize,
    pub level: Option<String>,
    pub service: Option<String>,
    pub search: Option<String>,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            level: None,
            service: None,
            search: None,
        }
    }
}

fn active_filter(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("all"))
}

impl LogQuery {
    fn matches(&self, entry: &LogEntry) -> bool {
        if let Some(level) = active_filter(&self.level) {
            if !entry.level.eq_ignore_ascii_case(level) {
                return false;
            }
        }
        if let Some(service) = active_filter(&self.service) {
            if entry.service != service {
                return false;
            }
        }
        if let Some(search) = active_filter(&self.search) {
            let needle = search.to_lowercase();
            let in_message = entry.message.to_lowercase().contains(&needle);
            let in_metadata = !entry.metadata.is_null()
                && entry.metadata.to_string().to_lowercase().contains(&needle);
            if !in_message && !in_metadata {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
    pub total: usize,
    pub error_rate_percent: f64,
    pub avg_response_time_ms: f64,
}

impl LogStats {
    fn from_entries(entries: &[LogEntry]) -> Self {
        if entries.is_empty() {
            return Self::default();
        }

        let errors = entries
            .iter()
            .filter(|e| e.level.eq_ignore_ascii_case("error"))
            .count();
        let durations: Vec<f64> = entries
            .iter()
            .filter_map(|e| e.metadata.get("duration").and_then(Value::as_f64))
            .filter(|d| *d > 0.0)
            .collect();
        let avg_response_time_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        Self {
            total: entries.len(),
            error_rate_percent: round2(errors as f64 / entries.len() as f64 * 100.0),
            avg_response_time_ms: round2(avg_response_time_ms),
        }
    }
}

fn round2(value: f64) -> f64 {
    opspulse_kernel::metrics::round2(value)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPage {
    pub logs: Vec<LogEntry>,
    /// Entries matching the filters, across all pages.
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub stats: LogStats,
}

/// Read-only view over a directory of log files.
#[derive(Debug, Clone)]
pub struct LogBrowser {
    dir: PathBuf,
}

impl LogBrowser {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of the available log types, sorted.
    pub async fn list_types(&self) -> MonitoringResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut types = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if LOG_TYPE.is_match(stem) {
                    types.push(stem.to_string());
                }
            }
        }
        types.sort();
        Ok(types)
    }

    /// Newest-first, filtered and paginated entries of one log type. A log
    /// type without a file yields an empty page.
    pub async fn browse(&self, log_type: &str, query: &LogQuery) -> MonitoringResult<LogPage> {
        if !LOG_TYPE.is_match(log_type) {
            return Err(MonitoringError::InvalidLogType(log_type.to_string()));
        }

        let page = query.page.max(1);
        let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
        let path = self.dir.join(format!("{log_type}.log"));

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Log file not found");
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        // Invalid UTF-8 only spoils the lines it appears on.
        let content = String::from_utf8_lossy(&bytes);

        let mut entries: Vec<LogEntry> = content.lines().filter_map(parse_line).collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.retain(|e| query.matches(e));

        let stats = LogStats::from_entries(&entries);
        let total = entries.len();
        let logs = entries
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();

        Ok(LogPage {
            logs,
            total,
            page,
            page_size,
            stats,
        })
    }
}

/// Parse one log line in either supported shape.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(line).ok()?;

    if value.get("message").is_some() {
        return serde_json::from_value(value).ok();
    }

    // tracing-subscriber JSON: {"timestamp", "level", "fields": {"message", ...}, "target"}
    let timestamp = value
        .get("timestamp")?
        .as_str()?
        .parse::<DateTime<Utc>>()
        .ok()?;
    let level = value.get("level")?.as_str()?.to_lowercase();
    let mut fields = value.get("fields")?.as_object()?.clone();
    let message = match fields.remove("message")? {
        Value::String(s) => s,
        other => other.to_string(),
    };
    let service = value
        .get("target")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(LogEntry {
        timestamp,
        level,
        service,
        message,
        metadata: Value::Object(fields),
    })
}
