//! History persistence for aggregated snapshots.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opspulse_kernel::metrics::HistoryRecord;
use tokio::io::AsyncWriteExt;

use crate::error::MonitoringResult;

/// Destination for the reduced record written on every aggregation tick.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn append(&self, record: &HistoryRecord) -> MonitoringResult<()>;
}

/// Discards every record.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistorySink;

#[async_trait]
impl HistorySink for NoopHistorySink {
    async fn append(&self, _record: &HistoryRecord) -> MonitoringResult<()> {
        Ok(())
    }
}

/// Appends one JSON line per record to `<dir>/metrics-YYYY-MM-DD.jsonl`,
/// split by the record's UTC day.
#[derive(Debug, Clone)]
pub struct JsonlHistorySink {
    dir: PathBuf,
}

impl JsonlHistorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_for(&self, timestamp: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("metrics-{}.jsonl", timestamp.format("%Y-%m-%d")))
    }
}

#[async_trait]
impl HistorySink for JsonlHistorySink {
    async fn append(&self, record: &HistoryRecord) -> MonitoringResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_for(record.timestamp))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
