//! Metrics aggregation pipeline
//!
//! On every tick the aggregator pulls one snapshot from each source (with
//! retry), caches the combined result briefly, appends it to history and
//! publishes it on the [`METRICS_UPDATE_TOPIC`] topic.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use opspulse_kernel::bus::{METRICS_UPDATE_TOPIC, Publisher};
use opspulse_kernel::metrics::{
    CategorySnapshot, CollectError, HistoryRecord, LlmSnapshot, MetricsCategory, MetricsSnapshot,
    NetworkSnapshot, SharedSource, SystemSnapshot,
};
use opspulse_kernel::retry::{RetryConfig, RetryError, retry_with_policy};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MonitoringError, MonitoringResult};
use crate::history::{HistorySink, NoopHistorySink};

/// Aggregator configuration
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Period of the aggregation tick
    pub collection_interval: Duration,
    /// How long a combined snapshot is served from cache
    pub cache_ttl: Duration,
    /// Retry policy applied to each source
    pub retry: RetryConfig,
    /// Number of snapshots kept in memory
    pub history_retention: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            collection_interval: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(2),
            retry: RetryConfig::default(),
            history_retention: 720, // 1 hour at the default interval
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatorState {
    Stopped,
    Running,
}

struct CachedSnapshot {
    at: Instant,
    snapshot: Arc<MetricsSnapshot>,
}

struct Runner {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Clears the in-flight flag even if a tick is dropped halfway.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct MetricsAggregator {
    config: AggregatorConfig,
    network: SharedSource<NetworkSnapshot>,
    llm: SharedSource<LlmSnapshot>,
    system: Option<SharedSource<SystemSnapshot>>,
    publisher: Arc<dyn Publisher>,
    history_sink: Arc<dyn HistorySink>,
    cache: RwLock<Option<CachedSnapshot>>,
    refresh: AsyncMutex<()>,
    history: parking_lot::Mutex<VecDeque<Arc<MetricsSnapshot>>>,
    in_flight: AtomicBool,
    runner: parking_lot::Mutex<Option<Runner>>,
}

impl MetricsAggregator {
    pub fn new(
        network: SharedSource<NetworkSnapshot>,
        llm: SharedSource<LlmSnapshot>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            config: AggregatorConfig::default(),
            network,
            llm,
            system: None,
            publisher,
            history_sink: Arc::new(NoopHistorySink),
            cache: RwLock::new(None),
            refresh: AsyncMutex::new(()),
            history: parking_lot::Mutex::new(VecDeque::new()),
            in_flight: AtomicBool::new(false),
            runner: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_system(mut self, system: SharedSource<SystemSnapshot>) -> Self {
        self.system = Some(system);
        self
    }

    pub fn with_history_sink(mut self, sink: Arc<dyn HistorySink>) -> Self {
        self.history_sink = sink;
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn state(&self) -> AggregatorState {
        if self.runner.lock().is_some() {
            AggregatorState::Running
        } else {
            AggregatorState::Stopped
        }
    }

    /// Spawn the tick loop. Returns `false` if it is already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            warn!("Metrics aggregation already running");
            return false;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let aggregator = Arc::clone(self);
        let interval = self.config.collection_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {
                        aggregator.tick().await;
                    }
                }
            }
        });

        *runner = Some(Runner { token, handle });
        info!("Starting metrics aggregation with interval {:?}", interval);
        true
    }

    /// Cancel the timer and wait for the loop to exit. A tick that is
    /// already running completes first.
    pub async fn stop(&self) {
        let runner = self.runner.lock().take();
        let Some(Runner { token, handle }) = runner else {
            return;
        };

        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Aggregation loop ended abnormally");
        }
        info!("Metrics aggregation stopped");
    }

    /// One aggregation round: collect, record history, publish. Returns
    /// `None` when another tick is still running.
    pub async fn tick(&self) -> Option<Arc<MetricsSnapshot>> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            debug!("Previous aggregation tick still running, skipping");
            return None;
        }
        let _in_flight = InFlight(&self.in_flight);

        let snapshot = self.collect_metrics().await;
        self.record_history(&snapshot).await;

        match serde_json::to_value(snapshot.as_ref()) {
            Ok(payload) => match self.publisher.publish(METRICS_UPDATE_TOPIC, payload).await {
                Ok(receivers) => debug!(receivers, "Published metrics update"),
                Err(e) => warn!(error = %e, "Failed to publish metrics update"),
            },
            Err(e) => warn!(error = %e, "Failed to serialize metrics snapshot"),
        }

        Some(snapshot)
    }

    /// Combined snapshot, served from cache while it is younger than the TTL.
    pub async fn collect_metrics(&self) -> Arc<MetricsSnapshot> {
        if let Some(snapshot) = self.cached().await {
            return snapshot;
        }

        let _refresh = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(snapshot) = self.cached().await {
            return snapshot;
        }

        let snapshot = Arc::new(self.collect_fresh().await);
        *self.cache.write().await = Some(CachedSnapshot {
            at: Instant::now(),
            snapshot: Arc::clone(&snapshot),
        });
        snapshot
    }

    async fn cached(&self) -> Option<Arc<MetricsSnapshot>> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|c| c.at.elapsed() < self.config.cache_ttl)
            .map(|c| Arc::clone(&c.snapshot))
    }

    async fn collect_fresh(&self) -> MetricsSnapshot {
        let system = async {
            match &self.system {
                Some(source) => Some(self.fetch(source).await),
                None => None,
            }
        };
        let (network, llm, system) =
            tokio::join!(self.fetch(&self.network), self.fetch(&self.llm), system);

        let mut failed_sections = Vec::new();
        let network = keep_or_record(network, &mut failed_sections);
        let llm = keep_or_record(llm, &mut failed_sections);
        let system = system.and_then(|s| keep_or_record(s, &mut failed_sections));

        MetricsSnapshot {
            timestamp: Utc::now(),
            network,
            llm,
            system,
            failed_sections,
        }
    }

    async fn fetch<T>(&self, source: &SharedSource<T>) -> Result<T, CollectError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let category = source.category();
        retry_with_policy(&self.config.retry, CollectError::is_retryable, || {
            source.collect()
        })
        .await
        .map_err(|e| match e {
            RetryError::BudgetExceeded { attempts, .. } => {
                CollectError::Timeout { category, attempts }
            }
            RetryError::Exhausted { attempts, error } => CollectError::Exhausted {
                category,
                attempts,
                reason: error.to_string(),
            },
            RetryError::Aborted { error, .. } => error,
        })
    }

    /// A single section, collected now without touching the cache.
    pub async fn query(&self, category: MetricsCategory) -> MonitoringResult<CategorySnapshot> {
        let snapshot = match category {
            MetricsCategory::Network => self.fetch(&self.network).await.map(CategorySnapshot::Network),
            MetricsCategory::Llm => self.fetch(&self.llm).await.map(CategorySnapshot::Llm),
            MetricsCategory::System => match &self.system {
                Some(source) => self.fetch(source).await.map(CategorySnapshot::System),
                None => return Err(MonitoringError::SourceDisabled(MetricsCategory::System)),
            },
        };
        Ok(snapshot?)
    }

    async fn record_history(&self, snapshot: &Arc<MetricsSnapshot>) {
        {
            let mut history = self.history.lock();
            history.push_back(Arc::clone(snapshot));
            while history.len() > self.config.history_retention.max(1) {
                history.pop_front();
            }
        }

        let record = HistoryRecord::from(snapshot.as_ref());
        if let Err(e) = self.history_sink.append(&record).await {
            warn!(error = %e, "Failed to persist metrics history");
        }
    }

    /// The most recent `limit` snapshots, oldest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<Arc<MetricsSnapshot>> {
        let history = self.history.lock();
        let skip = limit.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    /// The snapshot produced by the most recent tick.
    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.history.lock().back().cloned()
    }
}

fn keep_or_record<T>(
    result: Result<T, CollectError>,
    failed: &mut Vec<MetricsCategory>,
) -> Option<T> {
    match result {
        Ok(section) => Some(section),
        Err(e) => {
            warn!(category = %e.category(), error = %e, "Omitting metrics section");
            failed.push(e.category());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmUsageTracker;
    use crate::network::NetworkTracker;
    use async_trait::async_trait;
    use opspulse_kernel::bus::TopicBus;
    use opspulse_kernel::metrics::{HardwareInfo, SnapshotSource};
    use std::sync::atomic::AtomicUsize;

    /// Wraps a fixed value; fails the first `failures` calls and can be slow.
    struct ScriptedSource<T> {
        category: MetricsCategory,
        value: T,
        failures: usize,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl<T> ScriptedSource<T> {
        fn new(category: MetricsCategory, value: T) -> Self {
            Self {
                category,
                value,
                failures: 0,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(mut self, failures: usize) -> Self {
            self.failures = failures;
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> SnapshotSource for ScriptedSource<T> {
        type Snapshot = T;

        fn category(&self) -> MetricsCategory {
            self.category
        }

        async fn collect(&self) -> Result<T, CollectError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if n < self.failures {
                return Err(CollectError::unavailable(self.category, "collector failed"));
            }
            Ok(self.value.clone())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl HistorySink for FailingSink {
        async fn append(&self, _record: &HistoryRecord) -> MonitoringResult<()> {
            Err(std::io::Error::other("disk full").into())
        }
    }

    fn system_snapshot() -> SystemSnapshot {
        SystemSnapshot {
            timestamp: Utc::now(),
            cpu_percent: 12.5,
            memory: Default::default(),
            disk_usage: Default::default(),
            uptime_seconds: 1,
            os_uptime_seconds: 1,
            load_average: [0.0; 3],
            platform: "linux".into(),
            hostname: "test".into(),
            network_io: Default::default(),
            hardware_info: HardwareInfo::default(),
        }
    }

    fn aggregator_with_system(
        system: Arc<ScriptedSource<SystemSnapshot>>,
        bus: &TopicBus,
    ) -> Arc<MetricsAggregator> {
        Arc::new(
            MetricsAggregator::new(
                Arc::new(NetworkTracker::new()),
                Arc::new(LlmUsageTracker::default()),
                Arc::new(bus.clone()),
            )
            .with_system(system),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_cached_for_ttl() {
        let system = Arc::new(ScriptedSource::new(MetricsCategory::System, system_snapshot()));
        let aggregator = aggregator_with_system(system.clone(), &TopicBus::new());

        let first = aggregator.collect_metrics().await;
        let second = aggregator.collect_metrics().await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(system.calls(), 1);
        assert!(first.is_complete());

        tokio::time::advance(Duration::from_secs(2)).await;
        let third = aggregator.collect_metrics().await;
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(system.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let system = Arc::new(
            ScriptedSource::new(MetricsCategory::System, system_snapshot()).failing(2),
        );
        let aggregator = aggregator_with_system(system.clone(), &TopicBus::new());

        let snapshot = aggregator.collect_metrics().await;
        assert_eq!(system.calls(), 3);
        assert_eq!(snapshot.system.as_ref().unwrap().cpu_percent, 12.5);
        assert!(snapshot.failed_sections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_section_is_omitted() {
        let system = Arc::new(
            ScriptedSource::new(MetricsCategory::System, system_snapshot()).failing(usize::MAX),
        );
        let aggregator = aggregator_with_system(system.clone(), &TopicBus::new());
        let start = Instant::now();

        let snapshot = aggregator.collect_metrics().await;
        assert_eq!(system.calls(), 3);
        assert!(snapshot.system.is_none());
        assert!(snapshot.network.is_some());
        assert!(snapshot.llm.is_some());
        assert_eq!(snapshot.failed_sections, vec![MetricsCategory::System]);
        assert_eq!(start.elapsed(), Duration::from_millis(1_500));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_section_is_bounded_by_budget() {
        let system = Arc::new(
            ScriptedSource::new(MetricsCategory::System, system_snapshot())
                .slow(Duration::from_secs(10)),
        );
        let aggregator = aggregator_with_system(system, &TopicBus::new());
        let start = Instant::now();

        let snapshot = aggregator.collect_metrics().await;
        assert!(snapshot.system.is_none());
        assert_eq!(snapshot.failed_sections, vec![MetricsCategory::System]);
        assert_eq!(start.elapsed(), Duration::from_millis(3_500));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_publishes_and_records_history() {
        let bus = TopicBus::new();
        let mut rx = bus.subscribe(METRICS_UPDATE_TOPIC).await.unwrap();
        let system = Arc::new(ScriptedSource::new(MetricsCategory::System, system_snapshot()));
        let aggregator = aggregator_with_system(system, &bus);

        let snapshot = aggregator.tick().await.unwrap();
        let envelope = rx.recv().await.unwrap();
        let published: MetricsSnapshot = envelope.decode().unwrap();
        assert_eq!(published.timestamp, snapshot.timestamp);
        assert_eq!(aggregator.history(None).len(), 1);
        assert!(Arc::ptr_eq(&aggregator.latest().unwrap(), &snapshot));
    }

    #[tokio::test(start_paused = true)]
    async fn sink_failure_does_not_stop_publishing() {
        let bus = TopicBus::new();
        let mut rx = bus.subscribe(METRICS_UPDATE_TOPIC).await.unwrap();
        let aggregator = Arc::new(
            MetricsAggregator::new(
                Arc::new(NetworkTracker::new()),
                Arc::new(LlmUsageTracker::default()),
                Arc::new(bus.clone()),
            )
            .with_history_sink(Arc::new(FailingSink)),
        );

        assert!(aggregator.tick().await.is_some());
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let system = Arc::new(
            ScriptedSource::new(MetricsCategory::System, system_snapshot())
                .slow(Duration::from_secs(1)),
        );
        let aggregator = aggregator_with_system(system, &TopicBus::new());

        let running = {
            let aggregator = Arc::clone(&aggregator);
            tokio::spawn(async move { aggregator.tick().await })
        };
        tokio::task::yield_now().await;

        assert!(aggregator.tick().await.is_none());
        assert!(running.await.unwrap().is_some());
        // The flag is cleared once the first tick completes.
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(aggregator.tick().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn start_and_stop_drive_the_timer() {
        let system = Arc::new(ScriptedSource::new(MetricsCategory::System, system_snapshot()));
        let aggregator = aggregator_with_system(system, &TopicBus::new());
        assert_eq!(aggregator.state(), AggregatorState::Stopped);

        assert!(aggregator.start());
        assert!(!aggregator.start());
        assert_eq!(aggregator.state(), AggregatorState::Running);

        tokio::time::sleep(Duration::from_millis(11_000)).await;
        assert_eq!(aggregator.history(None).len(), 2);

        aggregator.stop().await;
        assert_eq!(aggregator.state(), AggregatorState::Stopped);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(aggregator.history(None).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn query_bypasses_cache() {
        let system = Arc::new(ScriptedSource::new(MetricsCategory::System, system_snapshot()));
        let aggregator = aggregator_with_system(system.clone(), &TopicBus::new());

        aggregator.collect_metrics().await;
        let section = aggregator.query(MetricsCategory::System).await.unwrap();
        assert_eq!(section.category(), MetricsCategory::System);
        assert_eq!(system.calls(), 2);

        let network = aggregator.query(MetricsCategory::Network).await.unwrap();
        assert!(matches!(network, CategorySnapshot::Network(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn query_without_system_source() {
        let aggregator = MetricsAggregator::new(
            Arc::new(NetworkTracker::new()),
            Arc::new(LlmUsageTracker::default()),
            Arc::new(TopicBus::new()),
        );
        assert!(matches!(
            aggregator.query(MetricsCategory::System).await,
            Err(MonitoringError::SourceDisabled(MetricsCategory::System))
        ));

        // A missing system source is not a failure.
        let snapshot = aggregator.collect_metrics().await;
        assert!(snapshot.system.is_none());
        assert!(snapshot.failed_sections.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_is_bounded_and_limited() {
        let aggregator = Arc::new(
            MetricsAggregator::new(
                Arc::new(NetworkTracker::new()),
                Arc::new(LlmUsageTracker::default()),
                Arc::new(TopicBus::new()),
            )
            .with_config(AggregatorConfig {
                history_retention: 3,
                cache_ttl: Duration::ZERO,
                ..AggregatorConfig::default()
            }),
        );

        for _ in 0..5 {
            aggregator.tick().await;
            tokio::time::advance(Duration::from_millis(10)).await;
        }

        let all = aggregator.history(None);
        assert_eq!(all.len(), 3);
        let last_two = aggregator.history(Some(2));
        assert_eq!(last_two.len(), 2);
        assert!(Arc::ptr_eq(&last_two[1], &all[2]));
        assert!(all[0].timestamp <= all[2].timestamp);
    }
}
