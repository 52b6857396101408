//! HTTP/WebSocket traffic tracker
//!
//! Counters are updated synchronously from the instrumentation layer. Rates
//! are never accumulated: a 1 s ticker diffs the running totals against the
//! previous tick and the snapshot reports the last computed value.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use opspulse_kernel::metrics::{
    CollectError, ConnectionStats, ErrorStats, LatencyStats, MetricsCategory, NetworkDetail,
    NetworkSnapshot, RequestEvent, RequestTotals, ResponseEvent, SnapshotSource, TrafficTotals,
    round2,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Number of latency samples kept for min/max/average.
pub const LATENCY_WINDOW: usize = 1000;

/// Default period of the rate ticker.
pub const RATE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Http,
    WebSocket,
}

#[derive(Debug, Clone, Copy, Default)]
struct Rates {
    requests_per_second: u64,
    bytes_in_rate: u64,
    bytes_out_rate: u64,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    at: Instant,
    requests: u64,
    bytes_in: u64,
    bytes_out: u64,
}

#[derive(Debug, Default)]
struct NetworkState {
    requests: u64,
    bytes_in: u64,
    bytes_out: u64,
    by_method: BTreeMap<String, u64>,
    by_path: BTreeMap<String, u64>,
    connections: ConnectionStats,
    latencies: VecDeque<f64>,
    latency_min: f64,
    latency_max: f64,
    errors: ErrorStats,
    rates: Rates,
    baseline: Option<Baseline>,
}

impl NetworkState {
    fn push_latency(&mut self, duration_ms: f64) {
        if self.latencies.is_empty() {
            self.latency_min = duration_ms;
            self.latency_max = duration_ms;
        } else {
            self.latency_min = self.latency_min.min(duration_ms);
            self.latency_max = self.latency_max.max(duration_ms);
        }
        self.latencies.push_back(duration_ms);

        if self.latencies.len() > LATENCY_WINDOW {
            if let Some(evicted) = self.latencies.pop_front() {
                if evicted <= self.latency_min || evicted >= self.latency_max {
                    self.recompute_extremes();
                }
            }
        }
    }

    fn recompute_extremes(&mut self) {
        let (min, max) = self
            .latencies
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
                (lo.min(*v), hi.max(*v))
            });
        if self.latencies.is_empty() {
            self.latency_min = 0.0;
            self.latency_max = 0.0;
        } else {
            self.latency_min = min;
            self.latency_max = max;
        }
    }

    fn latency_stats(&self) -> LatencyStats {
        let samples = self.latencies.len();
        if samples == 0 {
            return LatencyStats::default();
        }
        let sum: f64 = self.latencies.iter().sum();
        LatencyStats {
            average: round2(sum / samples as f64),
            min: self.latency_min,
            max: self.latency_max,
            samples,
        }
    }

    fn error_rate_percent(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        round2(self.errors.count as f64 / self.requests as f64 * 100.0)
    }
}

/// Request, traffic, latency, error and connection counters.
#[derive(Debug, Default)]
pub struct NetworkTracker {
    state: Mutex<NetworkState>,
}

impl NetworkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track_request(&self, event: &RequestEvent) {
        let path = normalize_path(&event.path);
        let mut state = self.state.lock();
        state.requests += 1;
        state.bytes_in += event.bytes_in;
        *state.by_method.entry(event.method.clone()).or_insert(0) += 1;
        *state.by_path.entry(path).or_insert(0) += 1;
    }

    pub fn track_response(&self, event: &ResponseEvent) {
        let mut state = self.state.lock();
        state.bytes_out += event.bytes_out;

        if event.duration_ms > 0.0 {
            state.push_latency(event.duration_ms);
        }

        if event.status_code >= 400 {
            let family = (event.status_code / 100) * 100;
            state.errors.count += 1;
            *state.errors.by_family.entry(family).or_insert(0) += 1;
        }
    }

    /// Record a connection opening (`connect = true`) or closing.
    /// Gauges never go below zero.
    pub fn track_connection(&self, kind: ConnectionKind, connect: bool) {
        let mut state = self.state.lock();
        let connections = &mut state.connections;
        let gauge = match kind {
            ConnectionKind::Http => &mut connections.http,
            ConnectionKind::WebSocket => &mut connections.websocket,
        };

        if connect {
            *gauge += 1;
            connections.active += 1;
            connections.total += 1;
        } else {
            *gauge = gauge.saturating_sub(1);
            connections.active = connections.active.saturating_sub(1);
        }
    }

    /// Diff totals against the previous call. The first call (and the first
    /// call after a reset) only records the baseline.
    pub fn calculate_rates(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let current = Baseline {
            at: now,
            requests: state.requests,
            bytes_in: state.bytes_in,
            bytes_out: state.bytes_out,
        };

        let Some(previous) = state.baseline.replace(current) else {
            trace!("Rate baseline primed");
            return;
        };

        let elapsed = now.duration_since(previous.at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }

        let per_second = |delta: u64| (delta as f64 / elapsed).round() as u64;
        state.rates = Rates {
            requests_per_second: per_second(current.requests.saturating_sub(previous.requests)),
            bytes_in_rate: per_second(current.bytes_in.saturating_sub(previous.bytes_in)),
            bytes_out_rate: per_second(current.bytes_out.saturating_sub(previous.bytes_out)),
        };
    }

    /// Drive [`calculate_rates`](Self::calculate_rates) every `interval` until
    /// `token` is cancelled.
    pub fn spawn_rate_ticker(
        self: &Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => tracker.calculate_rates(),
                }
            }
            debug!("Network rate ticker stopped");
        })
    }

    pub fn metrics(&self) -> NetworkSnapshot {
        let state = self.state.lock();
        let latency = state.latency_stats();

        NetworkSnapshot {
            timestamp: Utc::now(),
            requests_per_second: state.rates.requests_per_second,
            bytes_in_rate: state.rates.bytes_in_rate,
            bytes_out_rate: state.rates.bytes_out_rate,
            active_connections: state.connections.active,
            error_rate_percent: state.error_rate_percent(),
            average_latency_ms: latency.average,
            by_method: state.by_method.clone(),
            by_normalized_path: state.by_path.clone(),
            detail: NetworkDetail {
                requests: RequestTotals {
                    total: state.requests,
                },
                traffic: TrafficTotals {
                    bytes_in: state.bytes_in,
                    bytes_out: state.bytes_out,
                },
                connections: state.connections,
                latency,
                errors: state.errors.clone(),
            },
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = NetworkState::default();
    }
}

#[async_trait]
impl SnapshotSource for NetworkTracker {
    type Snapshot = NetworkSnapshot;

    fn category(&self) -> MetricsCategory {
        MetricsCategory::Network
    }

    async fn collect(&self) -> Result<NetworkSnapshot, CollectError> {
        Ok(self.metrics())
    }
}

/// Collapse identifier segments to `:id` so `/users/42` and `/users/43`
/// count as one route. Decimal runs, 24-hex ObjectIds and UUIDs are
/// replaced; applying it twice gives the same result.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| if is_identifier(segment) { ":id" } else { segment })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_identifier(segment: &str) -> bool {
    if segment.is_empty() {
        return false;
    }
    let bytes = segment.as_bytes();
    if bytes.iter().all(u8::is_ascii_digit) {
        return true;
    }
    if bytes.len() == 24 && bytes.iter().all(u8::is_ascii_hexdigit) {
        return true;
    }
    bytes.len() == 36
        && bytes.iter().enumerate().all(|(i, b)| match i {
            8 | 13 | 18 | 23 => *b == b'-',
            _ => b.is_ascii_hexdigit(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, method: &str, bytes_in: u64) -> RequestEvent {
        RequestEvent {
            path: path.to_string(),
            method: method.to_string(),
            start: Instant::now(),
            bytes_in,
        }
    }

    fn response(status_code: u16, duration_ms: f64) -> ResponseEvent {
        ResponseEvent {
            bytes_out: 100,
            status_code,
            duration_ms,
        }
    }

    #[test]
    fn normalize_replaces_identifier_segments() {
        assert_eq!(normalize_path("/users/123"), "/users/:id");
        assert_eq!(
            normalize_path("/items/507f1f77bcf86cd799439011/edit"),
            "/items/:id/edit"
        );
        assert_eq!(
            normalize_path("/runs/550e8400-e29b-41d4-a716-446655440000"),
            "/runs/:id"
        );
        assert_eq!(normalize_path("/api/v2/metrics"), "/api/v2/metrics");
        assert_eq!(normalize_path("/"), "/");
    }

    #[test]
    fn numeric_and_object_ids_share_a_bucket() {
        assert_eq!(
            normalize_path("/users/42"),
            normalize_path("/users/507f1f77bcf86cd799439011")
        );
    }

    #[test]
    fn normalize_is_idempotent() {
        for path in ["/users/123/posts/9", "/a/507f1f77bcf86cd799439011", "/x/:id"] {
            let once = normalize_path(path);
            assert_eq!(normalize_path(&once), once);
        }
    }

    #[test]
    fn requests_are_counted_by_method_and_path() {
        let tracker = NetworkTracker::new();
        tracker.track_request(&request("/users/1", "GET", 10));
        tracker.track_request(&request("/users/2", "GET", 20));
        tracker.track_request(&request("/users", "POST", 30));

        let snapshot = tracker.metrics();
        assert_eq!(snapshot.detail.requests.total, 3);
        assert_eq!(snapshot.detail.traffic.bytes_in, 60);
        assert_eq!(snapshot.by_method["GET"], 2);
        assert_eq!(snapshot.by_method["POST"], 1);
        assert_eq!(snapshot.by_normalized_path["/users/:id"], 2);
        assert_eq!(snapshot.by_normalized_path["/users"], 1);
    }

    #[test]
    fn error_families_and_rate() {
        let tracker = NetworkTracker::new();
        for _ in 0..4 {
            tracker.track_request(&request("/", "GET", 0));
        }
        tracker.track_response(&response(200, 5.0));
        tracker.track_response(&response(404, 5.0));
        tracker.track_response(&response(418, 5.0));
        tracker.track_response(&response(503, 5.0));

        let snapshot = tracker.metrics();
        assert_eq!(snapshot.detail.errors.count, 3);
        assert_eq!(snapshot.detail.errors.by_family[&400], 2);
        assert_eq!(snapshot.detail.errors.by_family[&500], 1);
        assert_eq!(snapshot.error_rate_percent, 75.0);
        assert_eq!(snapshot.detail.traffic.bytes_out, 400);
    }

    #[test]
    fn zero_duration_is_not_a_latency_sample() {
        let tracker = NetworkTracker::new();
        tracker.track_response(&response(200, 0.0));
        let latency = tracker.metrics().detail.latency;
        assert_eq!(latency.samples, 0);
        assert_eq!(latency.min, 0.0);
        assert_eq!(latency.max, 0.0);
    }

    #[test]
    fn latency_window_evicts_oldest_and_recomputes_extremes() {
        let tracker = NetworkTracker::new();
        tracker.track_response(&response(200, 1.0));
        tracker.track_response(&response(200, 500.0));
        for _ in 0..(LATENCY_WINDOW - 2) {
            tracker.track_response(&response(200, 10.0));
        }

        let latency = tracker.metrics().detail.latency;
        assert_eq!(latency.samples, LATENCY_WINDOW);
        assert_eq!(latency.min, 1.0);
        assert_eq!(latency.max, 500.0);

        // Evicts 1.0
        tracker.track_response(&response(200, 10.0));
        let latency = tracker.metrics().detail.latency;
        assert_eq!(latency.samples, LATENCY_WINDOW);
        assert_eq!(latency.min, 10.0);
        assert_eq!(latency.max, 500.0);

        // Evicts 500.0
        tracker.track_response(&response(200, 10.0));
        let latency = tracker.metrics().detail.latency;
        assert_eq!(latency.max, 10.0);
        assert_eq!(latency.average, 10.0);
    }

    #[test]
    fn connection_gauges_saturate_at_zero() {
        let tracker = NetworkTracker::new();
        tracker.track_connection(ConnectionKind::WebSocket, true);
        tracker.track_connection(ConnectionKind::Http, true);
        tracker.track_connection(ConnectionKind::Http, false);
        tracker.track_connection(ConnectionKind::Http, false);

        let connections = tracker.metrics().detail.connections;
        assert_eq!(connections.http, 0);
        assert_eq!(connections.websocket, 1);
        assert_eq!(connections.active, 0);
        assert_eq!(connections.total, 2);

        tracker.track_connection(ConnectionKind::WebSocket, false);
        tracker.track_connection(ConnectionKind::WebSocket, false);
        let connections = tracker.metrics().detail.connections;
        assert_eq!(connections.websocket, 0);
        assert_eq!(connections.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn first_rate_calculation_only_primes() {
        let tracker = NetworkTracker::new();
        tracker.track_request(&request("/", "GET", 1000));
        tracker.calculate_rates();
        assert_eq!(tracker.metrics().requests_per_second, 0);

        for _ in 0..9 {
            tracker.track_request(&request("/", "GET", 1000));
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        tracker.calculate_rates();

        let snapshot = tracker.metrics();
        // 9 requests over 2 s rounds to 5
        assert_eq!(snapshot.requests_per_second, 5);
        assert_eq!(snapshot.bytes_in_rate, 4500);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_ticker_updates_every_interval() {
        let tracker = Arc::new(NetworkTracker::new());
        let token = CancellationToken::new();
        let handle = tracker.spawn_rate_ticker(RATE_INTERVAL, token.clone());

        tokio::time::sleep(Duration::from_millis(100)).await;
        for _ in 0..5 {
            tracker.track_request(&request("/", "GET", 0));
        }
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(tracker.metrics().requests_per_second, 5);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reset_clears_counters_and_baseline() {
        let tracker = NetworkTracker::new();
        tracker.calculate_rates();
        tracker.track_request(&request("/", "GET", 10));
        tokio::time::advance(Duration::from_secs(1)).await;
        tracker.calculate_rates();
        assert_eq!(tracker.metrics().requests_per_second, 1);

        tracker.reset();
        let snapshot = tracker.metrics();
        assert_eq!(snapshot.requests_per_second, 0);
        assert_eq!(snapshot.detail.requests.total, 0);
        assert!(snapshot.by_method.is_empty());

        // After a reset the next call primes again instead of diffing.
        tracker.calculate_rates();
        assert_eq!(tracker.metrics().requests_per_second, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_tracking_keeps_exact_totals() {
        const TASKS: u64 = 8;
        const ROUNDS: u64 = 500;
        let tracker = Arc::new(NetworkTracker::new());

        let handles: Vec<_> = (0..TASKS)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move {
                    for i in 0..ROUNDS {
                        tracker.track_connection(ConnectionKind::Http, true);
                        tracker.track_request(&request("/users/7", "GET", 10));
                        let status = if i % 4 == 0 { 500 } else { 200 };
                        tracker.track_response(&response(status, 2.0));
                        tracker.track_connection(ConnectionKind::Http, false);
                        if i % 50 == 0 {
                            tokio::task::yield_now().await;
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let detail = tracker.metrics().detail;
        assert_eq!(detail.requests.total, TASKS * ROUNDS);
        assert_eq!(detail.traffic.bytes_in, TASKS * ROUNDS * 10);
        assert_eq!(detail.traffic.bytes_out, TASKS * ROUNDS * 100);
        assert_eq!(detail.errors.count, TASKS * ROUNDS / 4);
        assert_eq!(detail.errors.by_family[&500], TASKS * ROUNDS / 4);
        assert_eq!(detail.connections.total, TASKS * ROUNDS);
        assert_eq!(detail.connections.active, 0);
        assert_eq!(detail.connections.http, 0);
    }
}
