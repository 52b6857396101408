//! REST API endpoints for the dashboard

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use opspulse_kernel::metrics::{
    CategorySnapshot, LlmRequestRecord, MetricsCategory, MetricsSnapshot, MetricsSummary,
    RequestCost,
};
use opspulse_kernel::pricing::PricingTable;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::aggregator::{AggregatorState, MetricsAggregator};
use crate::error::MonitoringError;
use crate::llm::LlmUsageTracker;
use crate::logs::{LogBrowser, LogPage, LogQuery};
use crate::network::NetworkTracker;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    pub timestamp: u64,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: now_secs(),
        }
    }

    pub fn error(message: &str) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(message.to_string()),
            timestamp: now_secs(),
        }
    }
}

/// API error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(ApiResponse::<()>::error(&message));
        (status, body).into_response()
    }
}

impl From<MonitoringError> for ApiError {
    fn from(err: MonitoringError) -> Self {
        if err.is_invalid_input() {
            return ApiError::BadRequest(err.to_string());
        }
        match err {
            MonitoringError::Collect(_) | MonitoringError::SourceDisabled(_) => {
                ApiError::Unavailable(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Shared state for API handlers
pub struct ApiState {
    pub aggregator: Arc<MetricsAggregator>,
    pub network: Arc<NetworkTracker>,
    pub llm: Arc<LlmUsageTracker>,
    pub logs: Option<LogBrowser>,
    started_at: Instant,
}

impl ApiState {
    pub fn new(
        aggregator: Arc<MetricsAggregator>,
        network: Arc<NetworkTracker>,
        llm: Arc<LlmUsageTracker>,
        logs: Option<LogBrowser>,
    ) -> Self {
        Self {
            aggregator,
            network,
            llm,
            logs,
            started_at: Instant::now(),
        }
    }

    fn logs(&self) -> Result<&LogBrowser, ApiError> {
        self.logs
            .as_ref()
            .ok_or_else(|| ApiError::NotFound("Log browsing is not configured".to_string()))
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub aggregator: &'static str,
    pub uptime_seconds: u64,
    pub version: &'static str,
    /// Categories missing from the latest tick.
    pub failed_sections: Vec<MetricsCategory>,
}

/// Create the API router
pub fn create_api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .route("/metrics/history", get(get_history))
        .route("/metrics/{category}", get(get_category))
        .route("/overview", get(get_overview))
        .route("/health", get(get_health))
        .route("/llm/pricing", get(get_pricing).put(put_pricing))
        .route("/llm/requests", post(post_llm_request))
        .route("/llm/reset", post(reset_llm))
        .route("/network/reset", post(reset_network))
        .route("/logs", get(list_logs))
        .route("/logs/{log_type}", get(browse_logs))
        .with_state(state)
}

async fn get_metrics(State(state): State<Arc<ApiState>>) -> ApiResult<MetricsSnapshot> {
    let snapshot = state.aggregator.collect_metrics().await;
    Ok(Json(ApiResponse::success(snapshot.as_ref().clone())))
}

async fn get_category(
    State(state): State<Arc<ApiState>>,
    Path(category): Path<String>,
) -> ApiResult<CategorySnapshot> {
    let category: MetricsCategory = category
        .parse()
        .map_err(|e: opspulse_kernel::KernelError| ApiError::BadRequest(e.to_string()))?;
    let section = state.aggregator.query(category).await?;
    Ok(Json(ApiResponse::success(section)))
}

async fn get_history(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Vec<MetricsSnapshot>> {
    let history = state
        .aggregator
        .history(query.limit)
        .iter()
        .map(|s| s.as_ref().clone())
        .collect();
    Ok(Json(ApiResponse::success(history)))
}

async fn get_overview(State(state): State<Arc<ApiState>>) -> ApiResult<MetricsSummary> {
    let snapshot = state.aggregator.collect_metrics().await;
    Ok(Json(ApiResponse::success(snapshot.summary())))
}

async fn get_health(State(state): State<Arc<ApiState>>) -> Json<ApiResponse<HealthStatus>> {
    let aggregator = match state.aggregator.state() {
        AggregatorState::Running => "running",
        AggregatorState::Stopped => "stopped",
    };
    let failed_sections = state
        .aggregator
        .latest()
        .map(|s| s.failed_sections.clone())
        .unwrap_or_default();

    Json(ApiResponse::success(HealthStatus {
        status: "ok",
        aggregator,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        failed_sections,
    }))
}

async fn get_pricing(State(state): State<Arc<ApiState>>) -> ApiResult<PricingTable> {
    Ok(Json(ApiResponse::success(state.llm.pricing().as_ref().clone())))
}

/// Replace the pricing table wholesale.
async fn put_pricing(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<PricingTable>, JsonRejection>,
) -> ApiResult<PricingTable> {
    let Json(table) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    table.validate().map_err(MonitoringError::from)?;
    info!(models = table.models.len(), "Pricing table replaced");
    state.llm.update_pricing(table.clone());
    Ok(Json(ApiResponse::success(table)))
}

async fn post_llm_request(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<LlmRequestRecord>, JsonRejection>,
) -> ApiResult<RequestCost> {
    let Json(record) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(Json(ApiResponse::success(state.llm.track_request(&record))))
}

async fn reset_llm(State(state): State<Arc<ApiState>>) -> ApiResult<()> {
    state.llm.reset();
    info!("LLM usage counters reset");
    Ok(Json(ApiResponse::success(())))
}

async fn reset_network(State(state): State<Arc<ApiState>>) -> ApiResult<()> {
    state.network.reset();
    info!("Network counters reset");
    Ok(Json(ApiResponse::success(())))
}

async fn list_logs(State(state): State<Arc<ApiState>>) -> ApiResult<Vec<String>> {
    let types = state.logs()?.list_types().await?;
    Ok(Json(ApiResponse::success(types)))
}

async fn browse_logs(
    State(state): State<Arc<ApiState>>,
    Path(log_type): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<LogPage> {
    let page = state.logs()?.browse(&log_type, &query).await?;
    Ok(Json(ApiResponse::success(page)))
}
