//! Dashboard web server
//!
//! Serves the REST API under `/api` and the WebSocket feed at `/ws`.

use axum::{
    Router,
    http::Method,
    middleware,
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use super::api::{ApiState, create_api_router};
use super::instrument::track_http;
use super::websocket::{WebSocketHub, ws_handler};
use crate::error::MonitoringResult;
use crate::stack::MonitoringStack;

/// Dashboard server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Enable CORS
    pub enable_cors: bool,
    /// Enable request tracing
    pub enable_tracing: bool,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: true,
            enable_tracing: true,
        }
    }
}

impl DashboardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }
}

/// Dashboard server
pub struct DashboardServer {
    config: DashboardConfig,
    stack: Arc<MonitoringStack>,
    hub: Arc<WebSocketHub>,
}

impl DashboardServer {
    pub fn new(config: DashboardConfig, stack: Arc<MonitoringStack>) -> Self {
        let hub = Arc::new(WebSocketHub::new(
            stack.aggregator.clone(),
            stack.bus.clone(),
            stack.network.clone(),
        ));
        Self { config, stack, hub }
    }

    pub fn config(&self) -> &DashboardConfig {
        &self.config
    }

    pub fn stack(&self) -> Arc<MonitoringStack> {
        self.stack.clone()
    }

    pub fn ws_hub(&self) -> Arc<WebSocketHub> {
        self.hub.clone()
    }

    /// Build the router
    pub fn build_router(&self) -> Router {
        let api_state = Arc::new(ApiState::new(
            self.stack.aggregator.clone(),
            self.stack.network.clone(),
            self.stack.llm.clone(),
            self.stack.logs.clone(),
        ));

        let ws_router = Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.hub.clone());

        let mut router = Router::new()
            .nest("/api", create_api_router(api_state))
            .merge(ws_router)
            .layer(middleware::from_fn_with_state(
                self.stack.network.clone(),
                track_http,
            ));

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }

        if self.config.enable_cors {
            let cors = CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers(Any);
            router = router.layer(cors);
        }

        router
    }

    /// Bind and serve until `shutdown` resolves. The monitoring stack is
    /// started before accepting connections and shut down afterwards.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> MonitoringResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.config.socket_addr();
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;

        self.stack.start();
        info!("Starting dashboard server on {}", addr);
        info!("Dashboard URL: http://{}", addr);

        let served = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await;

        info!("Dashboard server stopping");
        self.stack.shutdown().await;
        served?;
        Ok(())
    }
}
