//! HTTP and WebSocket surface of the monitoring stack

pub mod api;
pub mod instrument;
pub mod server;
pub mod websocket;

pub use api::{ApiError, ApiResponse, ApiState, create_api_router};
pub use instrument::track_http;
pub use server::{DashboardConfig, DashboardServer};
pub use websocket::{ClientMessage, ServerMessage, WebSocketHub};
