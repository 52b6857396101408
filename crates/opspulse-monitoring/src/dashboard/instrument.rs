//! HTTP boundary instrumentation feeding the network tracker.

use axum::{
    body::HttpBody,
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use opspulse_kernel::metrics::{RequestEvent, ResponseEvent};
use std::sync::Arc;
use tokio::time::Instant;

use crate::network::{ConnectionKind, NetworkTracker};

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Open HTTP connection on the tracker; closes it when dropped, including
/// when the request future is cancelled mid-flight.
struct HttpConnection {
    network: Arc<NetworkTracker>,
}

impl HttpConnection {
    fn open(network: Arc<NetworkTracker>) -> Self {
        network.track_connection(ConnectionKind::Http, true);
        Self { network }
    }
}

impl Drop for HttpConnection {
    fn drop(&mut self) {
        self.network.track_connection(ConnectionKind::Http, false);
    }
}

/// Records every request/response pair on the tracker. Use with
/// `axum::middleware::from_fn_with_state`.
pub async fn track_http(
    State(network): State<Arc<NetworkTracker>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let bytes_in = content_length(request.headers())
        .or_else(|| request.body().size_hint().exact())
        .unwrap_or(0);

    let _connection = HttpConnection::open(Arc::clone(&network));
    network.track_request(&RequestEvent {
        path: request.uri().path().to_string(),
        method: request.method().to_string(),
        start,
        bytes_in,
    });

    let response = next.run(request).await;

    let bytes_out = content_length(response.headers())
        .or_else(|| response.body().size_hint().exact())
        .unwrap_or(0);
    network.track_response(&ResponseEvent {
        bytes_out,
        status_code: response.status().as_u16(),
        duration_ms: start.elapsed().as_secs_f64() * 1000.0,
    });

    response
}
