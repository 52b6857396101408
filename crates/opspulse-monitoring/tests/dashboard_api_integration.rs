use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use opspulse_kernel::pricing::PricingTable;
use opspulse_monitoring::{DashboardConfig, DashboardServer, MonitoringConfig, MonitoringStack};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;

fn server(log_dir: Option<&std::path::Path>) -> DashboardServer {
    let config = MonitoringConfig {
        enable_system: false,
        ..MonitoringConfig::default()
    };
    let mut stack = MonitoringStack::new(config, PricingTable::default()).expect("stack");
    if let Some(dir) = log_dir {
        stack = stack.with_log_dir(dir);
    }
    DashboardServer::new(DashboardConfig::new().with_cors(false), Arc::new(stack))
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request success");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    (status, serde_json::from_slice(&body).expect("json body"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn metrics_route_returns_enabled_sections() {
    let app = server(None).build_router();

    let (status, body) = call(&app, get("/api/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["data"]["network"].is_object());
    assert!(body["data"]["llm"].is_object());
    assert!(body["data"].get("system").is_none());
    assert_eq!(body["data"]["failed_sections"], json!([]));
}

#[tokio::test]
async fn category_route_validates_input() {
    let app = server(None).build_router();

    let (status, body) = call(&app, get("/api/metrics/cpu")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("cpu"));

    let (status, body) = call(&app, get("/api/metrics/system")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);

    let (status, body) = call(&app, get("/api/metrics/network")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["category"], "network");
}

#[tokio::test]
async fn requests_are_instrumented() {
    let app = server(None).build_router();

    call(&app, get("/api/health")).await;
    call(&app, get("/api/metrics/cpu")).await;
    let (_, body) = call(&app, get("/api/metrics/network")).await;

    let detail = &body["data"]["data"]["detail"];
    assert_eq!(detail["requests"]["total"], 3);
    assert_eq!(detail["errors"]["count"], 1);
    assert_eq!(detail["errors"]["by_family"]["400"], 1);
    assert_eq!(body["data"]["data"]["by_method"]["GET"], 3);
}

#[tokio::test]
async fn llm_requests_are_priced_and_reported() {
    let app = server(None).build_router();

    let record = json!({
        "model": "gpt-4",
        "input_tokens": 1000,
        "output_tokens": 500,
        "start": "2024-05-01T10:00:00Z",
        "end": "2024-05-01T10:00:02Z"
    });
    let (status, body) = call(&app, with_json("POST", "/api/llm/requests", record)).await;
    assert_eq!(status, StatusCode::OK);
    let cost = body["data"]["cost"].as_f64().unwrap();
    assert!((cost - 0.06).abs() < 1e-9);

    let (_, body) = call(&app, get("/api/metrics/llm")).await;
    assert_eq!(body["data"]["data"]["request_count"], 1);
    assert_eq!(body["data"]["data"]["total_tokens"], 1500);

    let (status, _) = call(&app, with_json("POST", "/api/llm/reset", json!(null))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&app, get("/api/metrics/llm")).await;
    assert_eq!(body["data"]["data"]["request_count"], 0);
}

#[tokio::test]
async fn pricing_is_replaced_wholesale() {
    let app = server(None).build_router();

    let bad = json!({
        "default_model": "local",
        "models": { "local": { "input": -1.0, "output": 0.0 } }
    });
    let (status, body) = call(&app, with_json("PUT", "/api/llm/pricing", bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, _) = call(&app, with_json("PUT", "/api/llm/pricing", json!("nope"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let good = json!({
        "default_model": "local",
        "models": { "local": { "input": 0.001, "output": 0.002 } }
    });
    let (status, _) = call(&app, with_json("PUT", "/api/llm/pricing", good)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = call(&app, get("/api/llm/pricing")).await;
    assert_eq!(body["data"]["default_model"], "local");
    assert!(body["data"]["models"].get("gpt-4").is_none());
}

#[tokio::test]
async fn logs_are_browsable() {
    let dir = tempfile::tempdir().unwrap();
    let lines = [
        r#"{"timestamp":"2024-05-01T10:00:00Z","level":"info","service":"api","message":"GET /users","metadata":{"duration":20}}"#,
        r#"{"timestamp":"2024-05-01T10:01:00Z","level":"error","service":"api","message":"POST /orders failed","metadata":{"duration":40}}"#,
    ];
    std::fs::write(dir.path().join("combined.log"), lines.join("\n")).unwrap();
    let app = server(Some(dir.path())).build_router();

    let (status, body) = call(&app, get("/api/logs")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!(["combined"]));

    let (status, body) = call(&app, get("/api/logs/combined?level=error")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);
    assert_eq!(body["data"]["logs"][0]["message"], "POST /orders failed");

    let (status, body) = call(&app, get("/api/logs/..%2Fetc")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn logs_without_directory_are_not_found() {
    let app = server(None).build_router();
    let (status, _) = call(&app, get("/api/logs/combined")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_overview_respond() {
    let app = server(None).build_router();

    let (status, body) = call(&app, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["aggregator"], "stopped");

    let (status, body) = call(&app, get("/api/overview")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["api_health"], "OK");
    assert_eq!(body["data"]["llm_requests"], 0);
}

#[tokio::test]
async fn history_starts_empty() {
    let app = server(None).build_router();
    let (status, body) = call(&app, get("/api/metrics/history?limit=10")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}
