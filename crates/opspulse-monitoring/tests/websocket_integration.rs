use futures_util::{SinkExt, StreamExt};
use opspulse_kernel::pricing::PricingTable;
use opspulse_monitoring::{DashboardConfig, DashboardServer, MonitoringConfig, MonitoringStack};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn spawn_server() -> (Arc<MonitoringStack>, String) {
    let config = MonitoringConfig {
        enable_system: false,
        ..MonitoringConfig::default()
    };
    let stack = Arc::new(MonitoringStack::new(config, PricingTable::default()).expect("stack"));
    let router = DashboardServer::new(DashboardConfig::new(), stack.clone()).build_router();

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });

    (stack, format!("ws://{}/ws", addr))
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string()))
        .await
        .expect("send");
}

/// Next text frame of the given type, skipping anything else.
async fn next_of_type(client: &mut Client, kind: &str) -> Value {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let frame = client.next().await.expect("stream open").expect("frame");
            if let Message::Text(text) = frame {
                let value: Value = serde_json::from_str(&text).expect("json frame");
                if value["type"] == kind {
                    return value;
                }
            }
        }
    })
    .await
    .expect("frame before timeout")
}

#[tokio::test]
async fn get_metrics_round_trip() {
    let (stack, url) = spawn_server().await;
    let (mut client, _) = connect_async(url.as_str()).await.expect("connect");

    send(&mut client, json!({"type": "get_metrics", "data": {"category": "network"}})).await;
    let reply = next_of_type(&mut client, "metrics_response").await;
    assert_eq!(reply["data"]["category"], "network");
    assert_eq!(stack.network.metrics().detail.connections.websocket, 1);

    send(&mut client, json!({"type": "get_metrics"})).await;
    let reply = next_of_type(&mut client, "metrics_response").await;
    assert!(reply["data"]["llm"].is_object());

    send(&mut client, json!({"type": "get_metrics", "data": {"category": "gpu"}})).await;
    let reply = next_of_type(&mut client, "metrics_error").await;
    assert_eq!(reply["data"]["category"], "gpu");

    send(&mut client, json!({"type": "heartbeat"})).await;
    next_of_type(&mut client, "heartbeat").await;
}

#[tokio::test]
async fn aggregator_ticks_are_pushed_to_clients() {
    let (stack, url) = spawn_server().await;
    let (mut client, _) = connect_async(url.as_str()).await.expect("connect");

    // The default subscription is in place once the first reply arrives.
    send(&mut client, json!({"type": "heartbeat"})).await;
    next_of_type(&mut client, "heartbeat").await;

    stack.aggregator.tick().await.expect("tick ran");
    let update = next_of_type(&mut client, "metrics_update").await;
    assert!(update["data"]["network"].is_object());
    assert_eq!(update["data"]["failed_sections"], json!([]));
}

#[tokio::test]
async fn custom_topics_can_be_subscribed() {
    let (stack, url) = spawn_server().await;
    let (mut client, _) = connect_async(url.as_str()).await.expect("connect");

    send(&mut client, json!({"type": "subscribe", "data": {"topics": ["alerts"]}})).await;
    let ack = next_of_type(&mut client, "subscribed").await;
    assert_eq!(ack["data"]["topics"], json!(["alerts"]));

    stack
        .bus
        .publish_serialized("alerts", &json!({"level": "warn"}))
        .await
        .expect("publish");
    let alert = next_of_type(&mut client, "alerts").await;
    assert_eq!(alert["data"]["level"], "warn");

    send(&mut client, json!({"type": "launch"})).await;
    let error = next_of_type(&mut client, "error").await;
    assert!(error["data"]["message"].as_str().unwrap().contains("launch"));
}

#[tokio::test]
async fn disconnect_releases_connection_gauge() {
    let (stack, url) = spawn_server().await;
    let (mut client, _) = connect_async(url.as_str()).await.expect("connect");

    send(&mut client, json!({"type": "heartbeat"})).await;
    next_of_type(&mut client, "heartbeat").await;
    client.close(None).await.expect("close");
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), async {
        while stack.network.metrics().detail.connections.websocket != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("gauge released");
}
