//! WebSocket adapter over the topic bus
//!
//! Every connected client is subscribed to `metrics_update` on connect and may
//! add or drop further topics. Bus envelopes are forwarded as
//! `{"type": <topic>, "data": <payload>}` frames.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use opspulse_kernel::bus::{Envelope, METRICS_UPDATE_TOPIC, TopicBus};
use opspulse_kernel::metrics::MetricsCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::aggregator::MetricsAggregator;
use crate::network::{ConnectionKind, NetworkTracker};

const CLIENT_BUFFER: usize = 100;

/// Messages accepted from clients
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Request a snapshot now, optionally a single category
    GetMetrics { category: Option<String> },
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Heartbeat,
}

#[derive(Debug, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Default, Deserialize)]
struct CategoryRequest {
    #[serde(default)]
    category: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TopicsRequest {
    #[serde(default)]
    topics: Vec<String>,
}

impl ClientMessage {
    /// Parse a text frame. `data` may be omitted for every message type.
    pub fn parse(text: &str) -> Result<Self, String> {
        let raw: RawClientMessage =
            serde_json::from_str(text).map_err(|e| format!("Malformed message: {}", e))?;
        let data = if raw.data.is_null() {
            Value::Object(Default::default())
        } else {
            raw.data
        };

        match raw.kind.as_str() {
            "get_metrics" => {
                let request: CategoryRequest = serde_json::from_value(data)
                    .map_err(|e| format!("Invalid get_metrics payload: {}", e))?;
                Ok(ClientMessage::GetMetrics {
                    category: request.category,
                })
            }
            "subscribe" | "unsubscribe" => {
                let request: TopicsRequest = serde_json::from_value(data)
                    .map_err(|e| format!("Invalid {} payload: {}", raw.kind, e))?;
                if raw.kind == "subscribe" {
                    Ok(ClientMessage::Subscribe {
                        topics: request.topics,
                    })
                } else {
                    Ok(ClientMessage::Unsubscribe {
                        topics: request.topics,
                    })
                }
            }
            "heartbeat" => Ok(ClientMessage::Heartbeat),
            other => Err(format!("Unknown message type: {}", other)),
        }
    }
}

/// Replies sent to a single client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "metrics_response")]
    MetricsResponse(Value),

    #[serde(rename = "metrics_error")]
    MetricsError {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        category: Option<String>,
    },

    #[serde(rename = "subscribed")]
    Subscribed { topics: Vec<String> },

    #[serde(rename = "unsubscribed")]
    Unsubscribed { topics: Vec<String> },

    #[serde(rename = "heartbeat")]
    Heartbeat { timestamp: DateTime<Utc> },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    fn to_frame(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                error!("Failed to serialize WebSocket message: {}", e);
                None
            }
        }
    }
}

/// Frame for a bus envelope: the topic becomes the message type.
pub fn envelope_frame(envelope: &Envelope) -> Option<String> {
    let frame = serde_json::json!({
        "type": envelope.topic,
        "data": envelope.payload,
    });
    serde_json::to_string(&frame).ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub topics: Vec<String>,
}

/// Owns the client registry and routes client requests
pub struct WebSocketHub {
    aggregator: Arc<MetricsAggregator>,
    bus: TopicBus,
    network: Arc<NetworkTracker>,
    clients: RwLock<HashMap<String, ClientInfo>>,
}

impl WebSocketHub {
    pub fn new(
        aggregator: Arc<MetricsAggregator>,
        bus: TopicBus,
        network: Arc<NetworkTracker>,
    ) -> Self {
        Self {
            aggregator,
            bus,
            network,
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn clients(&self) -> Vec<ClientInfo> {
        self.clients.read().await.values().cloned().collect()
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let client_id = uuid::Uuid::now_v7().to_string();
        let (tx, mut rx) = mpsc::channel::<String>(CLIENT_BUFFER);

        self.network.track_connection(ConnectionKind::WebSocket, true);
        self.clients.write().await.insert(
            client_id.clone(),
            ClientInfo {
                id: client_id.clone(),
                connected_at: Utc::now(),
                topics: Vec::new(),
            },
        );
        info!("WebSocket client connected: {}", client_id);

        let (mut sender, mut receiver) = socket.split();

        let mut send_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if sender.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });

        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
        self.subscribe_topics(
            &client_id,
            &[METRICS_UPDATE_TOPIC.to_string()],
            &mut forwarders,
            &tx,
        )
        .await;

        loop {
            tokio::select! {
                incoming = receiver.next() => {
                    let msg = match incoming {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            debug!("WebSocket receive error for {}: {}", client_id, e);
                            break;
                        }
                        None => break,
                    };
                    match msg {
                        Message::Text(text) => {
                            self.handle_text(&client_id, text.as_str(), &mut forwarders, &tx)
                                .await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                _ = &mut send_task => break,
            }
        }

        for (_, handle) in forwarders.drain() {
            handle.abort();
        }
        drop(tx);
        send_task.abort();

        self.clients.write().await.remove(&client_id);
        self.network.track_connection(ConnectionKind::WebSocket, false);
        info!("WebSocket client disconnected: {}", client_id);
    }

    async fn handle_text(
        &self,
        client_id: &str,
        text: &str,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
        tx: &mpsc::Sender<String>,
    ) {
        let reply = match ClientMessage::parse(text) {
            Ok(ClientMessage::GetMetrics { category }) => self.get_metrics(category).await,
            Ok(ClientMessage::Subscribe { topics }) => {
                let added = self
                    .subscribe_topics(client_id, &topics, forwarders, tx)
                    .await;
                ServerMessage::Subscribed { topics: added }
            }
            Ok(ClientMessage::Unsubscribe { topics }) => {
                for topic in &topics {
                    if let Some(handle) = forwarders.remove(topic) {
                        handle.abort();
                    }
                }
                self.sync_topics(client_id, forwarders).await;
                ServerMessage::Unsubscribed { topics }
            }
            Ok(ClientMessage::Heartbeat) => ServerMessage::Heartbeat {
                timestamp: Utc::now(),
            },
            Err(message) => {
                warn!("Rejected message from {}: {}", client_id, message);
                ServerMessage::Error { message }
            }
        };

        if let Some(frame) = reply.to_frame() {
            let _ = tx.send(frame).await;
        }
    }

    async fn get_metrics(&self, category: Option<String>) -> ServerMessage {
        let Some(name) = category else {
            let snapshot = self.aggregator.collect_metrics().await;
            return match serde_json::to_value(snapshot.as_ref()) {
                Ok(data) => ServerMessage::MetricsResponse(data),
                Err(e) => ServerMessage::MetricsError {
                    error: e.to_string(),
                    category: None,
                },
            };
        };

        let result = match name.parse::<MetricsCategory>() {
            Ok(category) => self.aggregator.query(category).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        let value = result.and_then(|section| {
            serde_json::to_value(&section).map_err(|e| e.to_string())
        });

        match value {
            Ok(data) => ServerMessage::MetricsResponse(data),
            Err(error) => ServerMessage::MetricsError {
                error,
                category: Some(name),
            },
        }
    }

    async fn subscribe_topics(
        &self,
        client_id: &str,
        topics: &[String],
        forwarders: &mut HashMap<String, JoinHandle<()>>,
        tx: &mpsc::Sender<String>,
    ) -> Vec<String> {
        let mut added = Vec::new();
        for topic in topics {
            if forwarders.contains_key(topic) {
                added.push(topic.clone());
                continue;
            }
            match self.bus.subscribe(topic).await {
                Ok(rx) => {
                    forwarders.insert(topic.clone(), spawn_forwarder(rx, tx.clone()));
                    added.push(topic.clone());
                }
                Err(e) => warn!("Client {} cannot subscribe to {:?}: {}", client_id, topic, e),
            }
        }
        self.sync_topics(client_id, forwarders).await;
        added
    }

    async fn sync_topics(&self, client_id: &str, forwarders: &HashMap<String, JoinHandle<()>>) {
        if let Some(info) = self.clients.write().await.get_mut(client_id) {
            let mut topics: Vec<String> = forwarders.keys().cloned().collect();
            topics.sort();
            info.topics = topics;
        }
    }
}

fn spawn_forwarder(
    mut rx: broadcast::Receiver<Arc<Envelope>>,
    tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let Some(frame) = envelope_frame(&envelope) else {
                        continue;
                    };
                    if tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("WebSocket client lagged, skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Upgrade handler for `/ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<WebSocketHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| hub.handle_socket(socket))
}
