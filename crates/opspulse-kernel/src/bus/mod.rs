//! Topic bus
//!
//! Named topics backed by tokio broadcast channels. Producers publish JSON
//! payloads; consumers either hold a receiver or register a [`TopicHandler`]
//! that is driven on its own task. Publishing to a topic nobody listens on
//! is not an error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

mod envelope;
mod error;

pub use envelope::Envelope;
pub use error::{BusError, BusResult};

/// Topic carrying a full metrics snapshot on every aggregation tick.
pub const METRICS_UPDATE_TOPIC: &str = "metrics_update";

const DEFAULT_CAPACITY: usize = 100;

/// Anything that can publish a JSON payload to a topic.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Returns the number of subscribers the message was delivered to.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> BusResult<usize>;
}

/// Callback invoked for every message on a topic.
#[async_trait]
pub trait TopicHandler: Send + Sync + 'static {
    async fn handle(&self, envelope: Arc<Envelope>);
}

type TopicChannels = Arc<RwLock<HashMap<String, broadcast::Sender<Arc<Envelope>>>>>;

#[derive(Clone)]
pub struct TopicBus {
    channels: TopicChannels,
    capacity: usize,
}

impl Default for TopicBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is the per-topic buffer; slower receivers lag past it.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Arc::new(RwLock::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    async fn sender(&self, topic: &str) -> BusResult<broadcast::Sender<Arc<Envelope>>> {
        if topic.trim().is_empty() {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }

        if let Some(sender) = self.channels.read().await.get(topic) {
            return Ok(sender.clone());
        }

        let mut channels = self.channels.write().await;
        let sender = channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(sender.clone())
    }

    pub async fn subscribe(&self, topic: &str) -> BusResult<broadcast::Receiver<Arc<Envelope>>> {
        Ok(self.sender(topic).await?.subscribe())
    }

    /// Drive `handler` with every message published on `topic` until the bus
    /// is dropped or the returned task is aborted.
    pub async fn register_handler(
        &self,
        topic: &str,
        handler: Arc<dyn TopicHandler>,
    ) -> BusResult<JoinHandle<()>> {
        let mut rx = self.subscribe(topic).await?;
        let topic = topic.to_string();

        Ok(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => handler.handle(envelope).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %topic, skipped, "Topic handler lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(topic = %topic, "Topic handler stopped");
        }))
    }

    pub async fn subscriber_count(&self, topic: &str) -> usize {
        self.channels
            .read()
            .await
            .get(topic)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// Serialize `payload` and publish it.
    pub async fn publish_serialized<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        payload: &T,
    ) -> BusResult<usize> {
        let value = serde_json::to_value(payload)?;
        self.publish(topic, value).await
    }
}

#[async_trait]
impl Publisher for TopicBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> BusResult<usize> {
        let sender = self.sender(topic).await?;
        if sender.receiver_count() == 0 {
            debug!(topic, "No subscribers, dropping message");
            return Ok(0);
        }

        // A send error only means every receiver went away in the meantime.
        Ok(sender
            .send(Arc::new(Envelope::new(topic, payload)))
            .unwrap_or(0))
    }
}
