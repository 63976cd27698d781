// Message broker port
//
// Topic triggers subscribe through this trait and the publish step emits
// through it. The in-process implementation lives in conveyor-triggers;
// external brokers plug in behind the same seam.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::broadcast;

use crate::error::Result;

/// One message on a topic. Headers carry transport metadata, including the
/// W3C trace context of the producer.
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub headers: HashMap<String, String>,
    pub payload: Value,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            headers: HashMap::new(),
            payload,
        }
    }
}

/// Publish/subscribe port. Per-topic ordering is preserved as far as the
/// underlying implementation preserves it; subscribers on different topics
/// may be delivered concurrently.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn publish(&self, message: BrokerMessage) -> Result<()>;

    /// Subscribe to a topic. Each receiver observes messages published
    /// after the subscription was created.
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BrokerMessage>;
}

/// Registry holder for the broker trait object.
///
/// `ServiceRegistry` stores `Arc<T>` with a concrete `T`; this wrapper is
/// that concrete type for dynamic broker implementations.
pub struct BrokerHandle {
    inner: std::sync::Arc<dyn MessageBroker>,
}

impl BrokerHandle {
    pub fn new(inner: std::sync::Arc<dyn MessageBroker>) -> Self {
        Self { inner }
    }

    pub fn broker(&self) -> &std::sync::Arc<dyn MessageBroker> {
        &self.inner
    }
}
