// In-process message broker
//
// Broadcast-channel fan-out per topic. Per-topic ordering follows channel
// order; delivery across topics is concurrent. External brokers implement
// the same MessageBroker port and replace this module in configuration.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;

use conveyor_core::{
    services, AppHost, BrokerHandle, BrokerMessage, MessageBroker, Module, Result,
    ServiceDescriptor,
};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Default)]
pub struct InProcessBroker {
    topics: RwLock<HashMap<String, broadcast::Sender<BrokerMessage>>>,
}

impl InProcessBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BrokerMessage> {
        if let Some(sender) = self.topics.read().expect("broker topics poisoned").get(topic) {
            return sender.clone();
        }
        let mut topics = self.topics.write().expect("broker topics poisoned");
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl MessageBroker for InProcessBroker {
    async fn publish(&self, message: BrokerMessage) -> Result<()> {
        let sender = self.sender(&message.topic);
        // No subscribers yet is not an error
        let delivered = sender.send(message).unwrap_or(0);
        tracing::debug!(subscribers = delivered, "published message");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BrokerMessage> {
        self.sender(topic).subscribe()
    }
}

/// Module wrapper publishing the broker into the service registry.
pub struct BrokerModule {
    name: String,
    broker: Arc<InProcessBroker>,
}

impl BrokerModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            broker: Arc::new(InProcessBroker::new()),
        }
    }

    pub fn broker(&self) -> Arc<InProcessBroker> {
        self.broker.clone()
    }
}

#[async_trait]
impl Module for BrokerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> Vec<ServiceDescriptor> {
        vec![ServiceDescriptor::new(
            services::MESSAGE_BROKER,
            "in-process pub/sub broker",
        )]
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        host.services().register(
            services::MESSAGE_BROKER,
            Arc::new(BrokerHandle::new(self.broker.clone())),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_subscribe_round_trip() {
        let broker = InProcessBroker::new();
        let mut rx = broker.subscribe("alerts");

        broker
            .publish(BrokerMessage::new("alerts", json!({"type": "fire"})))
            .await
            .unwrap();

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "alerts");
        assert_eq!(message.payload["type"], json!("fire"));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let broker = InProcessBroker::new();
        let mut alerts = broker.subscribe("alerts");
        let _other = broker.subscribe("other");

        broker
            .publish(BrokerMessage::new("other", json!(1)))
            .await
            .unwrap();
        broker
            .publish(BrokerMessage::new("alerts", json!(2)))
            .await
            .unwrap();

        let message = alerts.recv().await.unwrap();
        assert_eq!(message.payload, json!(2));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let broker = InProcessBroker::new();
        broker
            .publish(BrokerMessage::new("void", json!(null)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_per_topic_ordering() {
        let broker = InProcessBroker::new();
        let mut rx = broker.subscribe("seq");

        for i in 0..5 {
            broker
                .publish(BrokerMessage::new("seq", json!(i)))
                .await
                .unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.recv().await.unwrap().payload, json!(i));
        }
    }
}
