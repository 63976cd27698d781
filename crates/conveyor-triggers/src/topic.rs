// Topic trigger
//
// Subscribes to broker topics during start (one task per topic) and
// dispatches each message through the uniform contract. An `event` filter
// drops non-matching messages silently. Message handling runs on the
// module token: it is decoupled from any request scope and winds down on
// process shutdown.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use conveyor_core::pipeline::META_TRACEPARENT;
use conveyor_core::{
    propagation, services, AppHost, BrokerHandle, BrokerMessage, DataMap, DataMapExt, Module,
    PipelineContext, Result, RunContext, ServiceDependency, TargetConfig, WorkflowDispatcher,
};

/// One configured subscription.
#[derive(Debug, Clone)]
pub struct TopicSubscription {
    pub name: String,
    pub topics: Vec<String>,
    /// Only handle messages whose `type` field equals this value
    pub event: Option<String>,
    pub target: TargetConfig,
    pub traced: bool,
}

pub struct TopicTriggerModule {
    name: String,
    subscriptions: Vec<TopicSubscription>,
}

impl TopicTriggerModule {
    pub fn new(name: impl Into<String>, subscriptions: Vec<TopicSubscription>) -> Self {
        Self {
            name: name.into(),
            subscriptions,
        }
    }
}

#[async_trait]
impl Module for TopicTriggerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires(&self) -> Vec<ServiceDependency> {
        vec![
            ServiceDependency::required(services::MESSAGE_BROKER),
            ServiceDependency::required(services::WORKFLOW_DISPATCHER),
        ]
    }

    async fn init(&self, _host: &AppHost) -> Result<()> {
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let broker: Arc<BrokerHandle> = ctx.services().get(services::MESSAGE_BROKER)?;
        let dispatcher: Arc<WorkflowDispatcher> =
            ctx.services().get(services::WORKFLOW_DISPATCHER)?;

        for subscription in &self.subscriptions {
            for topic in &subscription.topics {
                let mut receiver = broker.broker().subscribe(topic);
                let subscription = subscription.clone();
                let dispatcher = dispatcher.clone();
                let cancel = ctx.background();
                let topic = topic.clone();

                tokio::spawn(async move {
                    tracing::info!(trigger = %subscription.name, topic = %topic, "topic subscription active");
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            received = receiver.recv() => match received {
                                Ok(message) => {
                                    handle_message(&dispatcher, &subscription, message, &cancel).await;
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                                    tracing::warn!(trigger = %subscription.name, topic = %topic, skipped, "subscriber lagged, messages dropped");
                                }
                                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                            },
                        }
                    }
                    tracing::debug!(trigger = %subscription.name, topic = %topic, "topic subscription closed");
                });
            }
        }
        Ok(())
    }
}

async fn handle_message(
    dispatcher: &WorkflowDispatcher,
    subscription: &TopicSubscription,
    message: BrokerMessage,
    cancel: &CancellationToken,
) {
    let trigger_data = payload_to_data(&message.payload);

    // Event filter: silent drop on mismatch
    if let Some(event) = &subscription.event {
        if trigger_data.get_str("type") != Some(event.as_str()) {
            tracing::debug!(trigger = %subscription.name, topic = %message.topic, "message filtered");
            return;
        }
    }

    let trace = propagation::extract(&message.headers);
    let trace_id = trace
        .as_ref()
        .map(|t| t.trace_id.clone())
        .unwrap_or_default();
    let span = tracing::info_span!(
        "topic.trigger",
        trigger = %subscription.name,
        topic = %message.topic,
        trace_id = %trace_id,
    );

    let result = match &subscription.target {
        TargetConfig::Pipeline { pipeline } => {
            let mut ctx = PipelineContext::new(trigger_data);
            if let Some(trace) = &trace {
                ctx.set_metadata(META_TRACEPARENT, json!(trace.to_header_value()));
            }
            dispatcher
                .run_pipeline(cancel, pipeline, &mut ctx, subscription.traced)
                .instrument(span)
                .await
        }
        target @ TargetConfig::StateMachine { .. } => dispatcher
            .trigger_workflow(cancel, target, trigger_data)
            .instrument(span)
            .await
            .map(|_| ()),
    };

    // Ack-or-retry is the broker's contract; the in-process broker has no
    // redelivery, so failures are logged and dropped.
    if let Err(e) = result {
        tracing::error!(trigger = %subscription.name, topic = %message.topic, error = %e, "message dispatch failed");
    }
}

fn payload_to_data(payload: &Value) -> DataMap {
    match payload.as_object() {
        Some(fields) => fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => {
            let mut data = DataMap::new();
            data.insert("payload".into(), payload.clone());
            data
        }
    }
}
