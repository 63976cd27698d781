// Topic publish step
//
// Emits a message onto the broker from inside a pipeline. The current
// trace context travels in the message headers so downstream topic
// triggers join the same trace.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broker::{BrokerHandle, BrokerMessage};
use crate::error::{CoreError, Result};
use crate::pipeline::{
    template, PipelineContext, PipelineStep, StepFactory, StepResult, META_TRACEPARENT,
};
use crate::propagation::{self, TraceContext};
use crate::value::{map_to_object, DataMap, DataMapExt};

struct PublishStep {
    name: String,
    broker: Arc<BrokerHandle>,
    topic: String,
    payload: Option<serde_json::Value>,
}

#[async_trait]
impl PipelineStep for PublishStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &mut PipelineContext,
    ) -> Result<StepResult> {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }

        let topic = match template::render(ctx, &self.topic) {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        let payload = match &self.payload {
            Some(template_value) => template::render_value(ctx, template_value),
            None => map_to_object(&ctx.trigger_data),
        };

        let mut message = BrokerMessage::new(topic.clone(), payload);
        if let Some(trace) = ctx
            .metadata
            .get_str(META_TRACEPARENT)
            .and_then(TraceContext::parse)
        {
            propagation::inject(&trace.child(), &mut message.headers);
        }

        self.broker.broker().publish(message).await?;

        let mut output = DataMap::new();
        output.insert("topic".into(), json!(topic));
        output.insert("published".into(), json!(true));
        Ok(StepResult::with_output(output))
    }
}

pub fn publish_factory() -> StepFactory {
    Arc::new(|name, config, registry| {
        let broker: Arc<BrokerHandle> = registry
            .get(crate::services::MESSAGE_BROKER)
            .map_err(|_| CoreError::dependency("publish needs the message broker"))?;
        let topic = config
            .get_str("topic")
            .ok_or_else(|| CoreError::validation("publish needs a topic"))?
            .to_string();

        Ok(Arc::new(PublishStep {
            name: name.to_string(),
            broker,
            topic,
            payload: config.get("payload").cloned(),
        }) as Arc<dyn PipelineStep>)
    })
}
