// Response-writing steps
//
// These steps end the chain: they stage the response in pipeline metadata
// (the HTTP trigger commits it after the run) and stop the pipeline, which
// suppresses the trigger's 202 fallback.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::pipeline::{
    template, PipelineContext, PipelineStep, StepConfig, StepFactory, StepResult,
    META_RESPONSE_BODY, META_RESPONSE_HANDLED, META_RESPONSE_HEADERS, META_RESPONSE_STATUS,
};
use crate::value::{DataMap, DataMapExt};

/// Writes a JSON response with a configured status and templated body.
struct JsonResponseStep {
    name: String,
    status: u16,
    body: Value,
}

#[async_trait]
impl PipelineStep for JsonResponseStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        ctx: &mut PipelineContext,
    ) -> Result<StepResult> {
        let body = template::render_value(ctx, &self.body);

        ctx.set_metadata(META_RESPONSE_STATUS, json!(self.status));
        ctx.set_metadata(META_RESPONSE_BODY, body.clone());
        ctx.set_metadata(
            META_RESPONSE_HEADERS,
            json!({"content-type": "application/json"}),
        );
        ctx.set_metadata(META_RESPONSE_HANDLED, json!(true));

        let mut output = DataMap::new();
        output.insert("status".into(), json!(self.status));
        output.insert("body".into(), body);
        Ok(StepResult::stop_with(output))
    }
}

pub fn json_response_factory() -> StepFactory {
    Arc::new(|name, config, _services| {
        let status = config.get_i64("status").unwrap_or(200) as u16;
        let body = config.get("body").cloned().unwrap_or(Value::Null);
        Ok(Arc::new(JsonResponseStep {
            name: name.to_string(),
            status,
            body,
        }) as Arc<dyn PipelineStep>)
    })
}

/// Writes a raw text response with a configured content type.
struct RawResponseStep {
    name: String,
    status: u16,
    content_type: String,
    body: String,
}

#[async_trait]
impl PipelineStep for RawResponseStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        _cancel: &CancellationToken,
        ctx: &mut PipelineContext,
    ) -> Result<StepResult> {
        let body = match template::render(ctx, &self.body) {
            Value::String(s) => s,
            other => other.to_string(),
        };

        ctx.set_metadata(META_RESPONSE_STATUS, json!(self.status));
        ctx.set_metadata(META_RESPONSE_BODY, json!(body));
        ctx.set_metadata(
            META_RESPONSE_HEADERS,
            json!({"content-type": self.content_type}),
        );
        ctx.set_metadata(META_RESPONSE_HANDLED, json!(true));

        let mut output = DataMap::new();
        output.insert("status".into(), json!(self.status));
        Ok(StepResult::stop_with(output))
    }
}

pub fn raw_response_factory() -> StepFactory {
    Arc::new(|name, config, _services| {
        let status = config.get_i64("status").unwrap_or(200) as u16;
        let content_type = config
            .get_str("content_type")
            .unwrap_or("text/plain")
            .to_string();
        let body = config.get_str("body").unwrap_or_default().to_string();
        Ok(Arc::new(RawResponseStep {
            name: name.to_string(),
            status,
            content_type,
            body,
        }) as Arc<dyn PipelineStep>)
    })
}
