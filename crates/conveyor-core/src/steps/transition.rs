// Workflow transition step
//
// Lets a pipeline create or advance a state-machine instance. The engine
// is resolved from the service registry at wiring time, so a missing
// engine fails the deployment at startup rather than per request.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::machine::StateMachineEngine;
use crate::pipeline::{template, PipelineContext, PipelineStep, StepFactory, StepResult};
use crate::services;
use crate::value::{object_to_map, DataMap, DataMapExt};

struct WorkflowTransitionStep {
    name: String,
    engine: Arc<StateMachineEngine>,
    workflow: Option<String>,
    /// Transition to fire; empty means create
    action: String,
    instance_id: String,
    data: Option<serde_json::Value>,
}

#[async_trait]
impl PipelineStep for WorkflowTransitionStep {
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

        let instance_id = match template::render(ctx, &self.instance_id) {
            serde_json::Value::String(s) => s,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        if instance_id.is_empty() {
            return Err(CoreError::validation(format!(
                "step '{}': instance id '{}' resolved to nothing",
                self.name, self.instance_id
            )));
        }

        let payload: DataMap = match &self.data {
            Some(template_value) => object_to_map(&template::render_value(ctx, template_value)),
            None => ctx.trigger_data.clone(),
        };

        let instance = if self.action.is_empty() {
            let workflow = self.workflow.as_deref().ok_or_else(|| {
                CoreError::validation(format!(
                    "step '{}': creating an instance needs a workflow",
                    self.name
                ))
            })?;
            self.engine
                .create_workflow(workflow, &instance_id, payload)
                .await?
        } else {
            let action = match template::render(ctx, &self.action) {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            self.engine
                .trigger_transition(&instance_id, &action, payload)
                .await?
        };

        let mut output = DataMap::new();
        output.insert("instance_id".into(), json!(instance.id));
        output.insert("state".into(), json!(instance.current_state));
        if let Some(previous) = &instance.previous_state {
            output.insert("previous_state".into(), json!(previous));
        }
        Ok(StepResult::with_output(output))
    }
}

pub fn workflow_transition_factory() -> StepFactory {
    Arc::new(|name, config, registry| {
        let engine: Arc<StateMachineEngine> = registry
            .get(services::WORKFLOW_ENGINE)
            .map_err(|_| CoreError::dependency("workflow_transition needs the engine"))?;

        Ok(Arc::new(WorkflowTransitionStep {
            name: name.to_string(),
            engine,
            workflow: config.get_str("workflow").map(|s| s.to_string()),
            action: config.get_str("action").unwrap_or_default().to_string(),
            instance_id: config
                .get_str("instance_id")
                .unwrap_or("{{trigger.id}}")
                .to_string(),
            data: config.get("data").cloned(),
        }) as Arc<dyn PipelineStep>)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{Transition, WorkflowDefinition};
    use crate::pipeline::StepConfig;
    use crate::registry::ServiceRegistry;

    fn registry_with_engine() -> (ServiceRegistry, Arc<StateMachineEngine>) {
        let registry = ServiceRegistry::new();
        let engine = Arc::new(StateMachineEngine::new());
        engine
            .register_definition(WorkflowDefinition {
                name: "ticket".into(),
                initial_state: "new".into(),
                states: vec!["new".into(), "open".into()],
                transitions: vec![Transition {
                    name: "open".into(),
                    from_state: "new".into(),
                    to_state: "open".into(),
                    guard: None,
                    effect: None,
                }],
                final_states: vec![],
            })
            .unwrap();
        registry
            .register(services::WORKFLOW_ENGINE, engine.clone())
            .unwrap();
        (registry, engine)
    }

    #[tokio::test]
    async fn test_create_then_advance() {
        let (registry, engine) = registry_with_engine();

        let mut create_cfg = StepConfig::new();
        create_cfg.insert("workflow".into(), json!("ticket"));
        let create = workflow_transition_factory()("create", &create_cfg, &registry).unwrap();

        let mut ctx = PipelineContext::default();
        ctx.trigger_data.insert("id".into(), json!("t-1"));
        let result = create
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.output["state"], json!("new"));

        let mut advance_cfg = StepConfig::new();
        advance_cfg.insert("action".into(), json!("open"));
        let advance = workflow_transition_factory()("advance", &advance_cfg, &registry).unwrap();
        let result = advance
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap();
        assert_eq!(result.output["state"], json!("open"));

        let instance = engine.get_instance("t-1").await.unwrap();
        assert_eq!(instance.current_state, "open");
    }

    #[test]
    fn test_factory_without_engine_fails() {
        let registry = ServiceRegistry::new();
        let config = StepConfig::new();
        let err = match workflow_transition_factory()("s", &config, &registry) {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert!(matches!(err, CoreError::DependencyMissing(_)));
    }
}
