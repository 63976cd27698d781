// Uniform trigger dispatch
//
// Every trigger resolves to the same contract: a workflow type, an action
// and a data map, dispatched either into the state-machine engine (create
// or advance an instance) or into a named pipeline. The outcome carries
// the post-run context or the post-transition instance snapshot so callers
// never re-read state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::TargetConfig;
use crate::error::{CoreError, Result};
use crate::machine::{StateMachineEngine, WorkflowInstance};
use crate::pipeline::{wrap_traced, Pipeline, PipelineContext, PipelineExecutor};
use crate::value::{DataMap, DataMapExt};

/// Result of one dispatch: a pipeline context, an instance snapshot, or
/// both (pipeline steps may themselves advance instances).
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    pub context: Option<PipelineContext>,
    pub instance: Option<WorkflowInstance>,
}

pub struct WorkflowDispatcher {
    engine: Arc<StateMachineEngine>,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
}

impl WorkflowDispatcher {
    pub fn new(engine: Arc<StateMachineEngine>) -> Self {
        Self {
            engine,
            pipelines: RwLock::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<StateMachineEngine> {
        &self.engine
    }

    pub fn register_pipeline(&self, pipeline: Pipeline) {
        self.pipelines
            .write()
            .expect("dispatcher pipelines poisoned")
            .insert(pipeline.name.clone(), Arc::new(pipeline));
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines
            .read()
            .expect("dispatcher pipelines poisoned")
            .get(name)
            .cloned()
    }

    /// Run a named pipeline against a prepared context. Trigger code uses
    /// this directly when it needs to seed metadata (HTTP primitives)
    /// before execution.
    pub async fn run_pipeline(
        &self,
        cancel: &CancellationToken,
        name: &str,
        ctx: &mut PipelineContext,
        traced: bool,
    ) -> Result<()> {
        let pipeline = self
            .pipeline(name)
            .ok_or_else(|| CoreError::not_found(format!("pipeline '{}'", name)))?;
        if traced {
            let steps = wrap_traced(pipeline.steps.clone());
            PipelineExecutor::run(cancel, &steps, ctx).await
        } else {
            PipelineExecutor::run(cancel, &pipeline.steps, ctx).await
        }
    }

    /// The uniform trigger contract.
    ///
    /// State-machine target: an empty action creates an instance (id from
    /// `data.id` or a fresh UUID); a non-empty action advances the instance
    /// named by `data.id`. Pipeline target: `workflow_type` names the
    /// pipeline and `data` becomes the trigger payload.
    pub async fn trigger_workflow(
        &self,
        cancel: &CancellationToken,
        target: &TargetConfig,
        data: DataMap,
    ) -> Result<DispatchOutcome> {
        match target {
            TargetConfig::StateMachine { workflow, action } => {
                if action.is_empty() {
                    let id = data
                        .get_str("id")
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
                    let instance = self.engine.create_workflow(workflow, &id, data).await?;
                    Ok(DispatchOutcome {
                        context: None,
                        instance: Some(instance),
                    })
                } else {
                    let id = data.get_str("id").ok_or_else(|| {
                        CoreError::validation("state-machine dispatch needs data.id")
                    })?;
                    let id = id.to_string();
                    let instance = self.engine.trigger_transition(&id, action, data).await?;
                    Ok(DispatchOutcome {
                        context: None,
                        instance: Some(instance),
                    })
                }
            }
            TargetConfig::Pipeline { pipeline } => {
                let mut ctx = PipelineContext::new(data);
                self.run_pipeline(cancel, pipeline, &mut ctx, false).await?;
                Ok(DispatchOutcome {
                    context: Some(ctx),
                    instance: None,
                })
            }
        }
    }
}
