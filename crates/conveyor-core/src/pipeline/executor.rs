// Ordered pipeline execution
//
// The executor runs steps in order, records each step's output under its
// name, terminates on the first failure and honours early stop. A single
// invocation is sequential; parallelism lives above, one task per trigger
// fire.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::context::PipelineContext;
use super::step::{PipelineStep, StepResult};
use crate::error::{CoreError, Result};

/// Named, ordered list of configured steps.
#[derive(Clone)]
pub struct Pipeline {
    pub name: String,
    pub steps: Vec<Arc<dyn PipelineStep>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, steps: Vec<Arc<dyn PipelineStep>>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }
}

pub struct PipelineExecutor;

impl PipelineExecutor {
    /// Run `steps` against `ctx`. The first failing step's error surfaces
    /// unchanged; a step returning `stop` ends the run successfully.
    pub async fn run(
        cancel: &CancellationToken,
        steps: &[Arc<dyn PipelineStep>],
        ctx: &mut PipelineContext,
    ) -> Result<()> {
        for step in steps {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let result = step.execute(cancel, ctx).await?;
            ctx.step_outputs
                .insert(step.name().to_string(), result.output);

            if result.stop {
                tracing::debug!(step = %step.name(), "pipeline stopped early");
                break;
            }
        }
        Ok(())
    }
}

/// Tracing decorator: preserves the wrapped step's contract bit-for-bit,
/// adds a `pipeline.step` span carrying the step name in its `step.name`
/// field and records failures.
///
/// `tracing` span names must be `&'static str`, so the step name cannot be
/// part of the span name itself; filter on the `step.name` field instead.
pub struct TracedStep {
    inner: Arc<dyn PipelineStep>,
}

impl TracedStep {
    pub fn new(inner: Arc<dyn PipelineStep>) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl PipelineStep for TracedStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &mut PipelineContext,
    ) -> Result<StepResult> {
        let span = tracing::info_span!("pipeline.step", step.name = %self.inner.name());
        let result = self.inner.execute(cancel, ctx).instrument(span).await;
        if let Err(e) = &result {
            tracing::error!(step = %self.inner.name(), error = %e, "pipeline step failed");
        }
        result
    }
}

/// Wrap every step of a pipeline in the tracing decorator. Opt-in at
/// trigger configuration.
pub fn wrap_traced(steps: Vec<Arc<dyn PipelineStep>>) -> Vec<Arc<dyn PipelineStep>> {
    steps
        .into_iter()
        .map(|s| Arc::new(TracedStep::new(s)) as Arc<dyn PipelineStep>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::DataMap;
    use serde_json::json;

    struct OneShot;

    #[async_trait::async_trait]
    impl PipelineStep for OneShot {
        fn name(&self) -> &str {
            "one-shot"
        }

        async fn execute(
            &self,
            _cancel: &CancellationToken,
            _ctx: &mut PipelineContext,
        ) -> Result<StepResult> {
            let mut output = DataMap::new();
            output.insert("k".into(), json!(1));
            Ok(StepResult::stop_with(output))
        }
    }

    #[tokio::test]
    async fn test_traced_wrapper_preserves_contract() {
        let steps = wrap_traced(vec![Arc::new(OneShot) as Arc<dyn PipelineStep>]);
        assert_eq!(steps[0].name(), "one-shot");

        let mut ctx = PipelineContext::default();
        let result = steps[0]
            .execute(&CancellationToken::new(), &mut ctx)
            .await
            .unwrap();
        assert!(result.stop);
        assert_eq!(result.output["k"], json!(1));
    }
}
