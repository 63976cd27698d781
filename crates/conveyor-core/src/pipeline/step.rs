// Pipeline step contract

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::context::PipelineContext;
use crate::error::Result;
use crate::value::DataMap;

/// Outcome of one step execution. `stop` ends the pipeline successfully;
/// remaining steps are skipped. `output` is recorded under the step's name.
#[derive(Debug, Default, Clone)]
pub struct StepResult {
    pub output: DataMap,
    pub stop: bool,
}

impl StepResult {
    /// Continue with no output.
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_output(output: DataMap) -> Self {
        Self {
            output,
            stop: false,
        }
    }

    pub fn stop_with(output: DataMap) -> Self {
        Self { output, stop: true }
    }
}

/// One unit of pipeline work.
///
/// Steps may read and write `ctx.current`, read prior outputs from
/// `ctx.step_outputs` and consult `ctx.metadata` for the HTTP/raw
/// primitives. Implementations must honour the cancellation token: on
/// cancellation, return [`crate::CoreError::Cancelled`] without further I/O.
#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(
        &self,
        cancel: &CancellationToken,
        ctx: &mut PipelineContext,
    ) -> Result<StepResult>;
}
