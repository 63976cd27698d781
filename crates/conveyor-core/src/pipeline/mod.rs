// Pipeline executor and step registry

mod context;
mod executor;
mod registry;
mod step;
pub mod template;

pub use context::{
    PipelineContext, META_HTTP_REQUEST, META_RAW_BODY, META_RESPONSE_BODY, META_RESPONSE_HANDLED,
    META_RESPONSE_HEADERS, META_RESPONSE_STATUS, META_TRACEPARENT,
};
pub use executor::{wrap_traced, Pipeline, PipelineExecutor};
pub use registry::{StepConfig, StepFactory, StepRegistry};
pub use step::{PipelineStep, StepResult};
