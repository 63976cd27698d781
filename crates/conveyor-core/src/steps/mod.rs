// Built-in pipeline steps
//
// Everything here is a factory registered by step type; deployments can
// replace any of them by re-registering the type (last writer wins).

mod http_response;
mod publish;
mod transition;
mod webhook_verify;

pub use http_response::{json_response_factory, raw_response_factory};
pub use publish::publish_factory;
pub use transition::workflow_transition_factory;
pub use webhook_verify::webhook_verify_factory;

use crate::pipeline::StepRegistry;

/// Register the built-in step types.
pub fn register_builtin_steps(registry: &StepRegistry) {
    registry.register("json_response", json_response_factory());
    registry.register("raw_response", raw_response_factory());
    registry.register("webhook_verify", webhook_verify_factory());
    registry.register("workflow_transition", workflow_transition_factory());
    registry.register("publish", publish_factory());
}
