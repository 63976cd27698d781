// Well-known service names
//
// Modules publish and look up services by these names so that wiring in the
// configuration file stays stable across crates.

/// The state-machine engine ([`crate::StateMachineEngine`])
pub const WORKFLOW_ENGINE: &str = "workflow.engine";

/// The uniform trigger dispatcher ([`crate::WorkflowDispatcher`])
pub const WORKFLOW_DISPATCHER: &str = "workflow.dispatcher";

/// The step factory registry ([`crate::StepRegistry`])
pub const STEP_REGISTRY: &str = "pipeline.steps";

/// The message broker port ([`crate::MessageBroker`] trait object holder)
pub const MESSAGE_BROKER: &str = "message.broker";

/// The persistence store (conveyor-storage `Store`)
pub const STORE: &str = "storage.store";

/// The workflow-instance write-through port ([`crate::InstanceStore`] holder)
pub const INSTANCE_STORE: &str = "storage.instances";

/// Route collector the HTTP server drains at start (conveyor-triggers)
pub const ROUTE_COLLECTOR: &str = "http.routes";
