// Conveyor core: module container, state-machine engine, pipeline executor.
//
// The crate is organised around three seams:
// - `Module` + `ServiceRegistry`: lifecycle and wiring of pluggable units
// - `StateMachineEngine` + `InstanceStore`: guarded transitions, write-through
// - `PipelineStep` + `PipelineExecutor`: ordered step execution with early stop
//
// Concrete backends (SQLite store, message broker, HTTP server) live in the
// sibling crates and plug in through the traits defined here.

pub mod broker;
pub mod claims;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod machine;
pub mod module;
pub mod pipeline;
pub mod propagation;
pub mod registry;
pub mod services;
pub mod steps;
pub mod value;

// Re-export main types
pub use broker::{BrokerHandle, BrokerMessage, MessageBroker};
pub use claims::AuthClaims;
pub use config::{AppConfig, PipelineConfig, StepSpec, TargetConfig, TriggerConfig};
pub use dispatch::{DispatchOutcome, WorkflowDispatcher};
pub use error::{CoreError, Result};
pub use machine::{
    Guard, InstanceStore, StateChange, StateChangeListener, StateMachineEngine, Transition,
    WorkflowDefinition, WorkflowInstance,
};
pub use module::{AppHost, Module, RunContext, ServiceDependency, ServiceDescriptor};
pub use pipeline::{
    Pipeline, PipelineContext, PipelineExecutor, PipelineStep, StepConfig, StepRegistry,
    StepResult,
};
pub use registry::ServiceRegistry;
pub use value::{DataMap, DataMapExt};
