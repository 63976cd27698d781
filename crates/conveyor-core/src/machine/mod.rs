// State-machine engine: immutable definitions, live instances, guarded
// transitions with write-through persistence and change listeners.

mod definition;
mod engine;

pub use definition::{Guard, Transition, WorkflowDefinition};
pub use engine::{
    InstanceStore, StateChange, StateChangeListener, StateMachineEngine, WorkflowInstance,
};
