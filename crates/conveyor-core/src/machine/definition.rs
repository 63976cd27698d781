// Workflow definitions and transition guards
//
// Definitions are immutable after registration. Guards are declarative
// condition trees evaluated against the instance data merged with the
// transition payload (payload keys win).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::value::{truthy, DataMap, DataMapExt};

/// Declarative transition guard.
///
/// Composite guards (`and`, `or`, `not`) nest arbitrarily; leaf guards test
/// a single field of the merged data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Guard {
    FieldExists { field: String },
    FieldEquals { field: String, value: Value },
    FieldTruthy { field: String },
    Not { guard: Box<Guard> },
    And { guards: Vec<Guard> },
    Or { guards: Vec<Guard> },
}

impl Guard {
    pub fn field_exists(field: impl Into<String>) -> Self {
        Guard::FieldExists {
            field: field.into(),
        }
    }

    pub fn field_equals(field: impl Into<String>, value: Value) -> Self {
        Guard::FieldEquals {
            field: field.into(),
            value,
        }
    }

    pub fn field_truthy(field: impl Into<String>) -> Self {
        Guard::FieldTruthy {
            field: field.into(),
        }
    }

    pub fn evaluate(&self, data: &DataMap) -> bool {
        match self {
            Guard::FieldExists { field } => data.lookup_path(field).is_some(),
            Guard::FieldEquals { field, value } => {
                data.lookup_path(field).map(|v| v == value).unwrap_or(false)
            }
            Guard::FieldTruthy { field } => {
                data.lookup_path(field).map(truthy).unwrap_or(false)
            }
            Guard::Not { guard } => !guard.evaluate(data),
            Guard::And { guards } => guards.iter().all(|g| g.evaluate(data)),
            Guard::Or { guards } => guards.iter().any(|g| g.evaluate(data)),
        }
    }
}

/// A named, guarded edge between two states.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    pub name: String,
    #[serde(alias = "from")]
    pub from_state: String,
    #[serde(alias = "to")]
    pub to_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    /// Optional effect hook: name of a pipeline dispatched after the
    /// transition commits (wired through a state-change listener).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
}

/// Immutable description of a state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub initial_state: String,
    pub states: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<Transition>,
    /// States that mark the instance completed on entry.
    #[serde(default)]
    pub final_states: Vec<String>,
}

impl WorkflowDefinition {
    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    pub fn transition(&self, name: &str) -> Option<&Transition> {
        self.transitions.iter().find(|t| t.name == name)
    }

    pub fn is_final(&self, state: &str) -> bool {
        self.final_states.iter().any(|s| s == state)
    }

    /// Structural validation at registration time: the initial state and
    /// every transition endpoint must be members of the state set.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CoreError::validation("workflow definition needs a name"));
        }
        if !self.has_state(&self.initial_state) {
            return Err(CoreError::validation(format!(
                "workflow '{}': initial state '{}' is not in the state set",
                self.name, self.initial_state
            )));
        }
        for transition in &self.transitions {
            if !self.has_state(&transition.from_state) {
                return Err(CoreError::validation(format!(
                    "workflow '{}': transition '{}' references unknown from-state '{}'",
                    self.name, transition.name, transition.from_state
                )));
            }
            if !self.has_state(&transition.to_state) {
                return Err(CoreError::validation(format!(
                    "workflow '{}': transition '{}' references unknown to-state '{}'",
                    self.name, transition.name, transition.to_state
                )));
            }
        }
        for state in &self.final_states {
            if !self.has_state(state) {
                return Err(CoreError::validation(format!(
                    "workflow '{}': final state '{}' is not in the state set",
                    self.name, state
                )));
            }
        }
        Ok(())
    }
}
