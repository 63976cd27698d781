// State-machine engine
//
// Instances are held behind a global map lock plus a per-instance mutex:
// transitions on one instance serialise, transitions on different instances
// run independently. Persistence is write-through: the store is written
// while the instance lock is held and the in-memory commit happens only
// after the write succeeds, so a persist failure leaves the instance in its
// pre-transition state. Listeners run after commit; their failures are
// logged and never roll back the transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

use super::definition::WorkflowDefinition;
use crate::error::{CoreError, Result};
use crate::value::{DataMap, DataMapExt};

/// A live embodiment of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_type: String,
    pub current_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    #[serde(default)]
    pub data: DataMap,
    pub start_time: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Write-through port for instance persistence; implemented by the storage
/// crate, absent in pure in-memory tests.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()>;
    async fn load(&self, id: &str) -> Result<Option<WorkflowInstance>>;
    async fn load_by_type(&self, workflow_type: &str) -> Result<Vec<WorkflowInstance>>;
    async fn load_all(&self) -> Result<Vec<WorkflowInstance>>;
}

/// Notification emitted after a transition has been persisted and committed.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub instance: WorkflowInstance,
    pub transition: String,
    pub from_state: String,
    pub to_state: String,
}

#[async_trait]
pub trait StateChangeListener: Send + Sync {
    async fn on_state_change(&self, change: &StateChange) -> Result<()>;
}

pub struct StateMachineEngine {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    instances: tokio::sync::RwLock<HashMap<String, Arc<Mutex<WorkflowInstance>>>>,
    listeners: RwLock<Vec<Arc<dyn StateChangeListener>>>,
    store: RwLock<Option<Arc<dyn InstanceStore>>>,
}

impl StateMachineEngine {
    pub fn new() -> Self {
        Self {
            definitions: RwLock::new(HashMap::new()),
            instances: tokio::sync::RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            store: RwLock::new(None),
        }
    }

    /// Attach the write-through store. Called once by the engine module
    /// during init, after the storage module registered it.
    pub fn attach_store(&self, store: Arc<dyn InstanceStore>) {
        *self.store.write().expect("engine store lock poisoned") = Some(store);
    }

    fn store(&self) -> Option<Arc<dyn InstanceStore>> {
        self.store.read().expect("engine store lock poisoned").clone()
    }

    /// Pure listener registration; handlers subscribe during their module
    /// start, which keeps engine/handler wiring acyclic.
    pub fn add_listener(&self, listener: Arc<dyn StateChangeListener>) {
        self.listeners
            .write()
            .expect("engine listeners poisoned")
            .push(listener);
    }

    pub fn register_definition(&self, definition: WorkflowDefinition) -> Result<()> {
        definition.validate()?;
        let mut definitions = self.definitions.write().expect("engine definitions poisoned");
        if definitions.contains_key(&definition.name) {
            return Err(CoreError::conflict(format!(
                "workflow definition '{}' is already registered",
                definition.name
            )));
        }
        tracing::info!(workflow = %definition.name, states = definition.states.len(), "registered workflow definition");
        definitions.insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.definitions
            .read()
            .expect("engine definitions poisoned")
            .get(name)
            .cloned()
    }

    /// Create a new instance in the definition's initial state.
    pub async fn create_workflow(
        &self,
        workflow_type: &str,
        instance_id: &str,
        seed_data: DataMap,
    ) -> Result<WorkflowInstance> {
        let definition = self
            .definition(workflow_type)
            .ok_or_else(|| CoreError::not_found(format!("workflow definition '{}'", workflow_type)))?;

        let mut instances = self.instances.write().await;
        if instances.contains_key(instance_id) {
            return Err(CoreError::conflict(format!(
                "workflow instance '{}' already exists",
                instance_id
            )));
        }

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: instance_id.to_string(),
            workflow_type: workflow_type.to_string(),
            current_state: definition.initial_state.clone(),
            previous_state: None,
            data: seed_data,
            start_time: now,
            last_updated: now,
            completed: definition.is_final(&definition.initial_state),
            error: None,
        };

        if let Some(store) = self.store() {
            store
                .save(&instance)
                .await
                .map_err(|e| CoreError::persist(e.to_string()))?;
        }

        tracing::info!(instance = %instance_id, workflow = %workflow_type, state = %instance.current_state, "created workflow instance");
        instances.insert(instance_id.to_string(), Arc::new(Mutex::new(instance.clone())));
        Ok(instance)
    }

    /// Snapshot of an instance by id.
    pub async fn get_instance(&self, id: &str) -> Result<WorkflowInstance> {
        let handle = {
            let instances = self.instances.read().await;
            instances
                .get(id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("workflow instance '{}'", id)))?
        };
        let instance = handle.lock().await;
        Ok(instance.clone())
    }

    /// Reload instances from the store into memory, e.g. after restart.
    pub async fn rehydrate(&self) -> Result<usize> {
        let Some(store) = self.store() else {
            return Ok(0);
        };
        let persisted = store.load_all().await?;
        let mut instances = self.instances.write().await;
        let mut loaded = 0;
        for instance in persisted {
            if !instances.contains_key(&instance.id) {
                instances.insert(instance.id.clone(), Arc::new(Mutex::new(instance)));
                loaded += 1;
            }
        }
        if loaded > 0 {
            tracing::info!(count = loaded, "rehydrated workflow instances");
        }
        Ok(loaded)
    }

    /// Atomically advance an instance along a named transition.
    ///
    /// Returns the post-transition snapshot so callers never need to re-read
    /// state from persistence.
    pub async fn trigger_transition(
        &self,
        instance_id: &str,
        transition_name: &str,
        payload: DataMap,
    ) -> Result<WorkflowInstance> {
        let handle = {
            let instances = self.instances.read().await;
            instances
                .get(instance_id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("workflow instance '{}'", instance_id)))?
        };

        // Per-instance serialisation point
        let mut instance = handle.lock().await;

        let definition = self.definition(&instance.workflow_type).ok_or_else(|| {
            CoreError::not_found(format!("workflow definition '{}'", instance.workflow_type))
        })?;
        let transition = definition.transition(transition_name).ok_or_else(|| {
            CoreError::not_found(format!(
                "transition '{}' on workflow '{}'",
                transition_name, instance.workflow_type
            ))
        })?;

        if instance.current_state != transition.from_state {
            return Err(CoreError::illegal_transition(format!(
                "instance '{}' is in state '{}', transition '{}' requires '{}'",
                instance_id, instance.current_state, transition_name, transition.from_state
            )));
        }

        let mut merged = instance.data.clone();
        merged.merge_from(&payload);

        if let Some(guard) = &transition.guard {
            if !guard.evaluate(&merged) {
                return Err(CoreError::guard_denied(format!(
                    "transition '{}' on instance '{}'",
                    transition_name, instance_id
                )));
            }
        }

        let mut updated = instance.clone();
        updated.data = merged;
        updated.previous_state = Some(instance.current_state.clone());
        updated.current_state = transition.to_state.clone();
        updated.last_updated = Utc::now();
        updated.completed = definition.is_final(&transition.to_state);

        // Write-through before the in-memory commit: a persist failure
        // leaves the instance untouched.
        if let Some(store) = self.store() {
            store
                .save(&updated)
                .await
                .map_err(|e| CoreError::persist(e.to_string()))?;
        }

        *instance = updated.clone();
        drop(instance);

        tracing::info!(
            instance = %instance_id,
            transition = %transition_name,
            from = %transition.from_state,
            to = %transition.to_state,
            "workflow transition"
        );

        let change = StateChange {
            instance: updated.clone(),
            transition: transition_name.to_string(),
            from_state: transition.from_state.clone(),
            to_state: transition.to_state.clone(),
        };
        self.notify(&change).await;

        Ok(updated)
    }

    async fn notify(&self, change: &StateChange) {
        let listeners: Vec<Arc<dyn StateChangeListener>> = self
            .listeners
            .read()
            .expect("engine listeners poisoned")
            .clone();
        for listener in listeners {
            if let Err(e) = listener.on_state_change(change).await {
                tracing::warn!(
                    instance = %change.instance.id,
                    transition = %change.transition,
                    error = %e,
                    "state-change listener failed"
                );
            }
        }
    }
}

impl Default for StateMachineEngine {
    fn default() -> Self {
        Self::new()
    }
}
