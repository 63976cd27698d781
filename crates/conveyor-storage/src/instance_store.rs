// Write-through adapter for the engine's InstanceStore port

use async_trait::async_trait;
use std::sync::Arc;

use conveyor_core::machine::{InstanceStore, WorkflowInstance};
use conveyor_core::{CoreError, Result};

use crate::store::Store;

/// Database-backed instance store.
///
/// The engine writes every transition through this adapter; storage errors
/// surface as persist failures so the engine rolls the transition back.
#[derive(Clone)]
pub struct SqliteInstanceStore {
    store: Arc<Store>,
}

impl SqliteInstanceStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn save(&self, instance: &WorkflowInstance) -> Result<()> {
        self.store
            .save_workflow_instance(instance)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))
    }

    async fn load(&self, id: &str) -> Result<Option<WorkflowInstance>> {
        self.store
            .load_workflow_instance(id)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))
    }

    async fn load_by_type(&self, workflow_type: &str) -> Result<Vec<WorkflowInstance>> {
        self.store
            .load_workflow_instances(workflow_type)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))
    }

    async fn load_all(&self) -> Result<Vec<WorkflowInstance>> {
        self.store
            .load_all_workflow_instances()
            .await
            .map_err(|e| CoreError::persist(e.to_string()))
    }
}
