// Type-keyed step factory registry
//
// Factories build configured step instances at wiring time. Registering a
// step type that already exists replaces the prior factory (last writer
// wins), which lets deployments override a built-in.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::step::PipelineStep;
use crate::error::{CoreError, Result};
use crate::registry::ServiceRegistry;
use crate::value::DataMap;

/// Per-step settings block from the configuration file.
pub type StepConfig = DataMap;

/// Factory signature: (step name, settings, service registry) -> step.
pub type StepFactory =
    Arc<dyn Fn(&str, &StepConfig, &ServiceRegistry) -> Result<Arc<dyn PipelineStep>> + Send + Sync>;

#[derive(Default)]
pub struct StepRegistry {
    factories: RwLock<HashMap<String, StepFactory>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for a step type. Last writer wins.
    pub fn register(&self, step_type: &str, factory: StepFactory) {
        let mut factories = self.factories.write().expect("step registry poisoned");
        if factories.insert(step_type.to_string(), factory).is_some() {
            tracing::debug!(step_type = %step_type, "replaced step factory");
        }
    }

    /// Instantiate a step of the given type.
    pub fn create(
        &self,
        step_type: &str,
        name: &str,
        config: &StepConfig,
        services: &ServiceRegistry,
    ) -> Result<Arc<dyn PipelineStep>> {
        let factory = {
            let factories = self.factories.read().expect("step registry poisoned");
            factories.get(step_type).cloned()
        };
        let factory = factory
            .ok_or_else(|| CoreError::validation(format!("unknown step type '{}'", step_type)))?;
        factory(name, config, services)
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.factories
            .read()
            .expect("step registry poisoned")
            .contains_key(step_type)
    }
}
