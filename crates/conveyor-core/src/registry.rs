// Name-keyed service registry
//
// The registry is owned by the application host and handed to modules during
// init; it is never exposed as a process-wide singleton. Registration is
// append-only: a name can be bound exactly once. Late binding after start is
// permitted (the map is behind an RwLock), but modules that depend on a late
// service must declare it optional.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{CoreError, Result};

/// Typed, name-keyed mapping of live service instances.
#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service instance under a unique name.
    /// Fails with a conflict if the name is already bound.
    pub fn register<T: Send + Sync + 'static>(&self, name: &str, service: Arc<T>) -> Result<()> {
        let mut services = self.services.write().expect("service registry poisoned");
        if services.contains_key(name) {
            return Err(CoreError::conflict(format!(
                "service '{}' is already registered",
                name
            )));
        }
        tracing::debug!(service = %name, "registered service");
        services.insert(name.to_string(), service);
        Ok(())
    }

    /// Look up a service by name and downcast it to the expected type.
    pub fn get<T: Send + Sync + 'static>(&self, name: &str) -> Result<Arc<T>> {
        let services = self.services.read().expect("service registry poisoned");
        let entry = services
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found(format!("service '{}'", name)))?;
        entry.downcast::<T>().map_err(|_| {
            CoreError::validation(format!(
                "service '{}' has an unexpected type (wanted {})",
                name,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Snapshot of every registered (name, instance) pair.
    pub fn all(&self) -> Vec<(String, Arc<dyn Any + Send + Sync>)> {
        self.services
            .read()
            .expect("service registry poisoned")
            .iter()
            .map(|(name, service)| (name.clone(), service.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.services
            .read()
            .expect("service registry poisoned")
            .contains_key(name)
    }

    /// Names of all registered services, sorted for stable output.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .expect("service registry poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}
