// Module lifecycle host
//
// A module is a named unit with Init -> Start -> Stop lifecycle. Init runs
// in a dependency-respecting order and registers the services the module
// provides; Start runs after every Init succeeded; Stop runs in reverse
// start order. Init failures are fatal, Start failures roll back already
// started modules, Stop errors are logged and swallowed.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};
use crate::registry::ServiceRegistry;

/// A service a module publishes into the registry during init.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub name: String,
    pub description: String,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// A service a module needs before its init may run.
#[derive(Debug, Clone)]
pub struct ServiceDependency {
    pub name: String,
    pub required: bool,
}

impl ServiceDependency {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// Context handed to Start/Stop: the shared registry plus the host
/// cancellation token that drives graceful shutdown.
pub struct RunContext {
    services: Arc<ServiceRegistry>,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Child token for background work that should outlive a single request
    /// but still wind down on process shutdown.
    pub fn background(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

/// A pluggable unit of the runtime.
///
/// Implementations register the services they provide during `init` and may
/// subscribe to other modules' events during `start` (never during `init`,
/// which keeps the wiring acyclic).
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Services this module will register during init.
    fn provides(&self) -> Vec<ServiceDescriptor> {
        Vec::new()
    }

    /// Services that must (or may, when optional) exist before init runs.
    fn requires(&self) -> Vec<ServiceDependency> {
        Vec::new()
    }

    async fn init(&self, host: &AppHost) -> Result<()>;

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    async fn stop(&self, ctx: &RunContext) -> Result<()> {
        let _ = ctx;
        Ok(())
    }
}

/// Orders Init/Start/Stop across modules and owns the service registry.
pub struct AppHost {
    services: Arc<ServiceRegistry>,
    modules: Vec<Arc<dyn Module>>,
    /// Init order actually used, so Start and Stop respect dependencies.
    init_order: Mutex<Vec<Arc<dyn Module>>>,
    started: Mutex<Vec<Arc<dyn Module>>>,
    cancel: CancellationToken,
}

impl AppHost {
    pub fn new() -> Self {
        Self {
            services: Arc::new(ServiceRegistry::new()),
            modules: Vec::new(),
            init_order: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn add_module(&mut self, module: Arc<dyn Module>) {
        self.modules.push(module);
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn run_context(&self) -> RunContext {
        RunContext {
            services: self.services.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Initialise every module exactly once, in an order where each module's
    /// required services are registered before its init runs. Scheduling is
    /// by repeated passes; a pass that makes no progress means a missing
    /// provider or a dependency cycle, which aborts startup.
    pub async fn init(&self) -> Result<()> {
        let mut pending: Vec<Arc<dyn Module>> = self.modules.clone();
        let mut order = self.init_order.lock().await;

        while !pending.is_empty() {
            let mut progressed = false;
            let mut remaining = Vec::new();

            for module in pending {
                let satisfied = module
                    .requires()
                    .iter()
                    .filter(|dep| dep.required)
                    .all(|dep| self.services.contains(&dep.name));

                if satisfied {
                    tracing::info!(module = %module.name(), "initialising module");
                    module.init(self).await.map_err(|e| {
                        tracing::error!(module = %module.name(), error = %e, "module init failed");
                        e
                    })?;
                    order.push(module);
                    progressed = true;
                } else {
                    remaining.push(module);
                }
            }

            if !progressed {
                let blocked: Vec<String> = remaining
                    .iter()
                    .map(|m| {
                        let missing: Vec<String> = m
                            .requires()
                            .iter()
                            .filter(|d| d.required && !self.services.contains(&d.name))
                            .map(|d| d.name.clone())
                            .collect();
                        format!("{} (missing: {})", m.name(), missing.join(", "))
                    })
                    .collect();
                return Err(CoreError::dependency(format!(
                    "unresolvable module dependencies: {}",
                    blocked.join("; ")
                )));
            }
            pending = remaining;
        }

        Ok(())
    }

    /// Start every module in init order. On the first failure, modules that
    /// already started are stopped in reverse order and the failure surfaces.
    pub async fn start(&self) -> Result<()> {
        let ctx = self.run_context();
        let order = self.init_order.lock().await.clone();

        for module in order {
            tracing::info!(module = %module.name(), "starting module");
            if let Err(e) = module.start(&ctx).await {
                tracing::error!(module = %module.name(), error = %e, "module start failed");
                self.stop().await;
                return Err(e);
            }
            self.started.lock().await.push(module);
        }
        Ok(())
    }

    /// Stop started modules in reverse order. Stop errors are logged, never
    /// re-raised. The cancellation token fires first so background tasks
    /// (cron fires, async transitions) wind down alongside.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let ctx = self.run_context();
        let mut started = self.started.lock().await;

        while let Some(module) = started.pop() {
            tracing::info!(module = %module.name(), "stopping module");
            if let Err(e) = module.stop(&ctx).await {
                tracing::warn!(module = %module.name(), error = %e, "module stop failed");
            }
        }
    }
}

impl Default for AppHost {
    fn default() -> Self {
        Self::new()
    }
}
