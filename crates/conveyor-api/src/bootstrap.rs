// Host assembly from configuration
//
// The built-in modules (server, storage, engine, dispatcher) are always
// constructed; the `modules` block adds named extras (currently the
// in-process broker) through the factory table; trigger and resource
// blocks become one module each. Init ordering is resolved by the host
// from the declared service dependencies, not by list position.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use conveyor_core::config::{AppConfig, ModuleConfig, PersistenceConfig, PipelineConfig};
use conveyor_core::machine::{
    InstanceStore, StateChange, StateChangeListener, StateMachineEngine, WorkflowDefinition,
};
use conveyor_core::pipeline::wrap_traced;
use conveyor_core::steps::register_builtin_steps;
use conveyor_core::{
    services, AppHost, CoreError, Module, Pipeline, PipelineContext, Result, RunContext,
    ServiceDependency, ServiceDescriptor, StepRegistry, TriggerConfig, WorkflowDispatcher,
};
use conveyor_storage::{FieldEncryptor, SqliteInstanceStore, Store};
use conveyor_triggers::http::HttpRouteConfig;
use conveyor_triggers::topic::TopicSubscription;
use conveyor_triggers::{BrokerModule, CronTriggerModule, HttpTriggerModule, TopicTriggerModule};

use crate::resource::ResourceHandlerModule;
use crate::server::HttpServerModule;

/// Build a host with every module the configuration names.
pub fn build_host(config: AppConfig) -> anyhow::Result<AppHost> {
    let mut host = AppHost::new();

    host.add_module(Arc::new(HttpServerModule::new(
        config.server.addr.clone(),
        config.auth.as_ref().map(|a| a.jwt_secret.as_str()),
    )));
    host.add_module(Arc::new(StorageModule::new(config.persistence.clone())));
    host.add_module(Arc::new(EngineModule::new(config.workflows.clone())));

    for module_cfg in &config.modules {
        host.add_module(module_from_config(module_cfg)?);
    }

    host.add_module(Arc::new(DispatcherModule::new(config.pipelines.clone())));

    let mut http_routes = Vec::new();
    let mut topic_subscriptions = Vec::new();
    for trigger in &config.triggers {
        match trigger {
            TriggerConfig::Http {
                name,
                method,
                path,
                include_headers,
                target,
                traced,
            } => http_routes.push(HttpRouteConfig {
                name: name.clone(),
                method: method.clone(),
                path: path.clone(),
                include_headers: *include_headers,
                target: target.clone(),
                traced: *traced,
            }),
            TriggerConfig::Topic {
                name,
                topics,
                event,
                target,
                traced,
            } => topic_subscriptions.push(TopicSubscription {
                name: name.clone(),
                topics: topics.clone(),
                event: event.clone(),
                target: target.clone(),
                traced: *traced,
            }),
            TriggerConfig::Cron { name, jobs } => {
                host.add_module(Arc::new(CronTriggerModule::new(name.clone(), jobs.clone())));
            }
        }
    }
    if !http_routes.is_empty() {
        host.add_module(Arc::new(HttpTriggerModule::new("http-triggers", http_routes)));
    }
    if !topic_subscriptions.is_empty() {
        host.add_module(Arc::new(TopicTriggerModule::new(
            "topic-triggers",
            topic_subscriptions,
        )));
    }

    for resource in &config.resources {
        host.add_module(Arc::new(ResourceHandlerModule::new(resource.clone())));
    }

    Ok(host)
}

fn module_from_config(cfg: &ModuleConfig) -> anyhow::Result<Arc<dyn Module>> {
    match cfg.module_type.as_str() {
        "broker" => Ok(Arc::new(BrokerModule::new(cfg.name.clone()))),
        other => anyhow::bail!("unknown module type '{}'", other),
    }
}

// ============================================
// Storage module
// ============================================

struct StorageModule {
    cfg: PersistenceConfig,
}

impl StorageModule {
    fn new(cfg: PersistenceConfig) -> Self {
        Self { cfg }
    }

    fn encryptor(&self) -> Result<FieldEncryptor> {
        match &self.cfg.encryption_key {
            // A leading '$' means the env reference did not expand;
            // treat it as unset rather than keying off a literal.
            Some(key) if !key.is_empty() && !key.starts_with('$') => {
                FieldEncryptor::new(key, &self.cfg.previous_keys, self.cfg.pii_fields.clone())
                    .map_err(CoreError::Internal)
            }
            _ => {
                if !self.cfg.pii_fields.is_empty() {
                    tracing::warn!(
                        "PII fields configured without an encryption key; storing verbatim"
                    );
                }
                Ok(FieldEncryptor::disabled())
            }
        }
    }
}

#[async_trait::async_trait]
impl Module for StorageModule {
    fn name(&self) -> &str {
        "storage"
    }

    fn provides(&self) -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::new(services::STORE, "sqlite write-through store"),
            ServiceDescriptor::new(services::INSTANCE_STORE, "workflow instance persistence"),
        ]
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        let encryptor = self.encryptor()?;
        if encryptor.enabled() {
            tracing::info!("PII field encryption enabled");
        }
        let store = Arc::new(
            Store::open(&self.cfg.url, encryptor)
                .await
                .map_err(CoreError::Internal)?,
        );
        host.services().register(services::STORE, store.clone())?;
        host.services().register(
            services::INSTANCE_STORE,
            Arc::new(SqliteInstanceStore::new(store)),
        )
    }
}

// ============================================
// Engine module
// ============================================

struct EngineModule {
    definitions: Vec<WorkflowDefinition>,
}

impl EngineModule {
    fn new(definitions: Vec<WorkflowDefinition>) -> Self {
        Self { definitions }
    }
}

#[async_trait::async_trait]
impl Module for EngineModule {
    fn name(&self) -> &str {
        "workflow-engine"
    }

    fn provides(&self) -> Vec<ServiceDescriptor> {
        vec![ServiceDescriptor::new(
            services::WORKFLOW_ENGINE,
            "state-machine engine",
        )]
    }

    fn requires(&self) -> Vec<ServiceDependency> {
        vec![ServiceDependency::required(services::INSTANCE_STORE)]
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        let instance_store: Arc<SqliteInstanceStore> =
            host.services().get(services::INSTANCE_STORE)?;

        let engine = Arc::new(StateMachineEngine::new());
        engine.attach_store(instance_store as Arc<dyn InstanceStore>);
        for definition in &self.definitions {
            engine.register_definition(definition.clone())?;
        }
        host.services().register(services::WORKFLOW_ENGINE, engine)
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let engine: Arc<StateMachineEngine> = ctx.services().get(services::WORKFLOW_ENGINE)?;
        engine.rehydrate().await?;
        Ok(())
    }
}

// ============================================
// Dispatcher module (pipelines + step registry + transition effects)
// ============================================

struct DispatcherModule {
    pipelines: Vec<PipelineConfig>,
}

impl DispatcherModule {
    fn new(pipelines: Vec<PipelineConfig>) -> Self {
        Self { pipelines }
    }
}

#[async_trait::async_trait]
impl Module for DispatcherModule {
    fn name(&self) -> &str {
        "dispatcher"
    }

    fn provides(&self) -> Vec<ServiceDescriptor> {
        vec![
            ServiceDescriptor::new(services::WORKFLOW_DISPATCHER, "uniform trigger dispatch"),
            ServiceDescriptor::new(services::STEP_REGISTRY, "pipeline step factories"),
        ]
    }

    fn requires(&self) -> Vec<ServiceDependency> {
        vec![
            ServiceDependency::required(services::WORKFLOW_ENGINE),
            // Only pipelines using the publish step need a broker
            ServiceDependency::optional(services::MESSAGE_BROKER),
        ]
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        let engine: Arc<StateMachineEngine> = host.services().get(services::WORKFLOW_ENGINE)?;

        let step_registry = Arc::new(StepRegistry::new());
        register_builtin_steps(&step_registry);
        host.services()
            .register(services::STEP_REGISTRY, step_registry.clone())?;

        let dispatcher = Arc::new(WorkflowDispatcher::new(engine));
        for pipeline_cfg in &self.pipelines {
            let mut steps = Vec::new();
            for spec in &pipeline_cfg.steps {
                steps.push(step_registry.create(
                    &spec.step_type,
                    &spec.name,
                    &spec.config,
                    host.services(),
                )?);
            }
            let steps = if pipeline_cfg.traced {
                wrap_traced(steps)
            } else {
                steps
            };
            tracing::info!(pipeline = %pipeline_cfg.name, steps = steps.len(), "registered pipeline");
            dispatcher.register_pipeline(Pipeline::new(pipeline_cfg.name.clone(), steps));
        }
        host.services()
            .register(services::WORKFLOW_DISPATCHER, dispatcher)
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let dispatcher: Arc<WorkflowDispatcher> =
            ctx.services().get(services::WORKFLOW_DISPATCHER)?;
        let engine = dispatcher.engine().clone();

        engine.add_listener(Arc::new(EffectListener {
            dispatcher,
            cancel: ctx.background(),
        }));
        Ok(())
    }
}

/// Runs the pipeline a transition names as its effect hook, on a
/// background task so listener latency never holds the engine.
struct EffectListener {
    dispatcher: Arc<WorkflowDispatcher>,
    cancel: CancellationToken,
}

#[async_trait::async_trait]
impl StateChangeListener for EffectListener {
    async fn on_state_change(&self, change: &StateChange) -> Result<()> {
        let definition = match self
            .dispatcher
            .engine()
            .definition(&change.instance.workflow_type)
        {
            Some(definition) => definition,
            None => return Ok(()),
        };
        let Some(effect) = definition
            .transition(&change.transition)
            .and_then(|t| t.effect.clone())
        else {
            return Ok(());
        };

        let mut data = change.instance.data.clone();
        data.insert("id".into(), serde_json::json!(change.instance.id));
        data.insert("state".into(), serde_json::json!(change.to_state));
        data.insert("transition".into(), serde_json::json!(change.transition));

        let dispatcher = self.dispatcher.clone();
        let cancel = self.cancel.clone();
        let instance_id = change.instance.id.clone();
        tokio::spawn(async move {
            let mut ctx = PipelineContext::new(data);
            if let Err(e) = dispatcher.run_pipeline(&cancel, &effect, &mut ctx, false).await {
                tracing::error!(instance = %instance_id, pipeline = %effect, error = %e, "transition effect failed");
            }
        });
        Ok(())
    }
}
