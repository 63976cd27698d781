// Resource handler
//
// One handler instance per configured resource type: a small REST surface
// over an in-memory map with write-through persistence, optional binding
// to a workflow definition (instance created on POST, sub-actions routed
// to transitions, state synced back through the engine's listener seam)
// and claim-based filtering on list operations.
//
// Locking: reads share the handler RwLock, writes are exclusive, and the
// in-memory commit always happens inside the write lock. Store writes run
// after the lock is released; a failed persist compensates the in-memory
// change before surfacing PersistFailure.

use async_trait::async_trait;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use conveyor_core::config::ResourceHandlerConfig;
use conveyor_core::machine::{StateChange, StateChangeListener, StateMachineEngine};
use conveyor_core::{
    services, AppHost, AuthClaims, CoreError, DataMap, DataMapExt, Module, Result, RunContext,
    ServiceDependency,
};
use conveyor_storage::Store;
use conveyor_triggers::RouteCollector;

use super::field_map::FieldMap;
use crate::error::ApiError;

const BODY_LIMIT: usize = 1024 * 1024;

/// A record owned by this handler.
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: String,
    pub data: DataMap,
    pub last_update: DateTime<Utc>,
}

pub struct ResourceHandler {
    cfg: ResourceHandlerConfig,
    field_map: FieldMap,
    store: Arc<Store>,
    engine: Option<Arc<StateMachineEngine>>,
    resources: RwLock<HashMap<String, Resource>>,
    cancel: CancellationToken,
}

impl ResourceHandler {
    pub fn new(
        cfg: ResourceHandlerConfig,
        store: Arc<Store>,
        engine: Option<Arc<StateMachineEngine>>,
    ) -> Self {
        let field_map = FieldMap::with_defaults(cfg.field_map.clone());
        Self {
            cfg,
            field_map,
            store,
            engine,
            resources: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn resource_type(&self) -> &str {
        &self.cfg.resource
    }

    pub fn config(&self) -> &ResourceHandlerConfig {
        &self.cfg
    }

    fn is_view(&self) -> bool {
        self.cfg.source_resource.is_some()
    }

    /// Populate the in-memory map from persistence (called at init).
    pub async fn load_from_store(&self) -> Result<usize> {
        if self.is_view() {
            return Ok(0);
        }
        let persisted = self
            .store
            .load_resources(&self.cfg.resource)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))?;

        let mut resources = self.resources.write().await;
        let count = persisted.len();
        for (id, data) in persisted {
            let last_update = self
                .field_map
                .read(&data, "lastUpdate")
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);
            resources.insert(
                id.clone(),
                Resource {
                    id,
                    data,
                    last_update,
                },
            );
        }
        if count > 0 {
            tracing::info!(resource = %self.cfg.resource, count, "loaded resources");
        }
        Ok(count)
    }

    async fn persist(&self, resource: &Resource) -> Result<()> {
        let mut data = resource.data.clone();
        self.field_map.write(
            &mut data,
            "lastUpdate",
            json!(resource
                .last_update
                .to_rfc3339_opts(SecondsFormat::Nanos, true)),
        );
        self.store
            .save_resource(&self.cfg.resource, &resource.id, &data)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))
    }

    fn dto(&self, resource: &Resource) -> Value {
        json!({
            "id": resource.id,
            "state": self.field_map.read(&resource.data, "state").cloned().unwrap_or(Value::Null),
            "lastUpdate": resource.last_update.to_rfc3339_opts(SecondsFormat::Nanos, true),
            "data": conveyor_core::value::map_to_object(&resource.data),
        })
    }

    // ============================================
    // List
    // ============================================

    pub async fn list(&self, claims: &AuthClaims) -> Result<Value> {
        if self.is_view() {
            return self.view_list(claims).await;
        }

        let resources = self.resources.read().await;
        let mut items: Vec<&Resource> = resources
            .values()
            .filter(|r| claims.permits(&r.data))
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(Value::Array(items.into_iter().map(|r| self.dto(r)).collect()))
    }

    /// View handlers re-read the source type from persistence on every
    /// call and answer with a `{total, count, items}` envelope.
    async fn view_list(&self, claims: &AuthClaims) -> Result<Value> {
        let source = self.cfg.source_resource.as_deref().unwrap_or_default();
        let persisted = self
            .store
            .load_resources(source)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))?;

        let mut matching: Vec<(String, DataMap)> = persisted
            .into_iter()
            .filter(|(_, data)| {
                if self.cfg.state_filter.is_empty() {
                    return true;
                }
                self.field_map
                    .read(data, "state")
                    .and_then(Value::as_str)
                    .map(|state| self.cfg.state_filter.iter().any(|s| s == state))
                    .unwrap_or(false)
            })
            .collect();
        matching.sort_by(|a, b| a.0.cmp(&b.0));

        let total = matching.len();
        let items: Vec<Value> = matching
            .into_iter()
            .filter(|(_, data)| claims.permits(data))
            .map(|(id, data)| {
                json!({
                    "id": id,
                    "state": self.field_map.read(&data, "state").cloned().unwrap_or(Value::Null),
                    "lastUpdate": self.field_map.read(&data, "lastUpdate").cloned().unwrap_or(Value::Null),
                    "data": conveyor_core::value::map_to_object(&data),
                })
            })
            .collect();

        Ok(json!({
            "total": total,
            "count": items.len(),
            "items": items,
        }))
    }

    // ============================================
    // Read one
    // ============================================

    pub async fn get(&self, id: &str) -> Result<Value> {
        let mut resource = {
            let resources = self.resources.read().await;
            resources
                .get(id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("resource '{}'", id)))?
        };

        // Enrich from the live instance; the handler stays authoritative
        // for keys it already holds.
        if let (Some(engine), Some(_)) = (&self.engine, &self.cfg.workflow) {
            if let Ok(instance) = engine.get_instance(id).await {
                self.field_map
                    .write(&mut resource.data, "state", json!(instance.current_state));
                resource.last_update = instance.last_updated;
                for (key, value) in &instance.data {
                    if !resource.data.contains_key(key) {
                        resource.data.insert(key.clone(), value.clone());
                    }
                }
            }
        }

        Ok(self.dto(&resource))
    }

    // ============================================
    // Create (with follow-up correlation)
    // ============================================

    pub async fn create(&self, body: DataMap) -> Result<(u16, Value)> {
        // Follow-up: a body referencing an existing resource by the
        // correlation key appends to it instead of creating a duplicate.
        if let Some(correlation_key) = &self.cfg.correlation_field {
            if let Some(correlation_value) = body.get(correlation_key) {
                let existing_id = {
                    let resources = self.resources.read().await;
                    resources
                        .values()
                        .find(|r| r.data.get(correlation_key) == Some(correlation_value))
                        .map(|r| r.id.clone())
                };
                if let Some(id) = existing_id {
                    return self.append_follow_up(&id, &body).await;
                }
            }
        }

        let id = self
            .field_map
            .read(&body, "id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());

        let mut data = body;
        self.field_map.write(&mut data, "id", json!(id));

        if let (Some(engine), Some(workflow)) = (&self.engine, &self.cfg.workflow) {
            let definition = engine.definition(workflow).ok_or_else(|| {
                CoreError::dependency(format!("workflow definition '{}'", workflow))
            })?;
            self.field_map
                .write(&mut data, "state", json!(definition.initial_state));
        }

        let resource = Resource {
            id: id.clone(),
            data,
            last_update: Utc::now(),
        };

        {
            let mut resources = self.resources.write().await;
            if resources.contains_key(&id) {
                return Err(CoreError::conflict(format!("resource '{}' exists", id)));
            }
            resources.insert(id.clone(), resource.clone());
        }

        if let Err(e) = self.persist(&resource).await {
            self.resources.write().await.remove(&id);
            return Err(e);
        }

        if let (Some(engine), Some(workflow)) = (&self.engine, &self.cfg.workflow) {
            if let Err(e) = engine
                .create_workflow(workflow, &id, resource.data.clone())
                .await
            {
                tracing::error!(resource = %self.cfg.resource, id = %id, error = %e, "instance create failed");
                self.resources.write().await.remove(&id);
                let _ = self.store.delete_resource(&self.cfg.resource, &id).await;
                return Err(e);
            }

            // The initial transition continues after the response commits,
            // on the handler's background token, never the request scope.
            if let Some(initial) = self.cfg.initial_transition.clone() {
                let engine = engine.clone();
                let instance_id = id.clone();
                let resource_type = self.cfg.resource.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(async move {
                    if cancel.is_cancelled() {
                        return;
                    }
                    if let Err(e) = engine
                        .trigger_transition(&instance_id, &initial, DataMap::new())
                        .await
                    {
                        tracing::warn!(resource = %resource_type, id = %instance_id, error = %e, "initial transition failed");
                    }
                });
            }
        }

        tracing::info!(resource = %self.cfg.resource, id = %id, "created resource");
        Ok((201, self.dto(&resource)))
    }

    async fn append_follow_up(&self, id: &str, body: &DataMap) -> Result<(u16, Value)> {
        let message = self
            .field_map
            .read(body, "message")
            .cloned()
            .unwrap_or_else(|| conveyor_core::value::map_to_object(body));

        let updated = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(id)
                .ok_or_else(|| CoreError::not_found(format!("resource '{}'", id)))?;

            let mut messages = self
                .field_map
                .read(&resource.data, "messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            messages.push(message);
            self.field_map
                .write(&mut resource.data, "messages", Value::Array(messages));
            resource.last_update = Utc::now();
            resource.clone()
        };

        self.persist(&updated).await?;
        tracing::info!(resource = %self.cfg.resource, id = %id, "appended follow-up");
        Ok((200, self.dto(&updated)))
    }

    // ============================================
    // Replace / delete
    // ============================================

    pub async fn replace(&self, id: &str, body: DataMap) -> Result<Value> {
        let (previous, updated) = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(id)
                .ok_or_else(|| CoreError::not_found(format!("resource '{}'", id)))?;
            let previous = resource.clone();

            let mut data = body;
            self.field_map.write(&mut data, "id", json!(id));
            resource.data = data;
            resource.last_update = Utc::now();
            (previous, resource.clone())
        };

        if let Err(e) = self.persist(&updated).await {
            self.resources
                .write()
                .await
                .insert(id.to_string(), previous);
            return Err(e);
        }
        Ok(self.dto(&updated))
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let removed = self.resources.write().await.remove(id);
        if removed.is_none() {
            return Err(CoreError::not_found(format!("resource '{}'", id)));
        }
        self.store
            .delete_resource(&self.cfg.resource, id)
            .await
            .map_err(|e| CoreError::persist(e.to_string()))?;
        tracing::info!(resource = %self.cfg.resource, id = %id, "deleted resource");
        Ok(())
    }

    // ============================================
    // Transitions and sub-actions
    // ============================================

    pub async fn transition(&self, id: &str, transition: &str, payload: DataMap) -> Result<Value> {
        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| CoreError::dependency("handler has no workflow engine"))?;
        if self.cfg.workflow.is_none() {
            return Err(CoreError::validation(format!(
                "resource '{}' is not workflow-bound",
                self.cfg.resource
            )));
        }

        if !self.resources.read().await.contains_key(id) {
            return Err(CoreError::not_found(format!("resource '{}'", id)));
        }

        // Engine linearises per instance and returns the post-transition
        // snapshot; no re-read from persistence.
        let instance = engine.trigger_transition(id, transition, payload.clone()).await?;

        let updated = {
            let mut resources = self.resources.write().await;
            let resource = resources
                .get_mut(id)
                .ok_or_else(|| CoreError::not_found(format!("resource '{}'", id)))?;
            resource.data.merge_from(&payload);
            self.field_map
                .write(&mut resource.data, "state", json!(instance.current_state));
            resource.last_update = instance.last_updated;
            resource.clone()
        };
        self.persist(&updated).await?;

        Ok(self.dto(&updated))
    }

    pub fn resolve_sub_action(&self, action: &str) -> Result<String> {
        self.cfg
            .sub_actions
            .get(action)
            .cloned()
            .ok_or_else(|| CoreError::validation(format!("unknown sub-action '{}'", action)))
    }

    // ============================================
    // Summary
    // ============================================

    pub async fn summary(&self, id: &str) -> Result<Value> {
        let resource = {
            let resources = self.resources.read().await;
            resources
                .get(id)
                .cloned()
                .ok_or_else(|| CoreError::not_found(format!("resource '{}'", id)))?
        };

        let mut summary = serde_json::Map::new();
        summary.insert("id".into(), json!(resource.id));
        for field in &self.cfg.summary_fields {
            if let Some(value) = self.field_map.read(&resource.data, field) {
                summary.insert(field.clone(), value.clone());
            }
        }

        // Live state wins over whatever the data map carries
        let state = match (&self.engine, &self.cfg.workflow) {
            (Some(engine), Some(_)) => match engine.get_instance(id).await {
                Ok(instance) => Some(json!(instance.current_state)),
                Err(_) => None,
            },
            _ => None,
        };
        let state = state.or_else(|| self.field_map.read(&resource.data, "state").cloned());
        summary.insert("state".into(), state.unwrap_or(Value::Null));

        Ok(Value::Object(summary))
    }

    /// Sync a committed state change back onto the owned resource.
    async fn sync_state_change(&self, change: &StateChange) -> Result<()> {
        let updated = {
            let mut resources = self.resources.write().await;
            let Some(resource) = resources.get_mut(&change.instance.id) else {
                return Ok(());
            };
            self.field_map
                .write(&mut resource.data, "state", json!(change.to_state));
            resource.last_update = change.instance.last_updated;
            for (key, value) in &change.instance.data {
                if !resource.data.contains_key(key) {
                    resource.data.insert(key.clone(), value.clone());
                }
            }
            resource.clone()
        };
        self.persist(&updated).await
    }
}

/// Engine listener bridging state changes back into the handler. Handlers
/// subscribe during module start, never init, which keeps the
/// engine/handler wiring acyclic.
struct ResourceStateListener {
    handler: Arc<ResourceHandler>,
}

#[async_trait]
impl StateChangeListener for ResourceStateListener {
    async fn on_state_change(&self, change: &StateChange) -> Result<()> {
        if self.handler.cfg.workflow.as_deref() != Some(change.instance.workflow_type.as_str()) {
            return Ok(());
        }
        self.handler.sync_state_change(change).await
    }
}

// ============================================
// Module wrapper
// ============================================

pub struct ResourceHandlerModule {
    cfg: ResourceHandlerConfig,
    handler: OnceLock<Arc<ResourceHandler>>,
}

impl ResourceHandlerModule {
    pub fn new(cfg: ResourceHandlerConfig) -> Self {
        Self {
            cfg,
            handler: OnceLock::new(),
        }
    }

    pub fn handler(&self) -> Option<Arc<ResourceHandler>> {
        self.handler.get().cloned()
    }
}

#[async_trait]
impl Module for ResourceHandlerModule {
    fn name(&self) -> &str {
        &self.cfg.resource
    }

    fn requires(&self) -> Vec<ServiceDependency> {
        let mut deps = vec![
            ServiceDependency::required(services::STORE),
            ServiceDependency::required(services::ROUTE_COLLECTOR),
        ];
        if self.cfg.workflow.is_some() {
            deps.push(ServiceDependency::required(services::WORKFLOW_ENGINE));
        } else {
            deps.push(ServiceDependency::optional(services::WORKFLOW_ENGINE));
        }
        deps
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        let store: Arc<Store> = host.services().get(services::STORE)?;
        let engine: Option<Arc<StateMachineEngine>> =
            host.services().get(services::WORKFLOW_ENGINE).ok();
        let collector: Arc<RouteCollector> = host.services().get(services::ROUTE_COLLECTOR)?;

        let handler = Arc::new(ResourceHandler::new(self.cfg.clone(), store, engine));
        handler.load_from_store().await?;
        collector.add(router(handler.clone()));

        self.handler
            .set(handler)
            .map_err(|_| CoreError::conflict("resource handler initialised twice"))?;
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let handler = self
            .handler
            .get()
            .ok_or_else(|| CoreError::dependency("resource handler not initialised"))?
            .clone();

        // Fail fast: the sub-action table and initial transition must match
        // the bound definition before traffic arrives.
        if let (Some(engine), Some(workflow)) = (&handler.engine, &handler.cfg.workflow) {
            let definition = engine.definition(workflow).ok_or_else(|| {
                CoreError::dependency(format!("workflow definition '{}'", workflow))
            })?;
            for (action, transition) in &handler.cfg.sub_actions {
                if definition.transition(transition).is_none() {
                    return Err(CoreError::validation(format!(
                        "resource '{}': sub-action '{}' maps to unknown transition '{}'",
                        handler.cfg.resource, action, transition
                    )));
                }
            }
            if let Some(initial) = &handler.cfg.initial_transition {
                if definition.transition(initial).is_none() {
                    return Err(CoreError::validation(format!(
                        "resource '{}': initial transition '{}' is not defined",
                        handler.cfg.resource, initial
                    )));
                }
            }

            engine.add_listener(Arc::new(ResourceStateListener {
                handler: handler.clone(),
            }));
        }

        let own = handler.cancel.clone();
        let host = ctx.cancellation().clone();
        tokio::spawn(async move {
            host.cancelled().await;
            own.cancel();
        });
        Ok(())
    }

    async fn stop(&self, _ctx: &RunContext) -> Result<()> {
        if let Some(handler) = self.handler.get() {
            handler.cancel.cancel();
        }
        Ok(())
    }
}

// ============================================
// Routes
// ============================================

pub fn router(handler: Arc<ResourceHandler>) -> Router {
    let base = format!("/{}", handler.resource_type());
    Router::new()
        .route(&base, get(list_resources).post(create_resource))
        .route(
            &format!("{}/:id", base),
            get(get_resource).put(replace_resource).delete(delete_resource),
        )
        .route(
            &format!("{}/:id/:action", base),
            get(resource_action_get).post(resource_action_post),
        )
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(handler)
}

fn effective_claims(
    claims: Option<Extension<AuthClaims>>,
    query: &HashMap<String, String>,
) -> AuthClaims {
    let mut claims = claims.map(|Extension(c)| c).unwrap_or_default();
    // Query parameters override claims
    if let Some(tenant) = query.get("tenantId") {
        claims.tenant_id = Some(tenant.clone());
    }
    if let Some(program) = query.get("programId") {
        claims.program_ids = vec![program.clone()];
    }
    claims
}

fn body_map(body: std::result::Result<Json<Value>, JsonRejection>) -> std::result::Result<DataMap, ApiError> {
    let Json(value) = body.map_err(|_| ApiError::validation())?;
    match value {
        Value::Object(fields) => Ok(fields.into_iter().collect()),
        _ => Err(ApiError::validation()),
    }
}

async fn list_resources(
    State(handler): State<Arc<ResourceHandler>>,
    Query(query): Query<HashMap<String, String>>,
    claims: Option<Extension<AuthClaims>>,
) -> std::result::Result<Json<Value>, ApiError> {
    let claims = effective_claims(claims, &query);
    Ok(Json(handler.list(&claims).await?))
}

async fn create_resource(
    State(handler): State<Arc<ResourceHandler>>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let data = body_map(body)?;
    let (status, dto) = handler.create(data).await?;
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    Ok((status, Json(dto)))
}

async fn get_resource(
    State(handler): State<Arc<ResourceHandler>>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Value>, ApiError> {
    Ok(Json(handler.get(&id).await?))
}

async fn replace_resource(
    State(handler): State<Arc<ResourceHandler>>,
    Path(id): Path<String>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> std::result::Result<Json<Value>, ApiError> {
    let data = body_map(body)?;
    Ok(Json(handler.replace(&id, data).await?))
}

async fn delete_resource(
    State(handler): State<Arc<ResourceHandler>>,
    Path(id): Path<String>,
) -> std::result::Result<StatusCode, ApiError> {
    handler.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resource_action_get(
    State(handler): State<Arc<ResourceHandler>>,
    Path((id, action)): Path<(String, String)>,
) -> std::result::Result<Json<Value>, ApiError> {
    match action.as_str() {
        "summary" => Ok(Json(handler.summary(&id).await?)),
        _ => Err(ApiError::not_found()),
    }
}

async fn resource_action_post(
    State(handler): State<Arc<ResourceHandler>>,
    Path((id, action)): Path<(String, String)>,
    body: std::result::Result<Json<Value>, JsonRejection>,
) -> std::result::Result<Json<Value>, ApiError> {
    let body = body_map(body)?;

    let (transition, payload) = if action == "transition" {
        let transition = body
            .get_str("transition")
            .ok_or_else(ApiError::validation)?
            .to_string();
        let payload = body
            .get("data")
            .map(conveyor_core::value::object_to_map)
            .unwrap_or_default();
        (transition, payload)
    } else {
        let transition = handler.resolve_sub_action(&action)?;
        let payload = if body.contains_key("data") {
            body.get("data")
                .map(conveyor_core::value::object_to_map)
                .unwrap_or_default()
        } else {
            body
        };
        (transition, payload)
    };

    Ok(Json(handler.transition(&id, &transition, payload).await?))
}
