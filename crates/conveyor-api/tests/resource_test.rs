// Resource handler end-to-end over a real router and in-memory store:
// CRUD, workflow binding, claim filtering, sub-actions, summaries, view
// handlers and follow-up correlation.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

use conveyor_api::resource::ResourceHandlerModule;
use conveyor_core::config::ResourceHandlerConfig;
use conveyor_core::machine::{InstanceStore, StateMachineEngine, Transition, WorkflowDefinition};
use conveyor_core::{services, AppHost, AuthClaims, DataMap};
use conveyor_storage::{FieldEncryptor, SqliteInstanceStore, Store};
use conveyor_triggers::RouteCollector;

fn intake_definition() -> WorkflowDefinition {
    WorkflowDefinition {
        name: "intake".into(),
        initial_state: "new".into(),
        states: vec!["new".into(), "open".into(), "closed".into()],
        transitions: vec![
            Transition {
                name: "open".into(),
                from_state: "new".into(),
                to_state: "open".into(),
                guard: None,
                effect: None,
            },
            Transition {
                name: "close".into(),
                from_state: "open".into(),
                to_state: "closed".into(),
                guard: None,
                effect: None,
            },
        ],
        final_states: vec!["closed".into()],
    }
}

fn base_config() -> ResourceHandlerConfig {
    ResourceHandlerConfig {
        resource: "conversations".into(),
        workflow: Some("intake".into()),
        initial_transition: None,
        correlation_field: None,
        field_map: HashMap::new(),
        sub_actions: [("resolve".to_string(), "close".to_string())]
            .into_iter()
            .collect(),
        source_resource: None,
        state_filter: Vec::new(),
        summary_fields: vec!["tags".into()],
    }
}

struct Harness {
    router: axum::Router,
    store: Arc<Store>,
    engine: Arc<StateMachineEngine>,
    _host: AppHost,
}

async fn setup(cfg: ResourceHandlerConfig) -> Harness {
    let mut host = AppHost::new();

    let store = Arc::new(
        Store::open("sqlite::memory:", FieldEncryptor::disabled())
            .await
            .unwrap(),
    );
    host.services()
        .register(services::STORE, store.clone())
        .unwrap();

    let engine = Arc::new(StateMachineEngine::new());
    engine.attach_store(
        Arc::new(SqliteInstanceStore::new(store.clone())) as Arc<dyn InstanceStore>
    );
    engine.register_definition(intake_definition()).unwrap();
    host.services()
        .register(services::WORKFLOW_ENGINE, engine.clone())
        .unwrap();

    let collector = Arc::new(RouteCollector::new());
    host.services()
        .register(services::ROUTE_COLLECTOR, collector.clone())
        .unwrap();

    host.add_module(Arc::new(ResourceHandlerModule::new(cfg)));
    host.init().await.unwrap();
    host.start().await.unwrap();

    let router = collector
        .drain()
        .into_iter()
        .fold(axum::Router::new(), |r, part| r.merge(part));

    Harness {
        router,
        store,
        engine,
        _host: host,
    }
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_binds_workflow_instance() {
    let h = setup(base_config()).await;

    let (status, body) = send(
        &h.router,
        post_json("/conversations", json!({"id": "c1", "from": "+15550100"})),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], json!("c1"));
    assert_eq!(body["state"], json!("new"));

    // Engine has the instance, store has the resource
    let instance = h.engine.get_instance("c1").await.unwrap();
    assert_eq!(instance.current_state, "new");
    assert!(h
        .store
        .load_resource("conversations", "c1")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_create_duplicate_is_conflict() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;

    let (status, body) = send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, json!({"error": "conflict"}));
}

#[tokio::test]
async fn test_create_generates_id_when_missing() {
    let h = setup(base_config()).await;
    let (status, body) = send(&h.router, post_json("/conversations", json!({"x": 1}))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(!body["id"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_create_fires_initial_transition_in_background() {
    let mut cfg = base_config();
    cfg.initial_transition = Some("open".into());
    let h = setup(cfg).await;

    let (status, body) = send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    // The response reflects the initial state; the transition runs after
    assert_eq!(body["state"], json!("new"));

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let instance = h.engine.get_instance("c1").await.unwrap();
    assert_eq!(instance.current_state, "open");

    // The listener synced the resource
    let (_, body) = send(
        &h.router,
        Request::get("/conversations/c1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(body["state"], json!("open"));
}

#[tokio::test]
async fn test_malformed_body_is_validation_failure() {
    let h = setup(base_config()).await;
    let request = Request::post("/conversations")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "validation_failure"}));
}

// ============================================================================
// Read, replace, delete
// ============================================================================

#[tokio::test]
async fn test_get_enriches_from_instance() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1", "tags": ["a"]}))).await;

    // A pipeline merged extra keys into the instance data
    h.engine
        .trigger_transition("c1", "open", {
            let mut payload = DataMap::new();
            payload.insert("riskLevel".into(), json!("low"));
            payload.insert("tags".into(), json!(["from-engine"]));
            payload
        })
        .await
        .unwrap();

    let (status, body) = send(
        &h.router,
        Request::get("/conversations/c1").body(Body::empty()).unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("open"));
    // Key absent from the resource was copied in
    assert_eq!(body["data"]["riskLevel"], json!("low"));
    // The handler stays authoritative for keys it already holds
    assert_eq!(body["data"]["tags"], json!(["a"]));
}

#[tokio::test]
async fn test_get_missing_is_404() {
    let h = setup(base_config()).await;
    let (status, body) = send(
        &h.router,
        Request::get("/conversations/ghost").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"error": "not_found"}));
}

#[tokio::test]
async fn test_replace_and_delete() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1", "v": 1}))).await;

    let request = Request::put("/conversations/c1")
        .header("content-type", "application/json")
        .body(Body::from(json!({"v": 2}).to_string()))
        .unwrap();
    let (status, body) = send(&h.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["v"], json!(2));

    let (status, _) = send(
        &h.router,
        Request::delete("/conversations/c1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert!(h
        .store
        .load_resource("conversations", "c1")
        .await
        .unwrap()
        .is_none());
    let (status, _) = send(
        &h.router,
        Request::get("/conversations/c1").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Claim filtering (scenario S6)
// ============================================================================

async fn seed_tenancy(h: &Harness) {
    for (id, tenant, program) in [
        ("r1", "A", "p1"),
        ("r2", "A", "p2"),
        ("r3", "B", "p1"),
    ] {
        send(
            &h.router,
            post_json(
                "/conversations",
                json!({"id": id, "tenantId": tenant, "programId": program}),
            ),
        )
        .await;
    }
}

fn list_with_claims(claims: AuthClaims) -> Request<Body> {
    Request::get("/conversations")
        .extension(claims)
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_claim_filter_non_admin() {
    let h = setup(base_config()).await;
    seed_tenancy(&h).await;

    let claims = AuthClaims {
        role: Some("user".into()),
        tenant_id: Some("A".into()),
        program_ids: vec!["p1".into()],
    };
    let (status, body) = send(&h.router, list_with_claims(claims)).await;
    assert_eq!(status, StatusCode::OK);

    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["r1"]);
}

#[tokio::test]
async fn test_claim_filter_admin_sees_everything() {
    let h = setup(base_config()).await;
    seed_tenancy(&h).await;

    let claims = AuthClaims {
        role: Some("admin".into()),
        tenant_id: Some("A".into()),
        program_ids: vec!["p1".into()],
    };
    let (_, body) = send(&h.router, list_with_claims(claims)).await;
    assert_eq!(body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_query_params_override_claims() {
    let h = setup(base_config()).await;
    seed_tenancy(&h).await;

    // Claims say tenant A, the query forces tenant B
    let claims = AuthClaims {
        role: Some("user".into()),
        tenant_id: Some("A".into()),
        program_ids: Vec::new(),
    };
    let request = Request::get("/conversations?tenantId=B")
        .extension(claims)
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&h.router, request).await;

    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["r3"]);
}

// ============================================================================
// Transitions and sub-actions
// ============================================================================

#[tokio::test]
async fn test_transition_endpoint_syncs_state() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;

    let (status, body) = send(
        &h.router,
        post_json(
            "/conversations/c1/transition",
            json!({"transition": "open", "data": {"agent": "zoe"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("open"));
    assert_eq!(body["data"]["agent"], json!("zoe"));

    // Write-through: persisted copy carries the new state
    let persisted = h
        .store
        .load_resource("conversations", "c1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted["state"], json!("open"));
}

#[tokio::test]
async fn test_illegal_transition_is_conflict() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;

    let (status, body) = send(
        &h.router,
        post_json("/conversations/c1/transition", json!({"transition": "close"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body, json!({"error": "illegal_transition"}));
}

#[tokio::test]
async fn test_sub_action_resolves_to_transition() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;
    send(
        &h.router,
        post_json("/conversations/c1/transition", json!({"transition": "open"})),
    )
    .await;

    let (status, body) = send(
        &h.router,
        post_json("/conversations/c1/resolve", json!({"data": {"resolved": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], json!("closed"));
}

#[tokio::test]
async fn test_unknown_sub_action_is_validation_failure() {
    let h = setup(base_config()).await;
    send(&h.router, post_json("/conversations", json!({"id": "c1"}))).await;

    let (status, body) = send(
        &h.router,
        post_json("/conversations/c1/escalate", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"error": "validation_failure"}));
}

#[tokio::test]
async fn test_sub_action_to_unknown_transition_fails_start() {
    let mut cfg = base_config();
    cfg.sub_actions
        .insert("vanish".to_string(), "not-a-transition".to_string());

    let mut host = AppHost::new();
    let store = Arc::new(
        Store::open("sqlite::memory:", FieldEncryptor::disabled())
            .await
            .unwrap(),
    );
    host.services().register(services::STORE, store).unwrap();
    let engine = Arc::new(StateMachineEngine::new());
    engine.register_definition(intake_definition()).unwrap();
    host.services()
        .register(services::WORKFLOW_ENGINE, engine)
        .unwrap();
    host.services()
        .register(services::ROUTE_COLLECTOR, Arc::new(RouteCollector::new()))
        .unwrap();

    host.add_module(Arc::new(ResourceHandlerModule::new(cfg)));
    host.init().await.unwrap();
    assert!(host.start().await.is_err());
}

// ============================================================================
// Summary
// ============================================================================

#[tokio::test]
async fn test_summary_returns_configured_fields_and_live_state() {
    let h = setup(base_config()).await;
    send(
        &h.router,
        post_json(
            "/conversations",
            json!({"id": "c1", "tags": ["urgent"], "secret": "hidden"}),
        ),
    )
    .await;
    h.engine
        .trigger_transition("c1", "open", DataMap::new())
        .await
        .unwrap();

    let (status, body) = send(
        &h.router,
        Request::get("/conversations/c1/summary").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!("c1"));
    assert_eq!(body["state"], json!("open"));
    assert_eq!(body["tags"], json!(["urgent"]));
    assert!(body.get("secret").is_none());
}

// ============================================================================
// View handlers
// ============================================================================

#[tokio::test]
async fn test_view_handler_reads_source_with_state_filter() {
    let view_cfg = ResourceHandlerConfig {
        resource: "open-conversations".into(),
        workflow: None,
        initial_transition: None,
        correlation_field: None,
        field_map: HashMap::new(),
        sub_actions: HashMap::new(),
        source_resource: Some("conversations".into()),
        state_filter: vec!["open".into()],
        summary_fields: Vec::new(),
    };
    let h = setup(view_cfg).await;

    // Seed the source type directly in the store
    for (id, state, tenant) in [("c1", "open", "A"), ("c2", "closed", "A"), ("c3", "open", "B")] {
        let mut data = DataMap::new();
        data.insert("state".into(), json!(state));
        data.insert("tenantId".into(), json!(tenant));
        h.store.save_resource("conversations", id, &data).await.unwrap();
    }

    let (status, body) = send(
        &h.router,
        Request::get("/open-conversations").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(2));
    assert_eq!(body["count"], json!(2));

    // Claims narrow the items but the pre-claim total is reported
    let claims = AuthClaims {
        role: Some("user".into()),
        tenant_id: Some("A".into()),
        program_ids: Vec::new(),
    };
    let request = Request::get("/open-conversations")
        .extension(claims)
        .body(Body::empty())
        .unwrap();
    let (_, body) = send(&h.router, request).await;
    assert_eq!(body["total"], json!(2));
    assert_eq!(body["count"], json!(1));
    assert_eq!(body["items"][0]["id"], json!("c1"));
}

// ============================================================================
// Follow-up correlation
// ============================================================================

#[tokio::test]
async fn test_follow_up_appends_instead_of_creating() {
    let mut cfg = base_config();
    cfg.correlation_field = Some("from".into());
    let h = setup(cfg).await;

    let (status, first) = send(
        &h.router,
        post_json(
            "/conversations",
            json!({"from": "+15550100", "message": "help"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = first["id"].as_str().unwrap().to_string();

    let (status, second) = send(
        &h.router,
        post_json(
            "/conversations",
            json!({"from": "+15550100", "message": "still there?"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["id"], json!(id));
    assert_eq!(second["data"]["messages"], json!(["still there?"]));

    // At most one resource per correlation value
    let (_, list) = send(
        &h.router,
        Request::get("/conversations").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(list.as_array().unwrap().len(), 1);
}
