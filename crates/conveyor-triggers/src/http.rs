// HTTP trigger
//
// Each configured route becomes an axum handler that snapshots the request
// into trigger data and metadata, extracts the W3C trace context, runs the
// dispatch target and commits whatever response a step staged. If no step
// wrote a response the trigger answers 202 with a minimal body.
//
// Cancellation: the per-request token is a child of the module token; axum
// drops the handler future on client disconnect, which abandons the
// pipeline at its next await. Work that must survive the response (async
// instance processing) runs on the module's background token instead.

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::extract::Request;
use axum::response::Response;
use axum::routing::{on, MethodFilter};
use axum::Router;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use conveyor_core::pipeline::{
    PipelineContext, META_HTTP_REQUEST, META_RAW_BODY, META_RESPONSE_BODY, META_RESPONSE_HEADERS,
    META_RESPONSE_STATUS, META_TRACEPARENT,
};
use conveyor_core::{
    propagation, services, AppHost, CoreError, DataMap, Module, Result, RunContext,
    ServiceDependency, TargetConfig, WorkflowDispatcher,
};

const BODY_LIMIT: usize = 1024 * 1024;

/// One configured route.
#[derive(Debug, Clone)]
pub struct HttpRouteConfig {
    pub name: String,
    pub method: String,
    pub path: String,
    pub include_headers: bool,
    pub target: TargetConfig,
    pub traced: bool,
}

pub struct HttpTriggerModule {
    name: String,
    routes: Vec<HttpRouteConfig>,
    cancel: CancellationToken,
}

impl HttpTriggerModule {
    pub fn new(name: impl Into<String>, routes: Vec<HttpRouteConfig>) -> Self {
        Self {
            name: name.into(),
            routes,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl Module for HttpTriggerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires(&self) -> Vec<ServiceDependency> {
        vec![
            ServiceDependency::required(services::WORKFLOW_DISPATCHER),
            ServiceDependency::required(services::ROUTE_COLLECTOR),
        ]
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        let dispatcher: Arc<WorkflowDispatcher> =
            host.services().get(services::WORKFLOW_DISPATCHER)?;
        let collector: Arc<crate::RouteCollector> =
            host.services().get(services::ROUTE_COLLECTOR)?;

        let mut router = Router::new();
        for route in &self.routes {
            let filter = method_filter(&route.method)?;
            let state = Arc::new(HttpRouteState {
                trigger: route.name.clone(),
                dispatcher: dispatcher.clone(),
                target: route.target.clone(),
                traced: route.traced,
                include_headers: route.include_headers,
                cancel: self.cancel.clone(),
            });
            tracing::info!(
                trigger = %route.name,
                method = %route.method,
                path = %route.path,
                "registered http trigger"
            );
            router = router.route(
                &route.path,
                on(filter, move |req: Request| {
                    let state = state.clone();
                    async move { handle(state, req).await }
                }),
            );
        }
        collector.add(router);
        Ok(())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let own = self.cancel.clone();
        let host = ctx.cancellation().clone();
        tokio::spawn(async move {
            host.cancelled().await;
            own.cancel();
        });
        Ok(())
    }

    async fn stop(&self, _ctx: &RunContext) -> Result<()> {
        self.cancel.cancel();
        Ok(())
    }
}

struct HttpRouteState {
    trigger: String,
    dispatcher: Arc<WorkflowDispatcher>,
    target: TargetConfig,
    traced: bool,
    include_headers: bool,
    cancel: CancellationToken,
}

fn method_filter(method: &str) -> Result<MethodFilter> {
    match method.to_uppercase().as_str() {
        "GET" => Ok(MethodFilter::GET),
        "POST" => Ok(MethodFilter::POST),
        "PUT" => Ok(MethodFilter::PUT),
        "DELETE" => Ok(MethodFilter::DELETE),
        "PATCH" => Ok(MethodFilter::PATCH),
        "HEAD" => Ok(MethodFilter::HEAD),
        "OPTIONS" => Ok(MethodFilter::OPTIONS),
        other => Err(CoreError::validation(format!(
            "unsupported trigger method '{}'",
            other
        ))),
    }
}

async fn handle(state: Arc<HttpRouteState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let bytes = match to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(trigger = %state.trigger, error = %e, "rejecting oversized or unreadable body");
            return error_response(&CoreError::validation("request body too large"));
        }
    };
    let raw_body = String::from_utf8_lossy(&bytes).into_owned();

    let query = parse_query(parts.uri.query());
    let headers_json = headers_to_json(&parts.headers);

    let mut trigger_data = DataMap::new();
    for (key, value) in &query {
        trigger_data.insert(key.clone(), json!(value));
    }
    if !bytes.is_empty() {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Object(fields)) => {
                for (key, value) in fields {
                    trigger_data.insert(key, value);
                }
            }
            Ok(other) => {
                trigger_data.insert("body".into(), other);
            }
            Err(_) => {
                trigger_data.insert("body".into(), json!(raw_body.clone()));
            }
        }
    }
    if state.include_headers {
        trigger_data.insert("headers".into(), headers_json.clone());
    }

    let trace = propagation::extract(&parts.headers);
    let trace_id = trace
        .as_ref()
        .map(|t| t.trace_id.clone())
        .unwrap_or_default();
    let span = tracing::info_span!(
        "http.trigger",
        trigger = %state.trigger,
        method = %parts.method,
        path = %parts.uri.path(),
        trace_id = %trace_id,
    );

    // Child of the module token: winds down with the process, dropped with
    // the request future on disconnect.
    let cancel = state.cancel.child_token();

    match &state.target {
        TargetConfig::Pipeline { pipeline } => {
            let mut ctx = PipelineContext::new(trigger_data);
            ctx.set_metadata(
                META_HTTP_REQUEST,
                json!({
                    "method": parts.method.as_str(),
                    "path": parts.uri.path(),
                    "query": query.iter().map(|(k, v)| (k.clone(), json!(v))).collect::<serde_json::Map<_, _>>(),
                    "headers": headers_json,
                }),
            );
            ctx.set_metadata(META_RAW_BODY, json!(raw_body));
            if let Some(trace) = &trace {
                ctx.set_metadata(META_TRACEPARENT, json!(trace.to_header_value()));
            }

            let run = state
                .dispatcher
                .run_pipeline(&cancel, pipeline, &mut ctx, state.traced)
                .instrument(span)
                .await;
            match run {
                Ok(()) => commit_response(&ctx),
                Err(e) => {
                    tracing::error!(trigger = %state.trigger, pipeline = %pipeline, error = %e, "pipeline failed");
                    error_response(&e)
                }
            }
        }
        target @ TargetConfig::StateMachine { .. } => {
            let run = state
                .dispatcher
                .trigger_workflow(&cancel, target, trigger_data)
                .instrument(span)
                .await;
            match run {
                Ok(outcome) => {
                    let body = match outcome.instance {
                        Some(instance) => json!({
                            "status": "accepted",
                            "id": instance.id,
                            "state": instance.current_state,
                        }),
                        None => json!({"status": "accepted"}),
                    };
                    json_response(202, &body)
                }
                Err(e) => {
                    tracing::error!(trigger = %state.trigger, error = %e, "dispatch failed");
                    error_response(&e)
                }
            }
        }
    }
}

/// Build the response a step staged in metadata, or the 202 fallback.
fn commit_response(ctx: &PipelineContext) -> Response {
    use conveyor_core::DataMapExt;

    if !ctx.response_handled() {
        return json_response(202, &json!({"status": "accepted"}));
    }

    let status = ctx
        .metadata
        .get_i64(META_RESPONSE_STATUS)
        .unwrap_or(200) as u16;

    let body_value = ctx.metadata.get(META_RESPONSE_BODY).cloned().unwrap_or(Value::Null);
    let body = match &body_value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    };

    let mut builder = Response::builder().status(status);
    let mut has_content_type = false;
    if let Some(headers) = ctx
        .metadata
        .get(META_RESPONSE_HEADERS)
        .and_then(Value::as_object)
    {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                has_content_type |= name.eq_ignore_ascii_case("content-type");
                builder = builder.header(name, value);
            }
        }
    }
    if !has_content_type && !matches!(body_value, Value::String(_) | Value::Null) {
        builder = builder.header(http::header::CONTENT_TYPE, "application/json");
    }

    builder
        .body(axum::body::Body::from(body))
        .unwrap_or_else(|_| fallback_500())
}

fn json_response(status: u16, body: &Value) -> Response {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap_or_else(|_| fallback_500())
}

/// Last-resort response when a staged status or header is unbuildable.
fn fallback_500() -> Response {
    let mut response = Response::new(axum::body::Body::from(r#"{"error":"internal"}"#));
    *response.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
    response
}

fn error_response(error: &CoreError) -> Response {
    json_response(error.http_status(), &json!({"error": error.category()}))
}

fn parse_query(query: Option<&str>) -> Vec<(String, String)> {
    let Some(query) = query else {
        return Vec::new();
    };
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (
                urlencoding::decode(key)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| key.to_string()),
                urlencoding::decode(value)
                    .map(|c| c.into_owned())
                    .unwrap_or_else(|_| value.to_string()),
            )
        })
        .collect()
}

fn headers_to_json(headers: &http::HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            map.insert(name.as_str().to_lowercase(), json!(value));
        }
    }
    Value::Object(map)
}
