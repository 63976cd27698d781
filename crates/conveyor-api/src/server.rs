// HTTP server module
//
// Registers the route collector during init (so trigger and handler
// modules can contribute routers in their own inits) and drains it at
// start into the served axum app. Serving runs on a spawned task with
// graceful shutdown driven by the host cancellation token.

use async_trait::async_trait;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use conveyor_core::{
    services, AppHost, CoreError, Module, Result, RunContext, ServiceDescriptor,
};
use conveyor_triggers::RouteCollector;

use crate::auth::{extract_claims, AuthState};

pub struct HttpServerModule {
    name: String,
    addr: String,
    auth: Option<AuthState>,
    collector: Arc<RouteCollector>,
}

impl HttpServerModule {
    pub fn new(addr: impl Into<String>, jwt_secret: Option<&str>) -> Self {
        Self {
            name: "http-server".to_string(),
            addr: addr.into(),
            auth: jwt_secret.map(AuthState::new),
            collector: Arc::new(RouteCollector::new()),
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[async_trait]
impl Module for HttpServerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> Vec<ServiceDescriptor> {
        vec![ServiceDescriptor::new(
            services::ROUTE_COLLECTOR,
            "route collection for the HTTP server",
        )]
    }

    async fn init(&self, host: &AppHost) -> Result<()> {
        host.services()
            .register(services::ROUTE_COLLECTOR, self.collector.clone())
    }

    async fn start(&self, ctx: &RunContext) -> Result<()> {
        let mut app = self
            .collector
            .drain()
            .into_iter()
            .fold(Router::new(), |app, router| app.merge(router))
            .route("/healthz", get(health));

        if let Some(auth) = &self.auth {
            app = app.layer(axum::middleware::from_fn_with_state(
                auth.clone(),
                extract_claims,
            ));
        }
        let app = app
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http());

        let listener = tokio::net::TcpListener::bind(&self.addr)
            .await
            .map_err(|e| {
                CoreError::Internal(anyhow::anyhow!("failed to bind {}: {}", self.addr, e))
            })?;
        tracing::info!(addr = %self.addr, "listening");

        let cancel = ctx.cancellation().clone();
        tokio::spawn(async move {
            let shutdown = async move { cancel.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                tracing::error!(error = %e, "server error");
            }
        });
        Ok(())
    }
}
