#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, Request, Response, StatusCode};
use axum::Router;
use chrono::Utc;
use http_body_util::BodyExt;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;
use uuid::Uuid;

use scriptbox_api::config::{LogFormat, ServerConfig};
use scriptbox_api::routes;
use scriptbox_api::scripting::orchestrator::ScriptOrchestrator;
use scriptbox_api::state::AppState;
use scriptbox_core::script_types::{ScriptCategory, ScriptDefinition, TriggerEvent};
use scriptbox_core::scripting::dispatcher::ExecutionDispatcher;
use scriptbox_core::scripting::memory::{InMemoryHistoryStore, InMemoryScriptRegistry};

/// Build a test `ServerConfig` with safe defaults and a small statement
/// ceiling so runaway scripts end quickly.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        database_url: None,
        log_format: LogFormat::Pretty,
        script_timeout_ms: 10_000,
        script_max_statements: 1_000,
        script_max_memory_mb: 32,
        script_allow_network: false,
        script_allow_file_access: false,
        script_max_workers: 4,
        script_max_queue_depth: 16,
        script_shutdown_grace_secs: 1,
    }
}

/// Router plus handles on the in-memory collaborators behind it.
pub struct TestApp {
    pub router: Router,
    pub registry: Arc<InMemoryScriptRegistry>,
    pub history: Arc<InMemoryHistoryStore>,
    pub tenant_id: Uuid,
}

impl TestApp {
    /// Register an active `after-create`/`order` script for the test tenant.
    pub fn seed(&self, source: &str) -> ScriptDefinition {
        self.seed_with(source, TriggerEvent::AfterCreate, "order", true)
    }

    pub fn seed_with(
        &self,
        source: &str,
        trigger_event: TriggerEvent,
        entity: &str,
        is_active: bool,
    ) -> ScriptDefinition {
        let script = ScriptDefinition {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            name: format!("{entity} script"),
            description: None,
            source: source.to_string(),
            category: ScriptCategory::Automation,
            trigger_event,
            trigger_entity: Some(entity.to_string()),
            is_active,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        self.registry
            .insert(script.clone())
            .expect("seed script");
        script
    }
}

/// Build the full application router with all middleware layers on top of
/// in-memory collaborators.
///
/// This mirrors the router construction in `main.rs` so integration tests
/// exercise the same middleware stack production uses.
pub fn build_test_app() -> TestApp {
    let config = test_config();
    let registry = Arc::new(InMemoryScriptRegistry::new());
    let history = Arc::new(InMemoryHistoryStore::new());
    let dispatcher = Arc::new(ExecutionDispatcher::start(config.dispatcher_config()));
    let orchestrator = Arc::new(ScriptOrchestrator::new(
        registry.clone(),
        history.clone(),
        dispatcher.clone(),
    ));

    let state = AppState {
        config: Arc::new(config),
        orchestrator,
        dispatcher,
        pool: None,
    };

    let cors = CorsLayer::new()
        .allow_origin(["http://localhost:5173".parse().unwrap()])
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(3600));

    let request_id_header = HeaderName::from_static("x-request-id");

    let router = Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(30),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .with_state(state);

    TestApp {
        router,
        registry,
        history,
        tenant_id: Uuid::new_v4(),
    }
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is JSON")
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    app.oneshot(
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}
