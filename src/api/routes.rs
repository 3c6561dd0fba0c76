//! HTTP route wiring and server startup.

use std::sync::Arc;

use axum::{
    extract::State,
    http::HeaderMap,
    response::Json,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::engine::echo::EchoEngine;
use crate::engine::{EngineRegistry, ExecutionEngine};
use crate::session::{RunContext, SessionConcurrencyGuard};
use crate::store::{create_conversation_store, ConversationStore, StoreType};
use crate::translate::RunHooks;

use super::conversations;
use super::run;
use super::types::*;

/// Header consulted when a request does not name its user.
pub const USER_HEADER: &str = "x-user-id";
const ANONYMOUS_USER: &str = "anonymous";

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub engines: EngineRegistry,
    pub store: Arc<dyn ConversationStore>,
    /// Session locks, shared by every run
    pub guard: SessionConcurrencyGuard,
    pub hooks: RunHooks,
}

impl AppState {
    pub fn new(config: Config, engines: EngineRegistry, store: Arc<dyn ConversationStore>) -> Self {
        Self {
            config,
            engines,
            store,
            guard: SessionConcurrencyGuard::new(),
            hooks: RunHooks::default(),
        }
    }

    pub fn run_context(&self, engine: Arc<dyn ExecutionEngine>) -> RunContext {
        RunContext {
            guard: self.guard.clone(),
            store: Arc::clone(&self.store),
            engine,
            hooks: self.hooks.clone(),
            config: self.config.run_config(),
        }
    }
}

/// Resolve the caller: explicit id, then the `x-user-id` header, then anonymous.
pub fn resolve_user(explicit: Option<&str>, headers: &HeaderMap) -> String {
    explicit
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| {
            headers
                .get(USER_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| ANONYMOUS_USER.to_string())
}

/// Build the router over prepared state.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/apps", get(list_apps))
        .route("/api/run", post(run::run_default_app))
        .route("/api/apps/:app/run", post(run::run_app))
        .route(
            "/api/apps/:app/conversations",
            get(conversations::list_conversations),
        )
        .route(
            "/api/apps/:app/conversations/:id",
            get(conversations::get_conversation).delete(conversations::delete_conversation),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let store = create_conversation_store(config.store_type, config.store_dir.clone()).await?;
    tracing::info!(
        store = store_name(config.store_type),
        dir = %config.store_dir.display(),
        persistent = store.is_persistent(),
        "Conversation store ready"
    );

    let mut engines = EngineRegistry::new(config.default_app.clone());
    engines.register_as(config.default_app.clone(), Arc::new(EchoEngine::new()));
    for app in engines.list() {
        tracing::info!(app = %app.id, engine = %app.name, "Registered application");
    }

    let state = Arc::new(AppState::new(config.clone(), engines, store));
    let app = router(Arc::clone(&state));

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}

/// Wait for SIGTERM/SIGINT.
async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!(
        active_sessions = state.guard.held_count(),
        "Shutdown signal received, draining open runs"
    );
}

fn store_name(store_type: StoreType) -> &'static str {
    match store_type {
        StoreType::Memory => "memory",
        StoreType::File => "file",
        StoreType::Sqlite => "sqlite",
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: store_name(state.config.store_type).to_string(),
        persistent: state.store.is_persistent(),
        active_sessions: state.guard.held_count(),
    })
}

async fn list_apps(State(state): State<Arc<AppState>>) -> Json<AppsResponse> {
    Json(AppsResponse {
        default_app: state.engines.default_app().to_string(),
        apps: state.engines.list(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::store::InMemoryConversationStore;

    pub fn state_with(engines: Vec<(&str, Arc<dyn ExecutionEngine>)>) -> Arc<AppState> {
        let mut registry = EngineRegistry::new("echo");
        registry.register(Arc::new(EchoEngine::new()));
        for (app, engine) in engines {
            registry.register_as(app, engine);
        }
        Arc::new(AppState::new(
            Config::default(),
            registry,
            Arc::new(InMemoryConversationStore::new()),
        ))
    }

    pub async fn send(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, String) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(USER_HEADER, "tester")
            .body(match body {
                Some(body) => Body::from(body.to_string()),
                None => Body::empty(),
            })
            .expect("request");
        let response = router(Arc::clone(state))
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1024 * 1024)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&bytes).to_string())
    }

    /// `data:` payloads of an SSE body.
    pub fn sse_events(body: &str) -> Vec<Value> {
        body.lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .filter_map(|data| serde_json::from_str(data.trim_start()).ok())
            .collect()
    }

    pub fn event_types(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e["type"].as_str().map(str::to_string))
            .collect()
    }
}
