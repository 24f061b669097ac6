use std::sync::Arc;

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::chat;
use super::debug;
use super::types::HealthResponse;
use crate::backend::{AgentEngine, CliEngine, ScriptedEngine};
use crate::bridge::StreamingBridge;
use crate::cancellation::CancellationRegistry;
use crate::config::{Config, EngineKind};
use crate::conversation::ConversationLocks;
use crate::pool::WorkerPool;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub engine_name: String,
    pub bridge: Arc<StreamingBridge>,
}

impl AppState {
    /// Construct the process-wide tables around `engine`.
    pub fn new(config: Config, engine: Arc<dyn AgentEngine>) -> Arc<Self> {
        let pool = WorkerPool::new(Arc::clone(&engine), config.pool.clone());
        let bridge = StreamingBridge::new(
            Arc::new(ConversationLocks::new()),
            Arc::new(CancellationRegistry::new()),
            pool,
            Arc::clone(&engine),
            config.bridge.clone(),
        );
        Arc::new(Self {
            engine_name: engine.name().to_string(),
            config,
            bridge,
        })
    }
}

pub fn build_engine(config: &Config) -> Arc<dyn AgentEngine> {
    match config.engine {
        EngineKind::Cli => Arc::new(CliEngine::new(config.cli.clone())),
        EngineKind::Scripted => Arc::new(ScriptedEngine::demo()),
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let mut api = Router::new()
        .route("/api/health", get(health))
        .route("/api/chat", post(chat::post_chat))
        .route("/api/chat/cancel", post(chat::post_cancel));

    if state.config.introspection {
        api = api.route("/api/debug/state", get(debug::get_state));
    }

    api.with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the HTTP server and run until Ctrl+C or SIGTERM.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let engine = build_engine(&config);
    let state = AppState::new(config, engine);
    let pool = Arc::clone(state.bridge.pool());
    let eviction = pool.spawn_eviction_loop();

    tracing::info!(
        engine = %state.engine_name,
        pool_enabled = pool.is_enabled(),
        max_workers = pool.config().max_workers,
        workspaces_root = %state.config.workspaces_root.display(),
        introspection = state.config.introspection,
        "Starting agent broker"
    );

    let addr = state.config.bind_addr;
    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    pool.shutdown().await;
    let _ = eviction.await;
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        engine: state.engine_name.clone(),
        pool_enabled: state.bridge.pool().is_enabled(),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
