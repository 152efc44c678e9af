//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::EngineError;
use crate::server::handlers::{
    cancel_handler, create_handler, deployment_handler, health_handler, logs_handler,
    start_handler, version_handler,
};
use crate::server::state::ServerState;
use crate::server::ws::stream_handler;
use crate::storage::settings::ServerSettings;

/// Build the engine router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Deployments
        .route("/deployments", post(create_handler))
        .route("/deployments/{id}", get(deployment_handler))
        .route("/deployments/{id}/logs", get(logs_handler))
        .route("/deployments/{id}/start", post(start_handler))
        .route("/deployments/{id}/cancel", post(cancel_handler))
        // Streaming
        .route("/deployments/{id}/stream", get(stream_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the HTTP server
pub async fn serve(
    settings: &ServerSettings,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = router(state);

    let addr = format!("{}:{}", settings.host, settings.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
