//! HTTP request handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::exec::orchestrator::{CancelOutcome, StartOutcome};
use crate::models::deployment::{Deployment, LogEntry};
use crate::models::template::TemplateRef;
use crate::server::state::ServerState;
use crate::utils::version_info;

fn error_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::InvalidTransition(_) => StatusCode::CONFLICT,
        EngineError::ValidationError(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "berthd".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Deployment creation request
#[derive(Debug, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub template: TemplateRef,
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,
    pub created_by: String,
}

/// Create a pending deployment record
pub async fn create_handler(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<CreateDeploymentRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let deployment = Deployment::new(
        request.name,
        request.template,
        request.variables,
        request.created_by,
    );
    state
        .store
        .insert(deployment.clone())
        .await
        .map_err(|e| error_status(&e))?;

    Ok((StatusCode::CREATED, Json(deployment)))
}

/// Fetch a deployment record
pub async fn deployment_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<Deployment>, StatusCode> {
    let deployment = state.store.get(&id).await.map_err(|e| error_status(&e))?;
    Ok(Json(deployment))
}

/// Log listing response
#[derive(Debug, Serialize)]
pub struct LogsResponse {
    pub entries: Vec<LogEntry>,
    pub total: usize,
}

/// List the persisted log entries of a deployment in write order
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Json<LogsResponse>, StatusCode> {
    // Listing logs for an unknown deployment is a 404, not an empty list.
    state.store.get(&id).await.map_err(|e| error_status(&e))?;

    let entries = state.logs.list(&id).await.map_err(|e| error_status(&e))?;
    let total = entries.len();
    Ok(Json(LogsResponse { entries, total }))
}

/// Start response
#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub id: String,
    pub outcome: String,
}

/// Start a deployment in the background (fire-and-forget slot)
pub async fn start_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, StatusCode> {
    let outcome = state
        .orchestrator
        .start(&id)
        .await
        .map_err(|e| error_status(&e))?;

    let outcome = match outcome {
        StartOutcome::Started => "started",
        StartOutcome::AlreadyRunning => "already_running",
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(StartResponse {
            id,
            outcome: outcome.to_string(),
        }),
    ))
}

/// Cancel response
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub id: String,
    pub outcome: String,
}

/// Request cancellation of a running deployment
pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let outcome = match state.orchestrator.cancel(&id).await {
        CancelOutcome::Cancelling => "cancelling",
        CancelOutcome::NotRunning => "not_running",
    };
    Json(CancelResponse {
        id,
        outcome: outcome.to_string(),
    })
}
