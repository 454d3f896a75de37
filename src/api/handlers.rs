use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::{Deserialize, Serialize};

use crate::engine::types::{WorkflowRun, WorkflowStatus};

use super::AppState;
use super::errors::AppError;

// --- Request/Response types ---

#[derive(Deserialize)]
pub struct StartRunRequest {
    pub book_id: String,
    pub chapter_id: String,
    /// Start a fresh, explicitly versioned run even if one exists.
    #[serde(default)]
    pub force_new: bool,
}

#[derive(Serialize)]
pub struct StartRunResponse {
    pub run_id: String,
    pub status: String,
    pub deduplicated: bool,
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub status: Option<String>,
}

#[derive(Serialize)]
pub struct ActivityInfo {
    pub name: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Handlers ---

/// POST /runs: the "start chapter processing" capability.
pub async fn start_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<StartRunResponse>, AppError> {
    let receipt = state
        .client
        .start(&req.book_id, &req.chapter_id, req.force_new)
        .await?;
    let status = state.client.status(&receipt.run_id).await?;

    Ok(Json(StartRunResponse {
        run_id: receipt.run_id,
        status: status.to_string(),
        deduplicated: receipt.deduplicated,
    }))
}

/// GET /runs
pub async fn list_runs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListRunsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status_filter: Option<WorkflowStatus> = params
        .status
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let runs = state
        .store
        .list_runs(status_filter)
        .await
        .map_err(AppError::Internal)?;

    let summaries: Vec<serde_json::Value> = runs
        .iter()
        .map(|r| {
            serde_json::json!({
                "run_id": r.run_id,
                "book_id": r.book_id,
                "chapter_id": r.chapter_id,
                "status": r.status(),
                "created": r.created,
                "steps": r.steps.len(),
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "runs": summaries,
        "total": summaries.len(),
    })))
}

/// GET /runs/:id: the "check status" capability. Read-only.
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let run = state.client.get_run(&id).await?;
    Ok(Json(run_view(&run)?))
}

/// POST /runs/:id/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.client.cancel(&id).await?;
    Ok(Json(serde_json::json!({
        "run_id": id,
        "status": status,
    })))
}

/// DELETE /runs/:id
pub async fn delete_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    // Check it exists first.
    state.client.get_run(&id).await?;
    state.store.delete_run(&id).await.map_err(AppError::Internal)?;

    Ok(Json(serde_json::json!({
        "deleted": id,
    })))
}

/// GET /activities
pub async fn list_activities(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let activities: Vec<ActivityInfo> = state
        .registry
        .list()
        .iter()
        .map(|(name, desc)| ActivityInfo {
            name: name.to_string(),
            description: desc.to_string(),
        })
        .collect();

    let total = activities.len();
    Json(serde_json::json!({
        "activities": activities,
        "total": total,
    }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

/// Full run record with the derived status attached.
fn run_view(run: &WorkflowRun) -> Result<serde_json::Value, AppError> {
    let mut value = serde_json::to_value(run).map_err(|e| AppError::Internal(e.into()))?;
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "status".to_string(),
            serde_json::to_value(run.status()).map_err(|e| AppError::Internal(e.into()))?,
        );
    }
    Ok(value)
}
