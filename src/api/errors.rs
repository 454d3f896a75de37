use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::engine::WorkflowError;

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Application error type that converts to HTTP responses.
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    /// Duplicate trigger for an active run; carries the existing run id.
    Conflict { message: String, run_id: String },
    /// Durable state backend unreachable; the caller should retry.
    Unavailable(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, run_id, details) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, None, None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, None, None),
            AppError::Conflict { message, run_id } => {
                (StatusCode::CONFLICT, message, Some(run_id), None)
            }
            AppError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg, None, None),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                None,
                Some(format!("{:#}", err)),
            ),
        };

        (
            status,
            Json(ErrorResponse {
                error,
                run_id,
                details,
            }),
        )
            .into_response()
    }
}

impl From<WorkflowError> for AppError {
    fn from(err: WorkflowError) -> Self {
        match err {
            WorkflowError::AlreadyRunning { run_id } => AppError::Conflict {
                message: format!("a run for this chapter is already active: {}", run_id),
                run_id,
            },
            WorkflowError::RunNotFound(id) => AppError::NotFound(format!("Run '{}' not found", id)),
            WorkflowError::InvalidId(msg) => AppError::BadRequest(msg),
            WorkflowError::Backend(e) => {
                AppError::Unavailable(format!("state backend unavailable: {:#}", e))
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}
