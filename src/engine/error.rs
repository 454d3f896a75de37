use thiserror::Error;

/// Errors surfaced by the workflow client. Activity-level errors never reach
/// this type; they are classified inside the run record instead.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Duplicate trigger for a run that is still active. Carries the
    /// deterministic run id so the caller can attach to the existing run.
    #[error("a run for this chapter is already active: {run_id}")]
    AlreadyRunning { run_id: String },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The durable state backend could not be reached or misbehaved. The
    /// caller is expected to retry; no state was lost.
    #[error("state backend unavailable: {0:#}")]
    Backend(anyhow::Error),
}

impl WorkflowError {
    pub fn backend(err: anyhow::Error) -> Self {
        WorkflowError::Backend(err)
    }
}
