use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::error::WorkflowError;
use crate::engine::types::*;
use crate::engine::workflow::{WorkflowDefinition, advance};
use crate::storage::{CreateOutcome, RunStore};

/// Receipt for a start request.
#[derive(Debug, Clone, Serialize)]
pub struct StartReceipt {
    pub run_id: String,
    /// True when the trigger was deduplicated onto an existing run.
    pub deduplicated: bool,
}

/// Read projection of a run for status callers, with stall diagnostics.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run: WorkflowRun,
    pub status: WorkflowStatus,
    pub last_completed_step: Option<usize>,
    /// Set when the run is nominally Running but no worker has claimed its
    /// due step within the stall window.
    pub stall_diagnostic: Option<String>,
}

/// The single internal trigger/query API. The CLI and the HTTP surface are
/// both thin adapters over this type; concurrency safety comes from the
/// store's atomic create-if-absent keyed by the deterministic run id.
#[derive(Clone)]
pub struct WorkflowClient {
    store: Arc<dyn RunStore>,
    workflow: Arc<dyn WorkflowDefinition>,
}

impl WorkflowClient {
    pub fn new(store: Arc<dyn RunStore>, workflow: Arc<dyn WorkflowDefinition>) -> Self {
        Self { store, workflow }
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.store.clone()
    }

    /// Start a workflow run for (book, chapter).
    ///
    /// Without `force_new`, re-submission is idempotent: an active run for
    /// the same key fails with `AlreadyRunning` carrying the existing run id,
    /// and a terminal run is returned as a deduplicated receipt. With
    /// `force_new`, a fresh explicitly versioned run is created.
    pub async fn start(
        &self,
        book_id: &str,
        chapter_id: &str,
        force_new: bool,
    ) -> Result<StartReceipt, WorkflowError> {
        if book_id.trim().is_empty() {
            return Err(WorkflowError::InvalidId("book id is empty".to_string()));
        }
        if chapter_id.trim().is_empty() {
            return Err(WorkflowError::InvalidId("chapter id is empty".to_string()));
        }

        let base = run_id_for(book_id, chapter_id);
        let existing = self
            .store
            .find_runs_for_key(book_id, chapter_id)
            .await
            .map_err(WorkflowError::backend)?;

        if !force_new {
            if let Some(active) = existing
                .iter()
                .find(|r| r.status() == WorkflowStatus::Running)
            {
                return Err(WorkflowError::AlreadyRunning {
                    run_id: active.run_id.clone(),
                });
            }
            if let Some(latest) = existing.last() {
                return Ok(StartReceipt {
                    run_id: latest.run_id.clone(),
                    deduplicated: true,
                });
            }
            return self.create(&base, book_id, chapter_id).await;
        }

        // Forced fresh run: version past the highest surviving version, so a
        // deleted intermediate run can never cause an id collision.
        let run_id = if existing.is_empty() {
            base.clone()
        } else {
            versioned_run_id(&base, next_version(&base, &existing))
        };
        self.create(&run_id, book_id, chapter_id).await
    }

    /// Idempotent start: maps `AlreadyRunning` onto a deduplicated receipt so
    /// two concurrent triggers both end up observing the same run.
    pub async fn start_or_attach(
        &self,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<StartReceipt, WorkflowError> {
        match self.start(book_id, chapter_id, false).await {
            Ok(receipt) => Ok(receipt),
            Err(WorkflowError::AlreadyRunning { run_id }) => Ok(StartReceipt {
                run_id,
                deduplicated: true,
            }),
            Err(e) => Err(e),
        }
    }

    async fn create(
        &self,
        run_id: &str,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<StartReceipt, WorkflowError> {
        let run = WorkflowRun::new(run_id, book_id, chapter_id, self.workflow.name());
        match self
            .store
            .create_run(&run)
            .await
            .map_err(WorkflowError::backend)?
        {
            CreateOutcome::Created => {
                info!(run_id = %run_id, book = %book_id, chapter = %chapter_id, "Run created");
                // Schedule the first step so workers have something to claim.
                advance(&self.store, self.workflow.as_ref(), run_id)
                    .await
                    .map_err(WorkflowError::backend)?;
                Ok(StartReceipt {
                    run_id: run_id.to_string(),
                    deduplicated: false,
                })
            }
            // Lost a create race: someone else owns this run id now.
            CreateOutcome::AlreadyExists(existing) => Err(WorkflowError::AlreadyRunning {
                run_id: existing.run_id,
            }),
        }
    }

    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun, WorkflowError> {
        self.store
            .get_run(run_id)
            .await
            .map_err(WorkflowError::backend)?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.to_string()))
    }

    /// Read-only status query; never mutates history.
    pub async fn status(&self, run_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        Ok(self.get_run(run_id).await?.status())
    }

    /// Status plus stall diagnostics: a Running run whose due step has sat
    /// unclaimed for longer than `stall_after` is surfaced, not dropped.
    pub async fn report(
        &self,
        run_id: &str,
        stall_after: Duration,
    ) -> Result<RunReport, WorkflowError> {
        let run = self.get_run(run_id).await?;
        let status = run.status();
        let last_completed_step = run.last_completed_step();

        let mut stall_diagnostic = None;
        if status == WorkflowStatus::Running {
            let now = Utc::now();
            for step in &run.steps {
                let waiting = matches!(step.status, StepStatus::Pending | StepStatus::Retrying);
                if !waiting {
                    continue;
                }
                let due_since = step.not_before.unwrap_or(step.scheduled);
                if now.signed_duration_since(due_since).to_std().unwrap_or_default() > stall_after
                {
                    stall_diagnostic = Some(format!(
                        "step {} ({}) has been claimable for over {}s without a worker picking it up; check that a worker is running and can reach the store",
                        step.index,
                        step.activity,
                        stall_after.as_secs()
                    ));
                }
            }

            // A running run where every step already succeeded has nothing
            // claimable or in flight: scheduling was interrupted. A worker's
            // idle poll repairs this, but only if one is running.
            let nothing_open = run
                .steps
                .iter()
                .all(|s| s.status == StepStatus::Succeeded);
            if nothing_open {
                let idle_since = run
                    .steps
                    .iter()
                    .filter_map(|s| s.attempts.last().and_then(|a| a.finished))
                    .max()
                    .unwrap_or(run.created);
                if now
                    .signed_duration_since(idle_since)
                    .to_std()
                    .unwrap_or_default()
                    > stall_after
                {
                    stall_diagnostic = Some(format!(
                        "run has had no step scheduled or in flight for over {}s; check that a worker is running so the next step gets scheduled",
                        stall_after.as_secs()
                    ));
                }
            }
        }

        Ok(RunReport {
            run,
            status,
            last_completed_step,
            stall_diagnostic,
        })
    }

    /// Request cancellation. In-flight steps run to completion; nothing new
    /// is scheduled afterwards.
    pub async fn cancel(&self, run_id: &str) -> Result<WorkflowStatus, WorkflowError> {
        // Existence check first so a bad id is NotFound, not a silent no-op.
        self.get_run(run_id).await?;
        let status = self
            .store
            .request_cancel(run_id)
            .await
            .map_err(WorkflowError::backend)?;
        info!(run_id = %run_id, status = %status, "Cancel requested");
        Ok(status)
    }

    /// Poll until the run reaches a terminal state, logging a stall warning
    /// once if no worker appears to be servicing it.
    pub async fn wait_until_terminal(
        &self,
        run_id: &str,
        poll_interval: Duration,
        stall_after: Duration,
    ) -> Result<WorkflowRun, WorkflowError> {
        let mut warned = false;
        loop {
            let report = self.report(run_id, stall_after).await?;
            if report.status.is_terminal() {
                return Ok(report.run);
            }
            if let Some(diag) = report.stall_diagnostic {
                if !warned {
                    warn!(run_id = %run_id, "{}", diag);
                    warned = true;
                }
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
