pub mod json_store;
pub mod memory_store;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use uuid::Uuid;

use crate::engine::types::*;

/// Result of an atomic create-if-absent.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    Created,
    AlreadyExists(WorkflowRun),
}

/// Everything a worker needs to execute one claimed step. Workers are
/// stateless between claims; this is the per-claim context.
#[derive(Debug, Clone)]
pub struct StepClaim {
    pub run_id: String,
    pub step_index: usize,
    pub activity: String,
    pub input: serde_json::Value,
    /// 1-based attempt number, lost attempts included.
    pub attempt: u32,
    /// Recorded transient failures before this attempt.
    pub transient_failures: u32,
    pub first_claimed: DateTime<Utc>,
    pub retry: RetryPolicy,
    pub timeout_s: Option<f64>,
    pub lease_token: String,
    pub effect_key: String,
}

/// Outcome a worker reports for a claimed step. The retry disposition is the
/// worker's call (it holds the policy snapshot); the store only records it.
#[derive(Debug, Clone)]
pub enum StepReport {
    Succeeded {
        result: serde_json::Value,
    },
    /// Transient failure with retry budget left; re-claimable after `not_before`.
    Retry {
        error: String,
        not_before: DateTime<Utc>,
    },
    /// Transient failure with the budget exhausted. Step and run fail.
    Exhausted {
        error: String,
    },
    /// The activity signalled it cannot succeed on retry. Step and run fail.
    Permanent {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Recorded,
    /// The reporter's lease was no longer current; the step was re-claimed
    /// after lease expiry. The report is dropped, state is untouched.
    StaleLease,
}

/// Contract the orchestrator requires from the durable state backend.
///
/// The store is the single source of truth for run history. Implementations
/// must make `create_run` atomic per run id and `claim_step` hand any given
/// step to at most one live lease at a time.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create the run if no run with its id exists.
    async fn create_run(&self, run: &WorkflowRun) -> Result<CreateOutcome>;

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// All runs (any version) for a (book, chapter) key, oldest first.
    async fn find_runs_for_key(&self, book_id: &str, chapter_id: &str)
    -> Result<Vec<WorkflowRun>>;

    async fn list_runs(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowRun>>;

    /// Append a pending step to a run.
    async fn schedule_step(&self, run_id: &str, step: StepState) -> Result<()>;

    /// Claim the next due step across all runs, taking a lease on it.
    /// Steps of cancelled or otherwise terminal runs are never handed out.
    async fn claim_step(
        &self,
        worker_id: &str,
        lease_duration: std::time::Duration,
    ) -> Result<Option<StepClaim>>;

    /// Record the outcome of a claimed step. Rejected with `StaleLease` if the
    /// lease token is no longer current.
    async fn report_step(
        &self,
        run_id: &str,
        step_index: usize,
        lease_token: &str,
        report: StepReport,
    ) -> Result<ReportOutcome>;

    /// Mark the run cancelled. Advisory to in-flight steps, authoritative for
    /// scheduling. No-op on terminal runs; returns the resulting status.
    async fn request_cancel(&self, run_id: &str) -> Result<WorkflowStatus>;

    async fn mark_completed(&self, run_id: &str) -> Result<()>;

    async fn delete_run(&self, run_id: &str) -> Result<()>;
}

/// Try to claim a step from `run`. Shared by store implementations so claim
/// semantics (backoff deadlines, lease expiry, lost attempts) stay identical.
pub(crate) fn try_claim(
    run: &mut WorkflowRun,
    worker_id: &str,
    now: DateTime<Utc>,
    lease_duration: std::time::Duration,
) -> Option<StepClaim> {
    if run.status() != WorkflowStatus::Running {
        return None;
    }

    let run_id = run.run_id.clone();
    for step in &mut run.steps {
        let claimable = match step.status {
            StepStatus::Pending | StepStatus::Retrying => {
                step.not_before.is_none_or(|t| t <= now)
            }
            StepStatus::Running => {
                // Lease expired without a report: the previous attempt's
                // outcome is unknown, not failed.
                match &step.lease {
                    Some(lease) if lease.expires <= now => {
                        if let Some(last) = step.attempts.last_mut() {
                            if last.outcome.is_none() {
                                last.outcome = Some(AttemptOutcome::Lost);
                            }
                        }
                        true
                    }
                    _ => false,
                }
            }
            StepStatus::Succeeded | StepStatus::Failed => false,
        };
        if !claimable {
            continue;
        }

        let attempt = step.attempts.len() as u32 + 1;
        let token = Uuid::new_v4().to_string();
        step.attempts.push(AttemptRecord {
            number: attempt,
            worker_id: worker_id.to_string(),
            claimed: now,
            finished: None,
            outcome: None,
        });
        step.status = StepStatus::Running;
        step.lease = Some(Lease {
            worker_id: worker_id.to_string(),
            token: token.clone(),
            expires: now
                + ChronoDuration::from_std(lease_duration)
                    .unwrap_or_else(|_| ChronoDuration::seconds(60)),
        });

        return Some(StepClaim {
            run_id: run_id.clone(),
            step_index: step.index,
            activity: step.activity.clone(),
            input: step.input.clone(),
            attempt,
            transient_failures: step.transient_failures(),
            first_claimed: step.first_claimed().unwrap_or(now),
            retry: step.retry.clone(),
            timeout_s: step.timeout_s,
            lease_token: token,
            effect_key: effect_key(&run_id, step.index),
        });
    }

    None
}

/// Apply a step report to `run`. Shared by store implementations.
pub(crate) fn apply_report(
    run: &mut WorkflowRun,
    step_index: usize,
    lease_token: &str,
    report: StepReport,
    now: DateTime<Utc>,
) -> Result<ReportOutcome> {
    let run_id = run.run_id.clone();
    let cancelled = run.cancel_requested.is_some();
    let last_completed = run.last_completed_step();

    let Some(step) = run.steps.get_mut(step_index) else {
        anyhow::bail!("run {}: no step with index {}", run_id, step_index);
    };

    let lease_is_current = step
        .lease
        .as_ref()
        .map(|l| l.token == lease_token)
        .unwrap_or(false);
    if step.status != StepStatus::Running || !lease_is_current {
        return Ok(ReportOutcome::StaleLease);
    }

    let Some(attempt) = step.attempts.last_mut() else {
        anyhow::bail!("run {}: step {} has a lease but no attempt", run_id, step_index);
    };
    attempt.finished = Some(now);
    step.lease = None;

    let failure = match report {
        StepReport::Succeeded { result } => {
            attempt.outcome = Some(AttemptOutcome::Succeeded);
            step.status = StepStatus::Succeeded;
            step.result = Some(result);
            step.error = None;
            step.not_before = None;
            None
        }
        StepReport::Retry { error, not_before } => {
            attempt.outcome = Some(AttemptOutcome::TransientError(error.clone()));
            step.status = StepStatus::Retrying;
            step.error = Some(error);
            step.not_before = Some(not_before);
            None
        }
        StepReport::Exhausted { error } => {
            attempt.outcome = Some(AttemptOutcome::TransientError(error.clone()));
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            Some(error)
        }
        StepReport::Permanent { error } => {
            attempt.outcome = Some(AttemptOutcome::PermanentError(error.clone()));
            step.status = StepStatus::Failed;
            step.error = Some(error.clone());
            Some(error)
        }
    };

    if let Some(error) = failure {
        let activity = step.activity.clone();
        // A cancelled run stays cancelled; the failed step is still recorded.
        if !cancelled && run.completed.is_none() && run.failed.is_none() {
            run.failed = Some(FailureInfo {
                step_index,
                activity,
                error,
                last_completed_step: last_completed,
                at: now,
            });
        }
    }

    Ok(ReportOutcome::Recorded)
}
