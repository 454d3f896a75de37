use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::activities::{ActivityContext, ActivityError, ActivityRegistry};
use crate::engine::types::{StepStatus, WorkflowStatus};
use crate::engine::workflow::{WorkflowDefinition, advance};
use crate::storage::{ReportOutcome, RunStore, StepClaim, StepReport};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Steps executed concurrently by this worker process.
    pub concurrency: usize,
    /// Sleep between empty polls of the store's task queue.
    pub poll_interval: Duration,
    /// How long a claim stays exclusive before another worker may take it.
    pub lease_duration: Duration,
    /// Root of the content store activities read from and write to.
    pub library_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            concurrency: std::env::var("CHAPTERFLOW_MAX_CONCURRENT_STEPS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(num_cpus::get),
            poll_interval: Duration::from_millis(500),
            lease_duration: Duration::from_secs(60),
            library_dir: PathBuf::from("library"),
        }
    }
}

/// A worker: claims due steps from the store, executes the activity, reports
/// the outcome, and on success advances the workflow. Stateless between
/// claims; everything it needs travels in the `StepClaim`.
pub struct Worker {
    registry: Arc<ActivityRegistry>,
    store: Arc<dyn RunStore>,
    workflow: Arc<dyn WorkflowDefinition>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        registry: Arc<ActivityRegistry>,
        store: Arc<dyn RunStore>,
        workflow: Arc<dyn WorkflowDefinition>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            workflow,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Poll-and-execute loop; runs until the surrounding task is dropped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        info!(
            worker_id = %self.config.worker_id,
            concurrency = self.config.concurrency,
            "Worker started"
        );

        loop {
            let permit = semaphore.clone().acquire_owned().await?;

            match self
                .store
                .claim_step(&self.config.worker_id, self.config.lease_duration)
                .await
            {
                Ok(Some(claim)) => {
                    let worker = self.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        let run_id = claim.run_id.clone();
                        let step = claim.step_index;
                        if let Err(e) = worker.process_claim(claim).await {
                            error!(
                                run_id = %run_id,
                                step = step,
                                error = %format!("{:#}", e),
                                "Failed to process claimed step"
                            );
                        }
                    });
                }
                Ok(None) => {
                    drop(permit);
                    match self.repair_unadvanced().await {
                        // A run was repaired; poll again right away for the
                        // step it just scheduled.
                        Ok(n) if n > 0 => continue,
                        Ok(_) => {}
                        Err(e) => {
                            warn!(
                                worker_id = %self.config.worker_id,
                                error = %format!("{:#}", e),
                                "Failed to repair stalled runs"
                            );
                        }
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!(
                        worker_id = %self.config.worker_id,
                        error = %format!("{:#}", e),
                        "Store unreachable while claiming, backing off"
                    );
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// Claim and execute steps sequentially until nothing is due, then
    /// return the number processed. Used by tests and local one-shot runs.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        loop {
            match self
                .store
                .claim_step(&self.config.worker_id, self.config.lease_duration)
                .await?
            {
                Some(claim) => {
                    self.process_claim(claim).await?;
                    processed += 1;
                }
                None => {
                    if self.repair_unadvanced().await? == 0 {
                        break;
                    }
                }
            }
        }
        Ok(processed)
    }

    /// Re-run the decider for running runs that have nothing claimable or in
    /// flight. A worker that dies after reporting a success but before
    /// scheduling the next step leaves the run in exactly that shape; any
    /// worker's next idle poll repairs it. Returns the number of runs moved.
    async fn repair_unadvanced(&self) -> Result<usize> {
        let mut repaired = 0;
        for run in self
            .store
            .list_runs(Some(WorkflowStatus::Running))
            .await?
        {
            let idle = run
                .steps
                .iter()
                .all(|s| s.status == StepStatus::Succeeded);
            if idle && advance(&self.store, self.workflow.as_ref(), &run.run_id).await? {
                info!(run_id = %run.run_id, "Repaired run with no scheduled step");
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    /// Execute one claimed step and report its outcome.
    async fn process_claim(&self, claim: StepClaim) -> Result<()> {
        info!(
            run_id = %claim.run_id,
            step = claim.step_index,
            activity = %claim.activity,
            attempt = claim.attempt,
            "Executing step"
        );

        let result = match self.registry.get(&claim.activity) {
            Some(activity) => {
                let ctx = ActivityContext {
                    run_id: claim.run_id.clone(),
                    step_index: claim.step_index,
                    attempt: claim.attempt,
                    effect_key: claim.effect_key.clone(),
                    library_dir: self.config.library_dir.clone(),
                };
                match claim.timeout_s {
                    Some(timeout_s) => {
                        let limit = Duration::from_secs_f64(timeout_s);
                        match tokio::time::timeout(limit, activity.execute(&claim.input, ctx)).await
                        {
                            Ok(r) => r,
                            Err(_) => Err(ActivityError::transient(anyhow::anyhow!(
                                "activity timed out after {}s",
                                timeout_s
                            ))),
                        }
                    }
                    None => activity.execute(&claim.input, ctx).await,
                }
            }
            // An unregistered activity cannot succeed on retry.
            None => Err(ActivityError::permanent(anyhow::anyhow!(
                "unknown activity: {}",
                claim.activity
            ))),
        };

        let report = match result {
            Ok(value) => StepReport::Succeeded { result: value },
            Err(err) => self.dispose_failure(&claim, err),
        };
        let advance_after = matches!(report, StepReport::Succeeded { .. });

        let outcome = self
            .store
            .report_step(&claim.run_id, claim.step_index, &claim.lease_token, report)
            .await?;

        match outcome {
            ReportOutcome::Recorded => {
                if advance_after {
                    advance(&self.store, self.workflow.as_ref(), &claim.run_id).await?;
                }
            }
            ReportOutcome::StaleLease => {
                // Our lease expired and the step moved on without us. The
                // result is discarded; a fresh attempt owns the step now.
                warn!(
                    run_id = %claim.run_id,
                    step = claim.step_index,
                    attempt = claim.attempt,
                    "Report rejected, lease no longer current"
                );
            }
        }

        Ok(())
    }

    /// Turn a failed execution into a retry/fail disposition using the step's
    /// policy snapshot. Lost attempts never count against the budget; only
    /// recorded transient failures do.
    fn dispose_failure(&self, claim: &StepClaim, err: ActivityError) -> StepReport {
        let error = err.message();

        if err.is_permanent() {
            warn!(
                run_id = %claim.run_id,
                step = claim.step_index,
                error = %error,
                "Step failed permanently"
            );
            return StepReport::Permanent { error };
        }

        let failures = claim.transient_failures + 1;
        if failures >= claim.retry.max_attempts {
            warn!(
                run_id = %claim.run_id,
                step = claim.step_index,
                attempts = failures,
                error = %error,
                "Retry budget exhausted"
            );
            return StepReport::Exhausted { error };
        }

        let delay = claim.retry.backoff_for(failures + 1);

        if let Some(cap) = claim.retry.max_elapsed_s {
            let elapsed = Utc::now()
                .signed_duration_since(claim.first_claimed)
                .to_std()
                .unwrap_or_default();
            if elapsed + delay > Duration::from_secs_f64(cap) {
                warn!(
                    run_id = %claim.run_id,
                    step = claim.step_index,
                    elapsed_s = elapsed.as_secs(),
                    error = %error,
                    "Retry window exhausted"
                );
                return StepReport::Exhausted { error };
            }
        }

        info!(
            run_id = %claim.run_id,
            step = claim.step_index,
            attempt = claim.attempt,
            delay_s = delay.as_secs_f64(),
            "Transient failure, step re-claimable after backoff"
        );
        StepReport::Retry {
            error,
            not_before: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }
}
