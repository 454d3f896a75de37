//! End-to-end tests for worker claim/execute/report and the run lifecycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use chapterflow::activities::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use chapterflow::engine::types::*;
use chapterflow::engine::workflow::{StepPlan, WorkflowDefinition, decide_linear};
use chapterflow::engine::{ChapterWorkflow, Decision, Worker, WorkerConfig, WorkflowClient};
use chapterflow::storage::RunStore;
use chapterflow::storage::memory_store::MemoryRunStore;

// --- Test fixtures ---

struct EchoActivity;

#[async_trait]
impl Activity for EchoActivity {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Succeed with a marker"
    }
    async fn execute(
        &self,
        _input: &serde_json::Value,
        ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        Ok(serde_json::json!({ "echoed_step": ctx.step_index }))
    }
}

struct AlwaysTransientActivity {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl Activity for AlwaysTransientActivity {
    fn name(&self) -> &str {
        "always_transient"
    }
    fn description(&self) -> &str {
        "Fail transiently on every attempt"
    }
    async fn execute(
        &self,
        _input: &serde_json::Value,
        _ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ActivityError::transient(anyhow::anyhow!(
            "simulated network failure"
        )))
    }
}

struct PermanentFailActivity;

#[async_trait]
impl Activity for PermanentFailActivity {
    fn name(&self) -> &str {
        "always_permanent"
    }
    fn description(&self) -> &str {
        "Fail permanently"
    }
    async fn execute(
        &self,
        _input: &serde_json::Value,
        _ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError> {
        Err(ActivityError::permanent(anyhow::anyhow!(
            "invalid chapter id"
        )))
    }
}

/// Linear pipeline over arbitrary test activities.
struct TestWorkflow {
    plan: Vec<StepPlan>,
}

impl TestWorkflow {
    fn of(activities: &[&str], retry: RetryPolicy) -> Self {
        Self {
            plan: activities
                .iter()
                .map(|name| StepPlan {
                    activity: name.to_string(),
                    config: serde_json::json!({}),
                    retry: retry.clone(),
                    timeout_s: None,
                })
                .collect(),
        }
    }
}

impl WorkflowDefinition for TestWorkflow {
    fn name(&self) -> &str {
        "test_pipeline"
    }
    fn decide(&self, run: &WorkflowRun) -> Decision {
        decide_linear(run, &self.plan)
    }
}

fn no_backoff_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff_s: 0.0,
        max_backoff_s: 0.0,
        max_elapsed_s: None,
    }
}

fn test_registry() -> ActivityRegistry {
    let mut registry = ActivityRegistry::new();
    registry.register(Arc::new(EchoActivity));
    registry.register(Arc::new(AlwaysTransientActivity {
        calls: Arc::new(AtomicU32::new(0)),
    }));
    registry.register(Arc::new(PermanentFailActivity));
    registry
}

fn worker_for(
    registry: ActivityRegistry,
    store: Arc<dyn RunStore>,
    workflow: Arc<dyn WorkflowDefinition>,
    library: &std::path::Path,
) -> Worker {
    Worker::new(
        Arc::new(registry),
        store,
        workflow,
        WorkerConfig {
            library_dir: library.to_path_buf(),
            ..WorkerConfig::default()
        },
    )
}

// --- Full pipeline ---

#[tokio::test]
async fn chapter_pipeline_runs_to_completion() {
    let library = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(library.path().join("book-42")).unwrap();
    std::fs::write(
        library.path().join("book-42/ch-3.txt"),
        "Hello, reader!\nThis is chapter three.\n\nIt has two paragraphs.\n",
    )
    .unwrap();

    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> = Arc::new(ChapterWorkflow::default());
    let client = WorkflowClient::new(store.clone(), workflow.clone());

    let receipt = client.start("book-42", "ch-3", false).await.unwrap();
    assert!(!receipt.deduplicated);

    let worker = worker_for(
        ActivityRegistry::with_builtins(),
        store.clone(),
        workflow,
        library.path(),
    );
    let processed = worker.drain().await.unwrap();
    assert_eq!(processed, 4);

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Completed);
    assert_eq!(run.steps.len(), 4);
    for step in &run.steps {
        assert_eq!(step.status, StepStatus::Succeeded);
        assert!(!step.attempts.is_empty());
    }

    // Chunks landed in the content store.
    let chunk_dir = library.path().join("book-42/ch-3.chunks");
    assert!(chunk_dir.join("manifest.json").exists());
    assert!(chunk_dir.join("000.txt").exists());
}

#[tokio::test]
async fn missing_chapter_fails_at_first_step() {
    let library = tempfile::tempdir().unwrap();
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> = Arc::new(ChapterWorkflow::default());
    let client = WorkflowClient::new(store.clone(), workflow.clone());

    let receipt = client.start("no-such-book", "ch-1", false).await.unwrap();

    let worker = worker_for(
        ActivityRegistry::with_builtins(),
        store.clone(),
        workflow,
        library.path(),
    );
    worker.drain().await.unwrap();

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Failed);
    // Permanent error: one attempt, no retries.
    assert_eq!(run.steps[0].attempts.len(), 1);
    let failure = run.failed.unwrap();
    assert_eq!(failure.step_index, 0);
    assert_eq!(failure.last_completed_step, None);
}

// --- Retry semantics ---

#[tokio::test]
async fn transient_failures_stop_at_the_attempt_budget() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry = ActivityRegistry::new();
    registry.register(Arc::new(AlwaysTransientActivity {
        calls: calls.clone(),
    }));

    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> =
        Arc::new(TestWorkflow::of(&["always_transient"], no_backoff_retry(3)));
    let client = WorkflowClient::new(store.clone(), workflow.clone());
    let library = tempfile::tempdir().unwrap();

    let receipt = client.start("b", "c", false).await.unwrap();
    let worker = worker_for(registry, store.clone(), workflow, library.path());
    worker.drain().await.unwrap();

    // Exactly 3 executions, never a 4th.
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Failed);
    assert_eq!(run.steps[0].attempts.len(), 3);
    assert!(
        run.steps[0]
            .attempts
            .iter()
            .all(|a| matches!(a.outcome, Some(AttemptOutcome::TransientError(_))))
    );
}

#[tokio::test]
async fn permanent_error_stops_the_pipeline_immediately() {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> = Arc::new(TestWorkflow::of(
        &["echo", "always_permanent", "echo"],
        no_backoff_retry(3),
    ));
    let client = WorkflowClient::new(store.clone(), workflow.clone());
    let library = tempfile::tempdir().unwrap();

    let receipt = client.start("b", "c", false).await.unwrap();
    let worker = worker_for(test_registry(), store.clone(), workflow, library.path());
    worker.drain().await.unwrap();

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Failed);
    // Step 2 (index 2) was never scheduled.
    assert_eq!(run.steps.len(), 2);
    assert_eq!(run.steps[1].status, StepStatus::Failed);
    assert_eq!(run.steps[1].attempts.len(), 1);

    let failure = run.failed.unwrap();
    assert_eq!(failure.step_index, 1);
    assert_eq!(failure.last_completed_step, Some(0));
}

// --- Lease expiry / crash recovery ---

#[tokio::test]
async fn expired_lease_is_reclaimed_by_another_worker() {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> =
        Arc::new(TestWorkflow::of(&["echo"], no_backoff_retry(3)));
    let client = WorkflowClient::new(store.clone(), workflow.clone());

    let receipt = client.start("b", "c", false).await.unwrap();

    // Worker one claims with a very short lease and then "crashes".
    let claim1 = store
        .claim_step("worker-one", Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim1.attempt, 1);

    tokio::time::sleep(Duration::from_millis(30)).await;

    // Worker two re-claims the same step after the lease expired.
    let claim2 = store
        .claim_step("worker-two", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claim2.run_id, claim1.run_id);
    assert_eq!(claim2.step_index, claim1.step_index);
    assert_eq!(claim2.attempt, 2);

    // The lost attempt is recorded as unknown outcome, not as a failure.
    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(
        run.steps[0].attempts[0].outcome,
        Some(AttemptOutcome::Lost)
    );
    assert_eq!(run.steps[0].transient_failures(), 0);

    // A late report from the crashed worker is rejected.
    let stale = store
        .report_step(
            &claim1.run_id,
            claim1.step_index,
            &claim1.lease_token,
            chapterflow::storage::StepReport::Succeeded {
                result: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
    assert_eq!(stale, chapterflow::storage::ReportOutcome::StaleLease);

    // The live claim completes normally.
    let ok = store
        .report_step(
            &claim2.run_id,
            claim2.step_index,
            &claim2.lease_token,
            chapterflow::storage::StepReport::Succeeded {
                result: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
    assert_eq!(ok, chapterflow::storage::ReportOutcome::Recorded);

    chapterflow::engine::workflow::advance(&store, workflow.as_ref(), &receipt.run_id)
        .await
        .unwrap();

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.steps[0].status, StepStatus::Succeeded);
    assert_eq!(run.status(), WorkflowStatus::Completed);
}

#[tokio::test]
async fn interrupted_scheduling_is_repaired_on_the_next_poll() {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> =
        Arc::new(TestWorkflow::of(&["echo", "echo"], no_backoff_retry(3)));
    let client = WorkflowClient::new(store.clone(), workflow.clone());
    let library = tempfile::tempdir().unwrap();

    let receipt = client.start("b", "c", false).await.unwrap();

    // Worker one reports step 0 done but dies before the next step is
    // scheduled, leaving the run with nothing claimable.
    let claim = store
        .claim_step("worker-one", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    store
        .report_step(
            &claim.run_id,
            claim.step_index,
            &claim.lease_token,
            chapterflow::storage::StepReport::Succeeded {
                result: serde_json::json!({}),
            },
        )
        .await
        .unwrap();

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Running);
    assert_eq!(run.steps.len(), 1);

    // A replacement worker's idle poll re-runs the decider, schedules step 1
    // and executes it to completion.
    let worker = worker_for(test_registry(), store.clone(), workflow, library.path());
    let processed = worker.drain().await.unwrap();
    assert_eq!(processed, 1);

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Completed);
    assert_eq!(run.steps.len(), 2);
    assert!(
        run.steps
            .iter()
            .all(|s| s.status == StepStatus::Succeeded)
    );
}

// --- Cancellation ---

#[tokio::test]
async fn cancel_stops_scheduling_but_records_inflight_outcome() {
    let store: Arc<dyn RunStore> = Arc::new(MemoryRunStore::new());
    let workflow: Arc<dyn WorkflowDefinition> =
        Arc::new(TestWorkflow::of(&["echo", "echo"], no_backoff_retry(3)));
    let client = WorkflowClient::new(store.clone(), workflow.clone());
    let library = tempfile::tempdir().unwrap();

    let receipt = client.start("b", "c", false).await.unwrap();

    // Step 0 is claimed (in flight), then the run is cancelled.
    let claim = store
        .claim_step("worker-one", Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let status = client.cancel(&receipt.run_id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Cancelled);

    // The in-flight step still reports its outcome and it is recorded.
    let outcome = store
        .report_step(
            &claim.run_id,
            claim.step_index,
            &claim.lease_token,
            chapterflow::storage::StepReport::Succeeded {
                result: serde_json::json!({}),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, chapterflow::storage::ReportOutcome::Recorded);

    // But nothing new is claimable and no second step ever appears.
    let worker = worker_for(test_registry(), store.clone(), workflow, library.path());
    assert_eq!(worker.drain().await.unwrap(), 0);

    let run = store.get_run(&receipt.run_id).await.unwrap().unwrap();
    assert_eq!(run.status(), WorkflowStatus::Cancelled);
    assert_eq!(run.steps.len(), 1);
    assert_eq!(run.steps[0].status, StepStatus::Succeeded);
}
