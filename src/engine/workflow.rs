use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::engine::types::*;
use crate::storage::RunStore;

/// What the workflow wants to happen next for a run.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Append this step to the run and make it claimable.
    ScheduleStep(StepState),
    /// Every planned step has succeeded.
    Complete,
    /// A step is still in flight, retrying, or the run already stopped;
    /// nothing to schedule.
    Wait,
}

/// Deterministic orchestration logic for one run.
///
/// `decide` must be a pure function of the run record: no clock reads, no
/// randomness, no I/O. Replaying it over the same recorded step results has
/// to produce the identical decision, because that replay is how a run is
/// resumed after a worker crash.
pub trait WorkflowDefinition: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, run: &WorkflowRun) -> Decision;
}

/// One planned step of a pipeline: activity name plus static configuration.
#[derive(Debug, Clone)]
pub struct StepPlan {
    pub activity: String,
    pub config: serde_json::Value,
    pub retry: RetryPolicy,
    pub timeout_s: Option<f64>,
}

/// The production workflow: process one chapter of one book.
///
/// Fixed four-step pipeline: fetch the chapter text, split it into
/// reader-sized chunks, annotate the chunks, persist them. Each step's input
/// is the plan config merged over the previous step's recorded result, so the
/// whole sequence is reconstructible from history alone.
pub struct ChapterWorkflow {
    pub lines_per_chunk: usize,
    pub tokens_per_chunk: usize,
    pub retry: RetryPolicy,
}

impl Default for ChapterWorkflow {
    fn default() -> Self {
        Self {
            lines_per_chunk: 20,
            tokens_per_chunk: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl ChapterWorkflow {
    pub fn new(lines_per_chunk: usize, tokens_per_chunk: usize, retry: RetryPolicy) -> Self {
        Self {
            lines_per_chunk,
            tokens_per_chunk,
            retry,
        }
    }

    fn plan(&self) -> Vec<StepPlan> {
        vec![
            StepPlan {
                activity: "fetch_chapter".to_string(),
                config: serde_json::json!({}),
                retry: self.retry.clone(),
                timeout_s: Some(30.0),
            },
            StepPlan {
                activity: "chunk_chapter".to_string(),
                config: serde_json::json!({
                    "lines_per_chunk": self.lines_per_chunk,
                    "tokens_per_chunk": self.tokens_per_chunk,
                }),
                retry: self.retry.clone(),
                timeout_s: Some(60.0),
            },
            StepPlan {
                activity: "annotate_chunks".to_string(),
                config: serde_json::json!({}),
                retry: self.retry.clone(),
                timeout_s: Some(30.0),
            },
            StepPlan {
                activity: "store_chunks".to_string(),
                config: serde_json::json!({}),
                retry: self.retry.clone(),
                timeout_s: Some(60.0),
            },
        ]
    }
}

impl WorkflowDefinition for ChapterWorkflow {
    fn name(&self) -> &str {
        "process_chapter"
    }

    fn decide(&self, run: &WorkflowRun) -> Decision {
        decide_linear(run, &self.plan())
    }
}

/// Decider for a linear pipeline: schedule the step after the last succeeded
/// one, complete when the plan is exhausted, wait while anything is in flight.
pub fn decide_linear(run: &WorkflowRun, plan: &[StepPlan]) -> Decision {
    // A step that is not yet succeeded blocks scheduling; its own retry or
    // failure handling happens at report time, not here.
    if run.steps.iter().any(|s| s.status != StepStatus::Succeeded) {
        return Decision::Wait;
    }

    let next = run.steps.len();
    if next >= plan.len() {
        return Decision::Complete;
    }

    let planned = &plan[next];
    let mut input = serde_json::json!({
        "book_id": run.book_id,
        "chapter_id": run.chapter_id,
    });
    merge_into(&mut input, &planned.config);
    if let Some(prev) = run.steps.last().and_then(|s| s.result.as_ref()) {
        merge_into(&mut input, prev);
    }

    let mut step = StepState::new(next, &planned.activity, input, planned.retry.clone());
    step.timeout_s = planned.timeout_s;
    Decision::ScheduleStep(step)
}

/// Apply one decision for a run: schedule the next step or mark completion.
/// No-op for runs that are already terminal or cancelled. Returns whether
/// anything was scheduled or marked.
pub async fn advance(
    store: &Arc<dyn RunStore>,
    workflow: &dyn WorkflowDefinition,
    run_id: &str,
) -> Result<bool> {
    let Some(run) = store.get_run(run_id).await? else {
        anyhow::bail!("run not found: {}", run_id);
    };
    if run.status().is_terminal() {
        return Ok(false);
    }

    match workflow.decide(&run) {
        Decision::ScheduleStep(step) => {
            info!(run_id = %run_id, step = step.index, activity = %step.activity, "Scheduling step");
            store.schedule_step(run_id, step).await?;
            Ok(true)
        }
        Decision::Complete => {
            info!(run_id = %run_id, steps = run.steps.len(), "Workflow completed");
            store.mark_completed(run_id).await?;
            Ok(true)
        }
        Decision::Wait => Ok(false),
    }
}

fn merge_into(target: &mut serde_json::Value, overlay: &serde_json::Value) {
    if let (Some(target_map), Some(overlay_map)) = (target.as_object_mut(), overlay.as_object()) {
        for (k, v) in overlay_map {
            target_map.insert(k.clone(), v.clone());
        }
    }
}
