use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;

use crate::engine::types::*;
use crate::storage::{
    CreateOutcome, ReportOutcome, RunStore, StepClaim, StepReport, apply_report, try_claim,
};

/// In-memory run store for tests and embedded single-process use.
/// State lives only as long as the store instance.
pub struct MemoryRunStore {
    runs: Mutex<HashMap<String, WorkflowRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<CreateOutcome> {
        let mut runs = self.runs.lock().unwrap();
        if let Some(existing) = runs.get(&run.run_id) {
            return Ok(CreateOutcome::AlreadyExists(existing.clone()));
        }
        runs.insert(run.run_id.clone(), run.clone());
        Ok(CreateOutcome::Created)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        Ok(self.runs.lock().unwrap().get(run_id).cloned())
    }

    async fn find_runs_for_key(
        &self,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.lock().unwrap();
        let mut matched: Vec<WorkflowRun> = runs
            .values()
            .filter(|r| r.book_id == book_id && r.chapter_id == chapter_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created.cmp(&b.created).then(a.run_id.cmp(&b.run_id)));
        Ok(matched)
    }

    async fn list_runs(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.lock().unwrap();
        let mut out: Vec<WorkflowRun> = runs
            .values()
            .filter(|r| status.is_none_or(|s| r.status() == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(out)
    }

    async fn schedule_step(&self, run_id: &str, step: StepState) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
        if run.steps.iter().any(|s| s.index == step.index) {
            anyhow::bail!("run {}: step {} already scheduled", run_id, step.index);
        }
        run.steps.push(step);
        Ok(())
    }

    async fn claim_step(
        &self,
        worker_id: &str,
        lease_duration: std::time::Duration,
    ) -> Result<Option<StepClaim>> {
        let now = Utc::now();
        let mut runs = self.runs.lock().unwrap();

        // Oldest runs first so no run starves behind newer work.
        let mut ids: Vec<String> = runs.keys().cloned().collect();
        ids.sort_by_key(|id| runs[id].created);

        for id in ids {
            if let Some(run) = runs.get_mut(&id) {
                if let Some(claim) = try_claim(run, worker_id, now, lease_duration) {
                    return Ok(Some(claim));
                }
            }
        }
        Ok(None)
    }

    async fn report_step(
        &self,
        run_id: &str,
        step_index: usize,
        lease_token: &str,
        report: StepReport,
    ) -> Result<ReportOutcome> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
        apply_report(run, step_index, lease_token, report, Utc::now())
    }

    async fn request_cancel(&self, run_id: &str) -> Result<WorkflowStatus> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
        if run.status() == WorkflowStatus::Running {
            run.cancel_requested = Some(Utc::now());
        }
        Ok(run.status())
    }

    async fn mark_completed(&self, run_id: &str) -> Result<()> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(run_id)
            .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))?;
        if run.status() == WorkflowStatus::Running {
            run.completed = Some(Utc::now());
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        self.runs.lock().unwrap().remove(run_id);
        Ok(())
    }
}
