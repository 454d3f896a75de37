use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::engine::types::*;
use crate::storage::{
    CreateOutcome, ReportOutcome, RunStore, StepClaim, StepReport, apply_report, try_claim,
};

/// File-based run store. Each run is one JSON file; writes go through a
/// tmp-file rename so a crash never leaves a half-written record. A
/// process-wide lock serializes mutations, so this store is safe for a
/// single process only: multiple worker processes over the same directory
/// would interleave read-modify-write cycles. Multi-process deployments need
/// an external backend or file locking.
pub struct JsonRunStore {
    base_dir: PathBuf,
    lock: RwLock<()>,
}

impl JsonRunStore {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            lock: RwLock::new(()),
        }
    }

    fn run_path(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", run_id))
    }

    async fn read_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let path = self.run_path(run_id);
        let data = match tokio::fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read run file: {}", path.display()));
            }
        };
        let run: WorkflowRun = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse run: {}", run_id))?;
        Ok(Some(run))
    }

    async fn require_run(&self, run_id: &str) -> Result<WorkflowRun> {
        self.read_run(run_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("run not found: {}", run_id))
    }

    async fn write_run(&self, run: &WorkflowRun) -> Result<()> {
        let path = self.run_path(&run.run_id);
        let tmp_path = path.with_extension("json.tmp");

        let data = serde_json::to_string_pretty(run)?;
        tokio::fs::write(&tmp_path, &data).await?;
        tokio::fs::rename(&tmp_path, &path).await?;

        Ok(())
    }

    async fn read_all(&self) -> Result<Vec<WorkflowRun>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.base_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(data) = tokio::fs::read_to_string(&path).await {
                if let Ok(run) = serde_json::from_str::<WorkflowRun>(&data) {
                    runs.push(run);
                }
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunStore for JsonRunStore {
    async fn create_run(&self, run: &WorkflowRun) -> Result<CreateOutcome> {
        let _lock = self.lock.write().await;

        if let Some(existing) = self.read_run(&run.run_id).await? {
            return Ok(CreateOutcome::AlreadyExists(existing));
        }

        tokio::fs::create_dir_all(&self.base_dir).await?;
        self.write_run(run).await?;
        Ok(CreateOutcome::Created)
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let _lock = self.lock.read().await;
        self.read_run(run_id).await
    }

    async fn find_runs_for_key(
        &self,
        book_id: &str,
        chapter_id: &str,
    ) -> Result<Vec<WorkflowRun>> {
        let _lock = self.lock.read().await;
        let mut runs: Vec<WorkflowRun> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| r.book_id == book_id && r.chapter_id == chapter_id)
            .collect();
        runs.sort_by(|a, b| a.created.cmp(&b.created).then(a.run_id.cmp(&b.run_id)));
        Ok(runs)
    }

    async fn list_runs(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowRun>> {
        let _lock = self.lock.read().await;
        let mut runs: Vec<WorkflowRun> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| status.is_none_or(|s| r.status() == s))
            .collect();
        // Newest first.
        runs.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(runs)
    }

    async fn schedule_step(&self, run_id: &str, step: StepState) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut run = self.require_run(run_id).await?;
        if run.steps.iter().any(|s| s.index == step.index) {
            anyhow::bail!("run {}: step {} already scheduled", run_id, step.index);
        }
        run.steps.push(step);
        self.write_run(&run).await
    }

    async fn claim_step(
        &self,
        worker_id: &str,
        lease_duration: std::time::Duration,
    ) -> Result<Option<StepClaim>> {
        let _lock = self.lock.write().await;
        let now = Utc::now();

        let mut runs = self.read_all().await?;
        runs.sort_by(|a, b| a.created.cmp(&b.created));

        for mut run in runs {
            if let Some(claim) = try_claim(&mut run, worker_id, now, lease_duration) {
                self.write_run(&run).await?;
                return Ok(Some(claim));
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
        let _lock = self.lock.write().await;
        let mut run = self.require_run(run_id).await?;
        let outcome = apply_report(&mut run, step_index, lease_token, report, Utc::now())?;
        if outcome == ReportOutcome::Recorded {
            self.write_run(&run).await?;
        }
        Ok(outcome)
    }

    async fn request_cancel(&self, run_id: &str) -> Result<WorkflowStatus> {
        let _lock = self.lock.write().await;
        let mut run = self.require_run(run_id).await?;
        if run.status() == WorkflowStatus::Running {
            run.cancel_requested = Some(Utc::now());
            self.write_run(&run).await?;
        }
        Ok(run.status())
    }

    async fn mark_completed(&self, run_id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let mut run = self.require_run(run_id).await?;
        if run.status() == WorkflowStatus::Running {
            run.completed = Some(Utc::now());
            self.write_run(&run).await?;
        }
        Ok(())
    }

    async fn delete_run(&self, run_id: &str) -> Result<()> {
        let _lock = self.lock.write().await;
        let path = self.run_path(run_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}
