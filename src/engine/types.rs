use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Caller-supplied book identifier. Opaque, never generated internally.
pub type BookId = String;

/// Caller-supplied chapter identifier within a book.
pub type ChapterId = String;

/// Derived status of a workflow run: a projection over the run record,
/// never stored as its own field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Running => write!(f, "running"),
            WorkflowStatus::Completed => write!(f, "completed"),
            WorkflowStatus::Failed => write!(f, "failed"),
            WorkflowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowStatus::Running),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            _ => Err(format!(
                "Invalid status '{}'. Use: running, completed, failed, cancelled",
                s
            )),
        }
    }
}

/// Status of an individual step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    /// Failed transiently, waiting out its backoff before the next claim.
    Retrying,
    Succeeded,
    Failed,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Retrying => write!(f, "retrying"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
        }
    }
}

/// How one attempt at a step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum AttemptOutcome {
    Succeeded,
    TransientError(String),
    PermanentError(String),
    /// The worker's lease expired without a report. Unknown outcome, never
    /// counted against the retry budget.
    Lost,
}

/// One recorded execution attempt of a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub number: u32,
    pub worker_id: String,
    pub claimed: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<AttemptOutcome>,
}

/// Retry configuration for a step, snapshotted into the step at schedule time
/// so replay sees the policy the step was scheduled with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum executions of the step (first try included).
    pub max_attempts: u32,
    /// Initial backoff in seconds, doubling after each transient failure.
    pub initial_backoff_s: f64,
    /// Upper bound on a single backoff delay.
    pub max_backoff_s: f64,
    /// Optional cap on total elapsed time since the step's first claim.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_elapsed_s: Option<f64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_s: 1.0,
            max_backoff_s: 60.0,
            max_elapsed_s: None,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `next_attempt` (1-based), capped.
    pub fn backoff_for(&self, next_attempt: u32) -> std::time::Duration {
        let exp = next_attempt.saturating_sub(2).min(30);
        let delay = (self.initial_backoff_s * 2.0_f64.powi(exp as i32)).min(self.max_backoff_s);
        std::time::Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Exclusive, time-bounded claim a worker holds on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub worker_id: String,
    pub token: String,
    pub expires: DateTime<Utc>,
}

/// One scheduled unit of work within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub index: usize,
    pub activity: String,
    pub input: serde_json::Value,
    pub status: StepStatus,
    pub scheduled: DateTime<Utc>,
    pub retry: RetryPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<AttemptRecord>,
    /// Earliest time the step may be claimed (backoff deadline).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepState {
    pub fn new(index: usize, activity: &str, input: serde_json::Value, retry: RetryPolicy) -> Self {
        Self {
            index,
            activity: activity.to_string(),
            input,
            status: StepStatus::Pending,
            scheduled: Utc::now(),
            retry,
            timeout_s: None,
            attempts: Vec::new(),
            not_before: None,
            lease: None,
            result: None,
            error: None,
        }
    }

    /// Attempts that executed and reported a real transient failure.
    /// Lost attempts (expired lease, unknown outcome) do not count.
    pub fn transient_failures(&self) -> u32 {
        self.attempts
            .iter()
            .filter(|a| matches!(a.outcome, Some(AttemptOutcome::TransientError(_))))
            .count() as u32
    }

    pub fn first_claimed(&self) -> Option<DateTime<Utc>> {
        self.attempts.first().map(|a| a.claimed)
    }
}

/// Why a run stopped, kept alongside the step record so a human can see
/// where processing halted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureInfo {
    pub step_index: usize,
    pub activity: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_completed_step: Option<usize>,
    pub at: DateTime<Utc>,
}

/// One durable execution instance for a (BookId, ChapterId) pair.
///
/// The record is append-only: steps and attempts are added, past entries are
/// never rewritten. `status()` is the only way to read the run's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub book_id: BookId,
    pub chapter_id: ChapterId,
    pub workflow: String,
    pub created: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<StepState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<FailureInfo>,
}

impl WorkflowRun {
    pub fn new(run_id: &str, book_id: &str, chapter_id: &str, workflow: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            book_id: book_id.to_string(),
            chapter_id: chapter_id.to_string(),
            workflow: workflow.to_string(),
            created: Utc::now(),
            steps: Vec::new(),
            cancel_requested: None,
            completed: None,
            failed: None,
        }
    }

    /// Derived status projection. Completion and failure are recorded events;
    /// a cancel request makes the run terminal for scheduling purposes.
    pub fn status(&self) -> WorkflowStatus {
        if self.completed.is_some() {
            WorkflowStatus::Completed
        } else if self.failed.is_some() {
            WorkflowStatus::Failed
        } else if self.cancel_requested.is_some() {
            WorkflowStatus::Cancelled
        } else {
            WorkflowStatus::Running
        }
    }

    /// Index of the last step that succeeded, if any.
    pub fn last_completed_step(&self) -> Option<usize> {
        self.steps
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.index)
    }

    /// Number of steps that have succeeded so far.
    pub fn succeeded_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count()
    }
}

/// Deterministic run identifier for a (book, chapter) key.
///
/// Human-readable slug plus a short content hash so distinct raw identifiers
/// never collide after slugging. Re-submitting the same pair always yields the
/// same id, which is what makes `start` idempotent at the store level.
pub fn run_id_for(book_id: &str, chapter_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(book_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(chapter_id.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}--{}-{}", slug(book_id), slug(chapter_id), &digest[..8])
}

/// Run id for an explicitly versioned fresh run of the same key.
pub fn versioned_run_id(base: &str, version: u32) -> String {
    format!("{}--v{}", base, version)
}

/// Version for the next forced fresh run: one past the highest version among
/// the surviving runs of the key. The bare base id counts as v1, so deleting
/// an intermediate version leaves a gap instead of shifting later versions
/// onto ids that still exist.
pub fn next_version(base: &str, existing: &[WorkflowRun]) -> u32 {
    existing
        .iter()
        .map(|run| {
            run.run_id
                .strip_prefix(base)
                .and_then(|rest| rest.strip_prefix("--v"))
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(1)
        })
        .max()
        .unwrap_or(0)
        + 1
}

/// Idempotency key an activity can use to de-duplicate its external side
/// effects across re-executions of the same step.
pub fn effect_key(run_id: &str, step_index: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(step_index.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn slug(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
