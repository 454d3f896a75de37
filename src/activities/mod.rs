pub mod builtin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// How an activity failure should be treated by the orchestrator. Activities
/// classify their own errors; the workflow only ever sees the classification,
/// which keeps replay deterministic.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// Worth retrying: network trouble, busy resources, timeouts.
    #[error("transient activity error: {0:#}")]
    Transient(anyhow::Error),

    /// Retrying cannot help: bad identifiers, malformed input.
    #[error("permanent activity error: {0:#}")]
    Permanent(anyhow::Error),
}

impl ActivityError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        ActivityError::Transient(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        ActivityError::Permanent(err.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, ActivityError::Permanent(_))
    }

    /// Full error chain as recorded in the run history.
    pub fn message(&self) -> String {
        match self {
            ActivityError::Transient(e) | ActivityError::Permanent(e) => format!("{:#}", e),
        }
    }
}

/// Per-claim execution context. The `effect_key` is stable across retries of
/// the same step, so an activity can de-duplicate its external side effects.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    pub run_id: String,
    pub step_index: usize,
    pub attempt: u32,
    pub effect_key: String,
    /// Root of the content store. Activities are the only code that touches it.
    pub library_dir: PathBuf,
}

/// One unit of externally-effectful chapter work. Implementations must be
/// idempotent or side-effect-safe under retry: the same step may execute more
/// than once after a lease expiry.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Activity name as referenced by workflow plans (e.g. "chunk_chapter").
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn execute(
        &self,
        input: &serde_json::Value,
        ctx: ActivityContext,
    ) -> Result<serde_json::Value, ActivityError>;
}

/// Registry of available activities.
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl Default for ActivityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityRegistry {
    pub fn new() -> Self {
        Self {
            activities: HashMap::new(),
        }
    }

    /// Registry with the built-in chapter pipeline activities.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }

    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.activities.insert(activity.name().to_string(), activity);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }

    /// All registered activities with descriptions, sorted by name.
    pub fn list(&self) -> Vec<(&str, &str)> {
        let mut entries: Vec<(&str, &str)> = self
            .activities
            .values()
            .map(|a| (a.name(), a.description()))
            .collect();
        entries.sort_by_key(|(name, _)| *name);
        entries
    }
}

/// Read a required string field from an activity input payload.
pub(crate) fn require_str<'a>(
    input: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ActivityError> {
    input
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ActivityError::permanent(anyhow::anyhow!("missing input field '{}'", key)))
}
