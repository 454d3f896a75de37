use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::types::RetryPolicy;

/// Configuration loaded from `chapterflow.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ChapterFlowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Directory the run store keeps its journal in.
    pub store_dir: Option<String>,
    /// Root of the book library (the content store).
    pub library_dir: Option<String>,
    pub max_body: Option<usize>,
    /// Steps one worker process executes concurrently.
    pub worker_concurrency: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    /// Seconds a step claim stays exclusive to one worker.
    pub lease_s: Option<u64>,
    /// Seconds an unclaimed due step may sit before a stall warning.
    pub stall_after_s: Option<u64>,
    /// Default per-step retry policy for the chapter workflow.
    pub retry: Option<RetryPolicy>,
    pub lines_per_chunk: Option<usize>,
    pub tokens_per_chunk: Option<usize>,
}

impl ChapterFlowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `chapterflow.yaml` in cwd; return
    ///   defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("chapterflow.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        let config: ChapterFlowConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}
