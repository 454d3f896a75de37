pub mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::activities::ActivityRegistry;
use crate::api::AppState;
use crate::engine::types::{StepStatus, WorkflowStatus};
use crate::engine::{ChapterWorkflow, Worker, WorkerConfig, WorkflowClient, WorkflowError};
use crate::storage::RunStore;
use crate::storage::json_store::JsonRunStore;
use config::ChapterFlowConfig;

#[derive(Parser)]
#[command(name = "chapterflow", version, about = "Durable chapter-processing workflow orchestrator")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to a chapterflow.yaml config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a chapter-processing run and wait for it to finish
    Run {
        /// Book identifier
        #[arg(long)]
        book_id: String,

        /// Chapter identifier within the book
        #[arg(long)]
        chapter_id: String,

        /// Start a fresh, explicitly versioned run even if one exists
        #[arg(long)]
        force_new: bool,

        /// Run an embedded worker instead of relying on external workers
        #[arg(long)]
        local: bool,

        /// Only trigger the run; do not wait for a terminal state
        #[arg(long)]
        detach: bool,

        /// Run store directory
        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// Book library directory (content store root)
        #[arg(long, default_value = "library", env = "CHAPTERFLOW_LIBRARY_DIR")]
        library: PathBuf,
    },

    /// Run a long-lived worker that polls the store and executes steps
    Worker {
        /// Steps to execute concurrently (default: CPU count)
        #[arg(long, env = "CHAPTERFLOW_MAX_CONCURRENT_STEPS")]
        concurrency: Option<usize>,

        /// Run store directory
        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// Book library directory (content store root)
        #[arg(long, default_value = "library", env = "CHAPTERFLOW_LIBRARY_DIR")]
        library: PathBuf,
    },

    /// Show the status of a run
    Status {
        run_id: String,

        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,
    },

    /// Cancel a run: in-flight steps finish, nothing new is scheduled
    Cancel {
        run_id: String,

        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,
    },

    /// List runs
    List {
        /// Filter by status (running, completed, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Dump a run's full record as JSON
    Inspect {
        run_id: String,

        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,
    },

    /// List available activities
    Activities,

    /// Start the HTTP trigger surface
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0", env = "HOST")]
        host: String,

        /// Port to listen on
        #[arg(short, long, default_value = "3000", env = "PORT")]
        port: u16,

        #[arg(long, default_value = "data/runs", env = "CHAPTERFLOW_STORE_DIR")]
        store_dir: PathBuf,

        /// Maximum request body size in bytes
        #[arg(long, default_value = "1048576", env = "MAX_BODY")]
        max_body: usize,
    },
}

pub async fn run_cli() -> Result<ExitCode> {
    let cli = Cli::parse();

    load_dotenv(cli.dotenv.as_deref());
    let config = ChapterFlowConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            book_id,
            chapter_id,
            force_new,
            local,
            detach,
            store_dir,
            library,
        } => {
            cmd_run(
                &config, book_id, chapter_id, force_new, local, detach, store_dir, library,
            )
            .await
        }
        Commands::Worker {
            concurrency,
            store_dir,
            library,
        } => cmd_worker(&config, concurrency, store_dir, library).await,
        Commands::Status { run_id, store_dir } => cmd_status(&config, run_id, store_dir).await,
        Commands::Cancel { run_id, store_dir } => cmd_cancel(&config, run_id, store_dir).await,
        Commands::List {
            status,
            store_dir,
            format,
        } => cmd_list(status, store_dir, format).await,
        Commands::Inspect { run_id, store_dir } => cmd_inspect(run_id, store_dir).await,
        Commands::Activities => cmd_activities(),
        Commands::Serve {
            host,
            port,
            store_dir,
            max_body,
        } => cmd_serve(&config, host, port, store_dir, max_body).await,
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory.
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {
                // No .env file found; silently skip.
            }
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

fn workflow_from(config: &ChapterFlowConfig) -> Arc<ChapterWorkflow> {
    Arc::new(ChapterWorkflow::new(
        config.lines_per_chunk.unwrap_or(20),
        config.tokens_per_chunk.unwrap_or(500),
        config.retry.clone().unwrap_or_default(),
    ))
}

fn worker_config_from(
    config: &ChapterFlowConfig,
    concurrency: Option<usize>,
    library: PathBuf,
) -> WorkerConfig {
    let mut wc = WorkerConfig {
        library_dir: library,
        ..WorkerConfig::default()
    };
    if let Some(n) = concurrency.or(config.worker_concurrency) {
        wc.concurrency = n.max(1);
    }
    if let Some(ms) = config.poll_interval_ms {
        wc.poll_interval = Duration::from_millis(ms);
    }
    if let Some(s) = config.lease_s {
        wc.lease_duration = Duration::from_secs(s);
    }
    wc
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    config: &ChapterFlowConfig,
    book_id: String,
    chapter_id: String,
    force_new: bool,
    local: bool,
    detach: bool,
    store_dir: PathBuf,
    library: PathBuf,
) -> Result<ExitCode> {
    let store: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(store_dir));
    let workflow = workflow_from(config);
    let client = WorkflowClient::new(store.clone(), workflow.clone());

    let run_id = match client.start(&book_id, &chapter_id, force_new).await {
        Ok(receipt) => {
            if receipt.deduplicated {
                println!("Attached to existing run: {}", receipt.run_id);
            } else {
                println!("Run started: {}", receipt.run_id);
            }
            receipt.run_id
        }
        Err(WorkflowError::AlreadyRunning { run_id }) => {
            println!("Already running: {}", run_id);
            run_id
        }
        Err(e) => return Err(e.into()),
    };

    if detach {
        return Ok(ExitCode::SUCCESS);
    }

    // Embedded worker for single-binary runs; otherwise an external
    // `chapterflow worker` is expected to pick the steps up.
    let worker_handle = if local {
        let registry = Arc::new(ActivityRegistry::with_builtins());
        let worker = Arc::new(Worker::new(
            registry,
            store.clone(),
            workflow.clone(),
            worker_config_from(config, None, library),
        ));
        Some(tokio::spawn(worker.run()))
    } else {
        None
    };

    let stall_after = Duration::from_secs(config.stall_after_s.unwrap_or(30));
    let run = client
        .wait_until_terminal(&run_id, Duration::from_millis(250), stall_after)
        .await?;

    if let Some(handle) = worker_handle {
        handle.abort();
    }

    let status = run.status();
    println!("\nRun ID: {}", run.run_id);
    println!("Status: {}", status);

    println!("\nSteps:");
    for step in &run.steps {
        let status_icon = match step.status {
            StepStatus::Succeeded => "✓",
            StepStatus::Failed => "✗",
            StepStatus::Running => "⟳",
            StepStatus::Retrying => "↻",
            StepStatus::Pending => "○",
        };
        println!(
            "  {} {} [{}] (attempts: {})",
            status_icon,
            step.index,
            step.activity,
            step.attempts.len()
        );
        if let Some(ref err) = step.error {
            println!("    Error: {}", err);
        }
    }

    if let Some(ref failure) = run.failed {
        let last = failure
            .last_completed_step
            .map(|i| i.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "\nFailed at step {} ({}); last completed step: {}",
            failure.step_index, failure.activity, last
        );
    }

    Ok(match status {
        WorkflowStatus::Completed => ExitCode::SUCCESS,
        WorkflowStatus::Failed => ExitCode::from(1),
        _ => ExitCode::from(2),
    })
}

async fn cmd_worker(
    config: &ChapterFlowConfig,
    concurrency: Option<usize>,
    store_dir: PathBuf,
    library: PathBuf,
) -> Result<ExitCode> {
    let store: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(store_dir));
    let registry = Arc::new(ActivityRegistry::with_builtins());
    let workflow = workflow_from(config);
    let worker = Arc::new(Worker::new(
        registry,
        store,
        workflow,
        worker_config_from(config, concurrency, library),
    ));

    println!("Worker {} started (ctrl-c to stop)", worker.worker_id());

    tokio::select! {
        result = worker.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            // In-flight leases simply expire; another worker re-claims them.
            info!("Shutdown requested");
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_status(
    config: &ChapterFlowConfig,
    run_id: String,
    store_dir: PathBuf,
) -> Result<ExitCode> {
    let store: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(store_dir));
    let client = WorkflowClient::new(store, workflow_from(config));

    let stall_after = Duration::from_secs(config.stall_after_s.unwrap_or(30));
    let report = client.report(&run_id, stall_after).await?;

    println!("Run ID: {}", run_id);
    println!("Status: {}", report.status);
    match report.last_completed_step {
        Some(i) => println!("Last completed step: {}", i),
        None => println!("Last completed step: none"),
    }
    if let Some(diag) = report.stall_diagnostic {
        println!("Warning: {}", diag);
    }
    if let Some(ref failure) = report.run.failed {
        println!(
            "Failure: step {} ({}): {}",
            failure.step_index, failure.activity, failure.error
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn cmd_cancel(
    config: &ChapterFlowConfig,
    run_id: String,
    store_dir: PathBuf,
) -> Result<ExitCode> {
    let store: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(store_dir));
    let client = WorkflowClient::new(store, workflow_from(config));

    let status = client.cancel(&run_id).await?;
    println!("Run {} is now {}", run_id, status);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_list(
    status_filter: Option<String>,
    store_dir: PathBuf,
    format: String,
) -> Result<ExitCode> {
    let store = JsonRunStore::new(store_dir);

    let status: Option<WorkflowStatus> = status_filter
        .as_deref()
        .map(str::parse)
        .transpose()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let runs = store.list_runs(status).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(ExitCode::SUCCESS);
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:<44} {:<14} {:<14} {:<10} {:<24}",
        "RUN ID", "BOOK", "CHAPTER", "STATUS", "CREATED"
    );
    println!("{}", "-".repeat(108));

    for run in &runs {
        println!(
            "{:<44} {:<14} {:<14} {:<10} {:<24}",
            run.run_id,
            run.book_id,
            run.chapter_id,
            run.status().to_string(),
            run.created.format("%Y-%m-%d %H:%M:%S").to_string(),
        );
    }

    println!("\nTotal: {} run(s)", runs.len());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_inspect(run_id: String, store_dir: PathBuf) -> Result<ExitCode> {
    let store = JsonRunStore::new(store_dir);

    let run = store
        .get_run(&run_id)
        .await?
        .with_context(|| format!("Run '{}' not found", run_id))?;

    let mut view = serde_json::to_value(&run)?;
    if let Some(map) = view.as_object_mut() {
        map.insert("status".to_string(), serde_json::to_value(run.status())?);
    }
    println!("{}", serde_json::to_string_pretty(&view)?);

    Ok(ExitCode::SUCCESS)
}

fn cmd_activities() -> Result<ExitCode> {
    let registry = ActivityRegistry::with_builtins();
    let activities = registry.list();

    println!("{:<20} DESCRIPTION", "ACTIVITY");
    println!("{}", "-".repeat(60));

    for (name, desc) in &activities {
        println!("{:<20} {}", name, desc);
    }

    println!("\nTotal: {} activity(ies)", activities.len());
    Ok(ExitCode::SUCCESS)
}

async fn cmd_serve(
    config: &ChapterFlowConfig,
    host: String,
    port: u16,
    store_dir: PathBuf,
    max_body: usize,
) -> Result<ExitCode> {
    let host = config.host.clone().unwrap_or(host);
    let port = config.port.unwrap_or(port);
    let max_body = config.max_body.unwrap_or(max_body);
    let store_dir = config
        .store_dir
        .clone()
        .map(PathBuf::from)
        .unwrap_or(store_dir);

    let store: Arc<dyn RunStore> = Arc::new(JsonRunStore::new(store_dir));
    let workflow = workflow_from(config);
    let state = Arc::new(AppState {
        client: WorkflowClient::new(store.clone(), workflow),
        store,
        registry: Arc::new(ActivityRegistry::with_builtins()),
    });

    crate::api::serve(&host, port, state, max_body).await?;
    Ok(ExitCode::SUCCESS)
}
