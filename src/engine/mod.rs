pub mod client;
pub mod error;
pub mod types;
pub mod worker;
pub mod workflow;

pub use client::{RunReport, StartReceipt, WorkflowClient};
pub use error::WorkflowError;
pub use worker::{Worker, WorkerConfig};
pub use workflow::{ChapterWorkflow, Decision, WorkflowDefinition};
