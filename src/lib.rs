//! ChapterFlow, a durable chapter-processing workflow orchestrator.
//!
//! A run is a journaled pipeline of activities over one (book, chapter)
//! pair. The store is the single source of truth; workers are stateless and
//! lease steps from it, so a crashed worker costs at most one re-execution,
//! never lost progress.

pub mod activities;
pub mod api;
pub mod cli;
pub mod engine;
pub mod storage;
