//! Taskline - terminal task runner
//!
//! Runs a declared tree of shell commands: sequential steps, each possibly
//! a parallel group, under a concurrency cap, while drawing live progress,
//! estimating completion time and aggregating pass/fail outcomes.

pub mod config;
pub mod core;
pub mod error;
pub mod history;
pub mod tasklog;
pub mod ui;

// Re-exports
pub use config::Config;
pub use core::{
    NodeId, NodeState, Orchestrator, RunOptions, RunReport, RuntimeEstimator, TaskSpec, TaskTree,
};
pub use error::{ConfigError, ProcessError};
pub use history::{DurationCache, DurationStore};
pub use tasklog::TaskLogger;

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
