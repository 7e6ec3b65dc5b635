//! Core engine - task tree, process lifecycle, scheduling and estimation

pub mod estimate;
pub mod executor;
pub mod lines;
pub mod process;
pub mod scheduler;
pub mod status;
pub mod tree;

pub use estimate::{Eta, RuntimeEstimator};
pub use executor::{Launch, Launched, LatestLine, Stream, TaskEvent};
pub use process::{ShellCommand, ShellProcess, Terminator};
pub use scheduler::{Orchestrator, RunOptions, RunReport};
pub use status::{FailureRegistry, NodeState, RunStats, StatusAggregator};
pub use tree::{Branch, Executable, NodeId, TaskNode, TaskSpec, TaskTree};
