//! Status aggregation - per-node states, run counters and failure bookkeeping
//!
//! Everything in here is mutated only by the orchestrator's event loop.
//! Producer tasks never touch it; they send immutable events instead.

use super::tree::{NodeId, TaskTree};
use std::fmt;

/// Execution state of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Run-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Processes currently executing
    pub running: usize,
    /// Processes that exited, whatever the outcome
    pub completed: usize,
    /// Processes that failed and were not ignored
    pub failed: usize,
    /// Commands expected to run, from the task tree
    pub total: usize,
}

impl RunStats {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }
}

/// Indexed record of failed nodes, grouped by the step they ran in
#[derive(Debug, Clone, Default)]
pub struct FailureRegistry {
    entries: Vec<(NodeId, NodeId)>,
}

impl FailureRegistry {
    pub fn record(&mut self, step: NodeId, node: NodeId) {
        if !self.contains(node) {
            self.entries.push((step, node));
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.iter().any(|(_, n)| *n == node)
    }

    /// Failed nodes of one step, in failure order
    pub fn for_step(&self, step: NodeId) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|(s, _)| *s == step)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn all(&self) -> Vec<NodeId> {
        self.entries.iter().map(|(_, n)| *n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Run-scoped status context owned by the orchestrator
#[derive(Debug, Clone, Default)]
pub struct StatusAggregator {
    pub stats: RunStats,
    pub failures: FailureRegistry,
    exit_requested: bool,
}

impl StatusAggregator {
    pub fn new(total: usize) -> Self {
        Self {
            stats: RunStats::new(total),
            failures: FailureRegistry::default(),
            exit_requested: false,
        }
    }

    /// A slot is free under the concurrency cap
    pub fn has_free_slot(&self, max_parallel: usize) -> bool {
        self.stats.running < max_parallel
    }

    pub fn mark_started(&mut self) {
        self.stats.running += 1;
    }

    /// Fold a node's terminal state into the run counters.
    ///
    /// Returns true when the failure asks for the run to stop.
    pub fn mark_completed(&mut self, tree: &TaskTree, step: NodeId, id: NodeId) -> bool {
        let node = tree.node(id);
        self.stats.running = self.stats.running.saturating_sub(1);
        self.stats.completed += 1;

        if node.state != NodeState::Failed {
            return false;
        }
        self.stats.failed += 1;
        self.failures.record(step, id);
        if node.spec.stop_on_failure {
            log::warn!(
                "Task {} failed with stop-on-failure set; no further tasks will start",
                node.title()
            );
            self.exit_requested = true;
            return true;
        }
        false
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested
    }

    pub fn request_exit(&mut self) {
        self.exit_requested = true;
    }
}
