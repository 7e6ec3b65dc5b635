//! Task tree - the runtime model built from user task specs

use super::executor::LatestLine;
use super::process::{Terminator, KILLED_EXIT_CODE};
use super::status::NodeState;
use crate::history::DurationStore;
use crate::tasklog::LogHandle;
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Width at which unnamed tasks have their command text shortened
const TITLE_WIDTH: usize = 25;

/// Stable identifier of a node inside a [`TaskTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Executable {
    /// Shell command text
    Command(String),
    /// Reference to a remote executable; `command` may embed the
    /// placeholder token which is replaced with the reference
    Remote { url: String, command: Option<String> },
}

/// Immutable description of one task, as handed over by the config layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    pub name: String,
    pub exec: Option<Executable>,
    pub sudo: bool,
    pub ignore_failure: bool,
    pub stop_on_failure: bool,
    pub event_driven: bool,
    pub show_output: bool,
    pub collapse_on_completion: bool,
    pub children: Vec<TaskSpec>,
}

impl Default for TaskSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            exec: None,
            sudo: false,
            ignore_failure: false,
            stop_on_failure: false,
            event_driven: true,
            show_output: true,
            collapse_on_completion: false,
            children: Vec::new(),
        }
    }
}

impl TaskSpec {
    /// A leaf running a shell command
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exec: Some(Executable::Command(command.into())),
            ..Self::default()
        }
    }

    /// A pure container of parallel children
    pub fn group(name: impl Into<String>, children: Vec<TaskSpec>) -> Self {
        Self {
            name: name.into(),
            children,
            ..Self::default()
        }
    }

    pub fn with_children(mut self, children: Vec<TaskSpec>) -> Self {
        self.children = children;
        self
    }

    pub fn ignore_failure(mut self, value: bool) -> Self {
        self.ignore_failure = value;
        self
    }

    pub fn stop_on_failure(mut self, value: bool) -> Self {
        self.stop_on_failure = value;
        self
    }

    pub fn event_driven(mut self, value: bool) -> Self {
        self.event_driven = value;
        self
    }

    pub fn show_output(mut self, value: bool) -> Self {
        self.show_output = value;
        self
    }

    pub fn collapse_on_completion(mut self, value: bool) -> Self {
        self.collapse_on_completion = value;
        self
    }

    /// Resolve the text actually handed to the shell.
    ///
    /// A remote reference replaces every occurrence of `placeholder` in the
    /// command; without a command the reference itself is run.
    pub fn command_text(&self, placeholder: &str) -> Option<String> {
        match &self.exec {
            None => None,
            Some(Executable::Command(cmd)) if cmd.trim().is_empty() => None,
            Some(Executable::Command(cmd)) => Some(cmd.clone()),
            Some(Executable::Remote { url, command }) => {
                let template = match command {
                    Some(cmd) if !cmd.trim().is_empty() => cmd.as_str(),
                    _ => placeholder,
                };
                if placeholder.is_empty() {
                    Some(template.to_string())
                } else {
                    Some(template.replace(placeholder, url))
                }
            }
        }
    }
}

/// Where a line sits inside its step frame, used for the tree glyphs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    /// Top-level step line
    Root,
    /// Child line with more siblings below
    Middle,
    /// Last child line of its group
    Last,
}

/// Runtime node: one task spec plus everything tracked while it runs
#[derive(Debug)]
pub struct TaskNode {
    pub id: NodeId,
    pub spec: TaskSpec,
    /// Resolved shell text; `None` for pure containers
    pub command: Option<String>,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Row inside the step frame, `None` for containers shown as a header
    pub row: Option<usize>,
    pub branch: Branch,
    pub state: NodeState,
    pub started_at: Option<Instant>,
    pub stopped_at: Option<Instant>,
    pub exit_code: Option<i32>,
    /// Historical duration of this exact command, if any
    pub estimate: Option<Duration>,
    pub stderr: String,
    /// Latest output line shown next to the title
    pub message: LatestLine,
    /// Index of the next child to start; only ever moves forward
    pub next_child: usize,
    /// Participates in the sequential environment chain
    pub primary: bool,
    pub(crate) terminator: Option<Terminator>,
    pub(crate) log: Option<LogHandle>,
    pub(crate) latest: Option<watch::Receiver<LatestLine>>,
}

impl TaskNode {
    fn new(id: NodeId, mut spec: TaskSpec, parent: Option<NodeId>, placeholder: &str) -> Self {
        spec.children = Vec::new();
        let command = spec.command_text(placeholder);
        Self {
            id,
            spec,
            command,
            parent,
            children: Vec::new(),
            row: None,
            branch: Branch::Root,
            state: NodeState::Pending,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            estimate: None,
            stderr: String::new(),
            message: None,
            next_child: 0,
            primary: false,
            terminator: None,
            log: None,
            latest: None,
        }
    }

    /// Display name: the configured name, or the (shortened) command
    pub fn title(&self) -> String {
        if !self.spec.name.is_empty() {
            return self.spec.name.clone();
        }
        let command = self.command.as_deref().unwrap_or_default();
        if command.chars().count() > TITLE_WIDTH {
            let head: String = command.chars().take(TITLE_WIDTH - 3).collect();
            format!("{}...", head)
        } else {
            command.to_string()
        }
    }

    pub fn has_command(&self) -> bool {
        self.command.is_some()
    }

    pub fn is_started(&self) -> bool {
        self.state != NodeState::Pending
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_terminal()
    }

    /// Own command may still be launched
    pub fn can_start(&self) -> bool {
        self.has_command() && !self.is_started()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => now.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }

    /// Record a forced termination by SIGKILL; always a failure.
    pub fn terminated(&mut self, stopped_at: Instant) -> NodeState {
        self.complete(KILLED_EXIT_CODE, stopped_at);
        self.state = NodeState::Failed;
        self.state
    }

    /// Record the exit of this node's process.
    ///
    /// Closes the node's log channel and returns the new state; a nonzero
    /// exit counts as success when failures are ignored.
    pub fn complete(&mut self, exit_code: i32, stopped_at: Instant) -> NodeState {
        self.exit_code = Some(exit_code);
        self.stopped_at = Some(stopped_at);
        self.terminator = None;
        self.latest = None;
        self.log.take();
        self.state = if exit_code == 0 || self.spec.ignore_failure {
            NodeState::Succeeded
        } else {
            NodeState::Failed
        };
        self.state
    }
}

/// Arena of task nodes; roots are the sequential steps of a run
#[derive(Debug, Default)]
pub struct TaskTree {
    nodes: Vec<TaskNode>,
    roots: Vec<NodeId>,
    expected: usize,
}

impl TaskTree {
    /// Build the runtime tree depth-first, assigning frame rows and
    /// looking up historical durations for every command.
    pub fn build(specs: Vec<TaskSpec>, placeholder: &str, history: &impl DurationStore) -> Self {
        let mut tree = Self::default();
        for spec in specs {
            let root = tree.insert(spec, None, placeholder, history);
            tree.node_mut(root).primary = true;
            tree.assign_rows(root);
            tree.roots.push(root);
        }
        log::debug!(
            "Built task tree: {} nodes, {} steps, {} commands",
            tree.nodes.len(),
            tree.roots.len(),
            tree.expected
        );
        tree
    }

    fn insert(
        &mut self,
        mut spec: TaskSpec,
        parent: Option<NodeId>,
        placeholder: &str,
        history: &impl DurationStore,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let children = std::mem::take(&mut spec.children);
        let mut node = TaskNode::new(id, spec, parent, placeholder);
        if let Some(command) = &node.command {
            node.estimate = history.lookup(command);
            self.expected += 1;
        }
        self.nodes.push(node);

        let mut child_ids = Vec::with_capacity(children.len());
        for child in children {
            child_ids.push(self.insert(child, Some(id), placeholder, history));
        }
        if let Some(last) = child_ids.last().copied() {
            for child in &child_ids {
                self.node_mut(*child).branch = if *child == last {
                    Branch::Last
                } else {
                    Branch::Middle
                };
            }
        }
        self.node_mut(id).children = child_ids;
        id
    }

    fn assign_rows(&mut self, root: NodeId) {
        let mut next_row = 0;
        for id in self.walk(root) {
            let node = self.node_mut(id);
            if id == root && !node.has_command() {
                continue;
            }
            node.row = Some(next_row);
            next_row += 1;
        }
    }

    pub fn node(&self, id: NodeId) -> &TaskNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut TaskNode {
        &mut self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&TaskNode> {
        self.nodes.get(id.0)
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Number of nodes that carry their own command
    pub fn expected_commands(&self) -> usize {
        self.expected
    }

    /// Depth-first, declared-order listing of a subtree (including `id`)
    pub fn walk(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.node(current).children.iter().rev().copied());
        }
        out
    }

    /// Number of rows a step frame needs
    pub fn frame_rows(&self, root: NodeId) -> usize {
        self.walk(root)
            .into_iter()
            .filter(|id| self.node(*id).row.is_some())
            .count()
    }

    /// True once the node's own command and every descendant were started
    pub fn fully_started(&self, id: NodeId) -> bool {
        let node = self.node(id);
        (!node.has_command() || node.is_started())
            && node.next_child >= node.children.len()
            && node.children.iter().all(|child| self.fully_started(*child))
    }

    /// Nodes in the subtree whose process is currently running
    pub fn running(&self, id: NodeId) -> Vec<NodeId> {
        self.walk(id)
            .into_iter()
            .filter(|n| self.node(*n).state == NodeState::Running)
            .collect()
    }

    /// Forcefully stop the node's own process group and every running
    /// descendant. Nodes never started or already complete are untouched.
    pub fn kill(&self, id: NodeId) -> Vec<NodeId> {
        let mut killed = Vec::new();
        for current in self.walk(id) {
            let node = self.node(current);
            if !node.is_started() || node.is_complete() {
                continue;
            }
            // a failed launch leaves no process group behind
            let Some(terminator) = node.terminator.as_ref().filter(|t| t.pgid().is_some()) else {
                continue;
            };
            match terminator.terminate() {
                Ok(()) => {
                    log::info!("Killed task {} ({})", node.title(), current);
                    killed.push(current);
                }
                Err(e) => log::warn!("Failed to kill task {}: {}", node.title(), e),
            }
        }
        killed
    }
}
