//! Orchestrator - bounded-concurrency scheduling and the run event loop
//!
//! Steps (the tree roots) run one after another. Inside a step the
//! orchestrator starts work whenever a slot frees up and is the only
//! writer of run state: node states, counters, the environment chain and
//! the duration history all change here and nowhere else.

use super::estimate::{format_duration, RuntimeEstimator};
use super::executor::{self, Launch, Stream, TaskEvent};
use super::process::ShellCommand;
use super::status::{NodeState, RunStats, StatusAggregator};
use super::tree::{Branch, NodeId, TaskTree};
use crate::history::DurationStore;
use crate::tasklog::TaskLogger;
use crate::ui::{
    format_footer, format_line, FailureReport, FooterStatus, LineStatus, Palette, Renderer,
    Spinner, Tone,
};
use anyhow::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Fastest redraw tick allowed
const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Options the orchestrator runs with
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Concurrency cap P
    pub max_parallel: usize,
    /// Shown in front of completed tasks
    pub bullet: String,
    pub shell: String,
    /// Fed to `sudo -S` for tasks that need it
    pub sudo_password: Option<String>,
    pub show_footer: bool,
    pub show_errors: bool,
    pub show_steps: bool,
    pub show_times: bool,
    pub show_eta: bool,
    pub update_interval: Duration,
    pub palette: Palette,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            bullet: "•".to_string(),
            shell: "sh".to_string(),
            sudo_password: None,
            show_footer: true,
            show_errors: true,
            show_steps: true,
            show_times: true,
            show_eta: true,
            update_interval: Duration::from_millis(150),
            palette: Palette::default(),
        }
    }
}

/// Outcome of a whole run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: RunStats,
    /// Failed, non-ignored nodes in failure order
    pub failures: Vec<FailureReport>,
    /// A stop-on-failure node ended the run early
    pub stopped: bool,
}

impl RunReport {
    pub fn failed(&self) -> usize {
        self.stats.failed
    }

    pub fn success(&self) -> bool {
        self.stats.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drives one run of a task tree
pub struct Orchestrator<R: Renderer, S: DurationStore> {
    tree: TaskTree,
    options: RunOptions,
    renderer: R,
    history: S,
    logger: TaskLogger,
    status: StatusAggregator,
    estimator: RuntimeEstimator,
    /// Environment handed along the chain of sequential steps
    env: HashMap<String, String>,
    spinner: Spinner,
    started: Instant,
    expected: Option<Duration>,
    log_writers: Vec<JoinHandle<()>>,
}

impl<R: Renderer, S: DurationStore> Orchestrator<R, S> {
    pub fn new(tree: TaskTree, options: RunOptions, renderer: R, history: S) -> Self {
        let max_parallel = options.max_parallel.max(1);
        let options = RunOptions {
            max_parallel,
            update_interval: options.update_interval.max(MIN_INTERVAL),
            ..options
        };
        let status = StatusAggregator::new(tree.expected_commands());
        Self {
            tree,
            options,
            renderer,
            history,
            logger: TaskLogger::disabled(),
            status,
            estimator: RuntimeEstimator::new(max_parallel),
            env: HashMap::new(),
            spinner: Spinner::new(),
            started: Instant::now(),
            expected: None,
            log_writers: Vec::new(),
        }
    }

    pub fn with_logger(mut self, logger: TaskLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.status
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn history(&self) -> &S {
        &self.history
    }

    /// Give back the duration history, updated with this run's timings
    pub fn into_history(self) -> S {
        self.history
    }

    /// Kill a node's process group and every running descendant,
    /// returning the nodes that were signalled
    pub fn kill(&self, id: NodeId) -> Vec<NodeId> {
        self.tree.kill(id)
    }

    /// Run every step in order.
    ///
    /// Once a stop-on-failure node fails, remaining steps are skipped and
    /// no straggler is waited for.
    pub async fn run(&mut self) -> Result<RunReport> {
        self.started = Instant::now();
        let expected = self.estimator.total(&self.tree);
        self.expected = (!expected.is_zero()).then_some(expected);
        log::info!(
            "Running {} steps, {} commands, max {} in parallel",
            self.tree.roots().len(),
            self.tree.expected_commands(),
            self.options.max_parallel
        );

        let roots = self.tree.roots().to_vec();
        for (index, root) in roots.iter().enumerate() {
            if self.status.exit_requested() {
                log::info!("Skipping {} remaining steps", roots.len() - index);
                break;
            }
            self.run_step(*root).await?;
        }

        if self.options.show_footer {
            self.renderer.begin_frame(0, false, true)?;
            let footer = self.footer_line();
            self.renderer.draw_footer(&footer)?;
        }

        if !self.status.exit_requested() {
            for writer in self.log_writers.drain(..) {
                if let Err(e) = writer.await {
                    log::warn!("Task log writer failed: {}", e);
                }
            }
        }

        Ok(self.report())
    }

    async fn run_step(&mut self, root: NodeId) -> Result<()> {
        let has_header = !self.tree.node(root).has_command();
        let rows = self.tree.frame_rows(root);
        self.renderer
            .begin_frame(rows, has_header, self.options.show_footer)?;
        for id in self.tree.walk(root) {
            self.draw_node(root, id, None)?;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        self.start_available(root, &tx);

        let mut ticker = tokio::time::interval(self.options.update_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flow = Flow::Continue;
        while self.status.stats.running > 0 {
            tokio::select! {
                _ = ticker.tick() => self.on_tick(root)?,
                event = rx.recv() => match event {
                    Some(event) => {
                        flow = self.on_event(root, event, &tx)?;
                        if flow == Flow::Stop {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }

        let failed = !self.status.failures.for_step(root).is_empty();
        let collapse = flow == Flow::Continue
            && !failed
            && self.tree.node(root).spec.collapse_on_completion
            && !self.tree.node(root).children.is_empty();
        let summary = collapse.then(|| {
            let hidden = rows - usize::from(!has_header);
            format!(" ({} tasks hidden)", hidden)
        });
        self.draw_node(root, root, summary.as_deref())?;
        if self.options.show_footer {
            let footer = self.footer_line();
            self.renderer.draw_footer(&footer)?;
        }
        self.renderer.end_frame(collapse)?;
        Ok(())
    }

    /// Start whatever the concurrency cap allows under `id`.
    ///
    /// The node's own command goes first; its children are only entered
    /// once that command has completed. Children start in declared order
    /// and the cursor over them never moves back.
    fn start_available(&mut self, id: NodeId, events: &mpsc::UnboundedSender<TaskEvent>) {
        if self.status.exit_requested() {
            return;
        }
        if self.tree.node(id).can_start() {
            if !self.status.has_free_slot(self.options.max_parallel) {
                return;
            }
            self.start_node(id, events);
        }
        let node = self.tree.node(id);
        if node.has_command() && !node.is_complete() {
            return;
        }

        // groups passed earlier may still hold unstarted work
        for index in 0..self.tree.node(id).next_child {
            let child = self.tree.node(id).children[index];
            if !self.tree.fully_started(child) {
                self.start_available(child, events);
            }
        }

        loop {
            let node = self.tree.node(id);
            if node.next_child >= node.children.len()
                || !self.status.has_free_slot(self.options.max_parallel)
                || self.status.exit_requested()
            {
                break;
            }
            let child = node.children[node.next_child];
            self.start_available(child, events);
            let child_node = self.tree.node(child);
            if child_node.has_command() && !child_node.is_started() {
                break;
            }
            self.tree.node_mut(id).next_child += 1;
        }
    }

    fn start_node(&mut self, id: NodeId, events: &mpsc::UnboundedSender<TaskEvent>) {
        let width = self.renderer.width();
        let node = self.tree.node(id);
        let Some(command_text) = node.command.clone() else {
            return;
        };
        let name = node.title();
        let primary = node.primary;

        let command = ShellCommand::new(command_text, self.options.shell.clone())
            .with_sudo(node.spec.sudo, self.options.sudo_password.clone())
            .with_env(primary.then(|| self.env.clone()));

        let log = self.logger.open(id.0, &name).map(|(handle, writer)| {
            self.log_writers.push(writer);
            handle
        });

        let launched = executor::launch(
            Launch {
                id,
                name,
                command,
                event_driven: node.spec.event_driven,
                harvest_env: primary,
                max_line: width * 2,
                log: log.clone(),
            },
            events.clone(),
        );

        let node = self.tree.node_mut(id);
        node.terminator = Some(launched.terminator);
        node.latest = launched.latest;
        node.log = log;
        node.started_at = Some(Instant::now());
        node.state = NodeState::Running;
        self.status.mark_started();
    }

    fn on_event(
        &mut self,
        root: NodeId,
        event: TaskEvent,
        events: &mpsc::UnboundedSender<TaskEvent>,
    ) -> Result<Flow> {
        let id = event.id();
        match event {
            TaskEvent::Started { .. } => {}
            TaskEvent::Output { stream, line, .. } => {
                let node = self.tree.node_mut(id);
                if node.spec.show_output {
                    node.message = Some((stream, line));
                }
            }
            TaskEvent::Completed {
                exit_code,
                stopped_at,
                stderr,
                env,
                ..
            } => {
                let node = self.tree.node_mut(id);
                if let Some(latest) = node.latest.as_mut() {
                    let line = latest.borrow_and_update().clone();
                    if node.spec.show_output && line.is_some() {
                        node.message = line;
                    }
                }
                let state = node.complete(exit_code, stopped_at);
                node.stderr = stderr;
                if node.primary {
                    if let Some(env) = env {
                        self.env.extend(env);
                    }
                }
                if let (Some(command), Some(start)) = (&node.command, node.started_at) {
                    self.history
                        .store(command, stopped_at.saturating_duration_since(start));
                }
                log::debug!("Task {} finished {} (rc:{})", id, state, exit_code);

                let stop = self.status.mark_completed(&self.tree, root, id);
                self.draw_node(root, id, None)?;
                if stop {
                    // their completions are never read, so finish them here
                    let now = Instant::now();
                    for killed in self.tree.kill(root) {
                        self.tree.node_mut(killed).terminated(now);
                        self.status.mark_completed(&self.tree, root, killed);
                        self.draw_node(root, killed, None)?;
                    }
                    return Ok(Flow::Stop);
                }
                self.start_available(root, events);
                for running in self.tree.running(root) {
                    self.draw_node(root, running, None)?;
                }
                return Ok(Flow::Continue);
            }
        }
        self.draw_node(root, id, None)?;
        Ok(Flow::Continue)
    }

    fn on_tick(&mut self, root: NodeId) -> Result<()> {
        self.spinner.next();
        for id in self.tree.running(root) {
            let node = self.tree.node_mut(id);
            let show = node.spec.show_output;
            if let Some(latest) = node.latest.as_mut() {
                if latest.has_changed().unwrap_or(false) {
                    let line = latest.borrow_and_update().clone();
                    if show && line.is_some() {
                        node.message = line;
                    }
                }
            }
            self.draw_node(root, id, None)?;
        }
        if !self.tree.node(root).has_command() {
            self.draw_node(root, root, None)?;
        }
        if self.options.show_footer {
            let footer = self.footer_line();
            self.renderer.draw_footer(&footer)?;
        }
        Ok(())
    }

    /// Combined state of a pure container
    fn group_state(&self, root: NodeId, id: NodeId) -> NodeState {
        let below = self.tree.walk(id);
        if below
            .iter()
            .any(|n| self.status.failures.for_step(root).contains(n))
        {
            return NodeState::Failed;
        }
        let commands: Vec<_> = below
            .iter()
            .map(|n| self.tree.node(*n))
            .filter(|n| n.has_command())
            .collect();
        if commands.iter().all(|n| n.is_complete()) {
            NodeState::Succeeded
        } else if commands.iter().any(|n| n.is_started()) {
            NodeState::Running
        } else {
            NodeState::Pending
        }
    }

    fn draw_node(&mut self, root: NodeId, id: NodeId, summary: Option<&str>) -> Result<()> {
        let node = self.tree.node(id);
        let is_header = id == root && !node.has_command();
        if node.row.is_none() && !is_header {
            return Ok(());
        }
        let state = if node.has_command() {
            node.state
        } else {
            self.group_state(root, id)
        };

        let message = match (summary, state, node.exit_code) {
            (Some(summary), _, _) => (summary.to_string(), Tone::Plain),
            (None, NodeState::Failed, Some(code)) => {
                (format!("Exited with error ({})", code), Tone::Error)
            }
            _ => match &node.message {
                Some((Stream::Stdout, line)) => (line.clone(), Tone::Output),
                Some((Stream::Stderr, line)) => (line.clone(), Tone::Error),
                None => (String::new(), Tone::Plain),
            },
        };

        let prefix = match state {
            NodeState::Running => self.spinner.current(),
            NodeState::Succeeded | NodeState::Failed => self.options.bullet.as_str(),
            NodeState::Pending => "",
        };

        let now = Instant::now();
        let eta = match state {
            NodeState::Running if self.options.show_eta && node.has_command() => {
                format!("[{}]", self.estimator.current_eta(&self.tree, id, now))
            }
            NodeState::Succeeded | NodeState::Failed if node.has_command() => {
                format_duration(node.elapsed(now))
            }
            _ => String::new(),
        };

        let branch = if id == root { Branch::Root } else { node.branch };
        let title = node.title();
        let line = format_line(
            &LineStatus {
                state,
                title: &title,
                message: &message.0,
                tone: message.1,
                prefix,
                eta: &eta,
                branch,
            },
            &self.options.palette,
            self.renderer.width(),
        );

        match node.row {
            Some(row) => self.renderer.draw_line(row, &line),
            None => self.renderer.draw_header(&line),
        }
    }

    fn footer_line(&self) -> String {
        let status = FooterStatus {
            completed: self.status.stats.completed,
            total: self.status.stats.total,
            failed: self.status.stats.failed,
            elapsed: self.started.elapsed(),
            expected: self.expected,
            show_steps: self.options.show_steps,
            show_errors: self.options.show_errors,
            show_times: self.options.show_times,
        };
        format_footer(&status, &self.options.palette, self.renderer.width())
    }

    fn report(&self) -> RunReport {
        let failures = self
            .status
            .failures
            .all()
            .into_iter()
            .map(|id| {
                let node = self.tree.node(id);
                FailureReport {
                    title: node.title(),
                    command: node.command.clone().unwrap_or_default(),
                    exit_code: node.exit_code.unwrap_or(-1),
                    stderr: node.stderr.clone(),
                }
            })
            .collect();
        RunReport {
            stats: self.status.stats,
            failures,
            stopped: self.status.exit_requested(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::tree::TaskSpec;
    use crate::history::DurationCache;
    use crate::ui::NullRenderer;

    fn orchestrator(specs: Vec<TaskSpec>, max_parallel: usize) -> Orchestrator<NullRenderer, DurationCache> {
        let tree = TaskTree::build(specs, "<exec>", &DurationCache::default());
        let options = RunOptions {
            max_parallel,
            update_interval: Duration::from_millis(20),
            ..RunOptions::default()
        };
        Orchestrator::new(tree, options, NullRenderer::new(), DurationCache::default())
    }

    fn message(orch: &Orchestrator<NullRenderer, DurationCache>, id: NodeId) -> Option<String> {
        orch.tree().node(id).message.as_ref().map(|(_, line)| line.clone())
    }

    #[tokio::test]
    async fn test_first_pass_respects_cap() {
        let children: Vec<_> = (0..5)
            .map(|i| TaskSpec::command(format!("c{}", i), "sleep 0.2"))
            .collect();
        let mut orch = orchestrator(vec![TaskSpec::group("group", children)], 2);
        let root = orch.tree().roots()[0];
        let (tx, _rx) = mpsc::unbounded_channel();

        orch.start_available(root, &tx);
        assert_eq!(orch.status().stats.running, 2);
        assert_eq!(orch.tree().node(root).next_child, 2);

        // nothing more starts until a slot frees up
        orch.start_available(root, &tx);
        assert_eq!(orch.status().stats.running, 2);
        orch.kill(root);
    }

    #[tokio::test]
    async fn test_cap_equal_to_width_starts_everything() {
        let children: Vec<_> = (0..4)
            .map(|i| TaskSpec::command(format!("c{}", i), "true"))
            .collect();
        let mut orch = orchestrator(vec![TaskSpec::group("group", children)], 4);
        let root = orch.tree().roots()[0];
        let (tx, _rx) = mpsc::unbounded_channel();
        orch.start_available(root, &tx);
        assert_eq!(orch.status().stats.running, 4);
        assert!(orch.tree().fully_started(root));
    }

    #[tokio::test]
    async fn test_own_command_runs_before_children() {
        let spec = TaskSpec::command("parent", "sleep 0.1; echo parent")
            .with_children(vec![TaskSpec::command("child", "echo child")]);
        let mut orch = orchestrator(vec![spec], 4);
        let root = orch.tree().roots()[0];
        let child = orch.tree().node(root).children[0];
        let (tx, _rx) = mpsc::unbounded_channel();

        orch.start_available(root, &tx);
        assert_eq!(orch.status().stats.running, 1);
        assert!(!orch.tree().node(child).is_started());
        orch.kill(root);
    }

    #[tokio::test]
    async fn test_run_collects_output_and_failures() {
        let mut orch = orchestrator(
            vec![
                TaskSpec::command("hello", "echo hello"),
                TaskSpec::group(
                    "checks",
                    vec![
                        TaskSpec::command("bad", "echo broken >&2; exit 3"),
                        TaskSpec::command("flaky", "exit 1").ignore_failure(true),
                    ],
                ),
            ],
            2,
        );
        let report = orch.run().await.unwrap();

        let hello = orch.tree().roots()[0];
        assert_eq!(message(&orch, hello).as_deref(), Some("hello"));
        assert_eq!(report.stats.completed, 3);
        assert_eq!(report.failed(), 1);
        assert!(!report.stopped);
        assert_eq!(report.failures[0].title, "bad");
        assert_eq!(report.failures[0].exit_code, 3);
        assert_eq!(report.failures[0].stderr, "broken\n");
    }

    #[tokio::test]
    async fn test_polling_mode_updates_on_tick() {
        let spec = TaskSpec::command("poll", "echo one; echo two; sleep 0.2").event_driven(false);
        let mut orch = orchestrator(vec![spec], 1);
        orch.run().await.unwrap();
        let root = orch.tree().roots()[0];
        assert_eq!(message(&orch, root).as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_hidden_output_is_not_recorded() {
        let spec = TaskSpec::command("quiet", "echo secret").show_output(false);
        let mut orch = orchestrator(vec![spec], 1);
        orch.run().await.unwrap();
        let root = orch.tree().roots()[0];
        assert_eq!(message(&orch, root), None);
    }

    #[tokio::test]
    async fn test_durations_are_recorded() {
        let mut orch = orchestrator(vec![TaskSpec::command("quick", "true")], 1);
        orch.run().await.unwrap();
        assert!(orch.into_history().lookup("true").is_some());
    }
}
