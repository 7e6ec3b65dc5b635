//! Task executor - runs one node's command and reports back as events
//!
//! Each launch owns a monitor task plus one reader task per output stream.
//! Those tasks never touch shared run state: they only send immutable
//! [`TaskEvent`]s to the orchestrator, or overwrite a node's latest line in
//! polling mode.

use super::lines::{parse_env, LineSplitter};
use super::process::{ShellCommand, ShellProcess, Terminator};
use super::tree::NodeId;
use crate::tasklog::LogHandle;
use std::collections::HashMap;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, watch};

/// Buffered lines per stream between reader and monitor
const STREAM_CAPACITY: usize = 1000;

/// Stdout backlog beyond which lines skip the display
const DISPLAY_BACKLOG: usize = 100;

const READ_CHUNK: usize = 4096;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Latest line of a polling-mode node
pub type LatestLine = Option<(Stream, String)>;

/// Task execution event
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Started {
        id: NodeId,
    },
    Output {
        id: NodeId,
        stream: Stream,
        line: String,
    },
    /// Always the last event for a node
    Completed {
        id: NodeId,
        exit_code: i32,
        stopped_at: Instant,
        /// Every stderr line the command produced
        stderr: String,
        /// Exported environment, for nodes in the sequential chain
        env: Option<HashMap<String, String>>,
    },
}

impl TaskEvent {
    pub fn id(&self) -> NodeId {
        match self {
            Self::Started { id } | Self::Output { id, .. } | Self::Completed { id, .. } => *id,
        }
    }
}

/// Request to run one node's command
#[derive(Debug, Clone)]
pub struct Launch {
    pub id: NodeId,
    pub name: String,
    pub command: ShellCommand,
    /// Every line becomes an event, instead of overwriting the latest line
    pub event_driven: bool,
    /// Parse the exported environment into the completion event
    pub harvest_env: bool,
    /// Longest line before a forced split
    pub max_line: usize,
    pub log: Option<LogHandle>,
}

/// Handles the orchestrator keeps for a launched node
#[derive(Debug)]
pub struct Launched {
    pub terminator: Terminator,
    /// Present in polling mode
    pub latest: Option<watch::Receiver<LatestLine>>,
}

/// Start a node's command and its monitor.
///
/// A command that cannot be spawned still produces a stderr line and a
/// completion with exit code -1.
pub fn launch(request: Launch, events: mpsc::UnboundedSender<TaskEvent>) -> Launched {
    log::info!("Started task: {}", request.name);
    let _ = events.send(TaskEvent::Started { id: request.id });

    let (latest_tx, latest) = if request.event_driven {
        (None, None)
    } else {
        let (tx, rx) = watch::channel(None);
        (Some(tx), Some(rx))
    };

    match ShellProcess::spawn(&request.command) {
        Ok(process) => {
            let terminator = process.terminator();
            tokio::spawn(monitor(process, request, events, latest_tx));
            Launched {
                terminator,
                latest,
            }
        }
        Err(e) => {
            log::error!("Task {} could not start: {}", request.name, e);
            let message = format!("Failed to run: {}", e);
            if let Some(log) = &request.log {
                log.append(message.clone());
            }
            let _ = events.send(TaskEvent::Output {
                id: request.id,
                stream: Stream::Stderr,
                line: message.clone(),
            });
            let _ = events.send(TaskEvent::Completed {
                id: request.id,
                exit_code: -1,
                stopped_at: Instant::now(),
                stderr: format!("{}\n", message),
                env: None,
            });
            Launched {
                terminator: Terminator::none(),
                latest,
            }
        }
    }
}

async fn monitor(
    mut process: ShellProcess,
    request: Launch,
    events: mpsc::UnboundedSender<TaskEvent>,
    latest: Option<watch::Sender<LatestLine>>,
) {
    let id = request.id;
    let env_task = process.harvest_env();

    let (out_tx, mut out_rx) = mpsc::channel(STREAM_CAPACITY);
    let (err_tx, mut err_rx) = mpsc::channel(STREAM_CAPACITY);
    if let Some(stdout) = process.take_stdout() {
        tokio::spawn(read_stream(stdout, request.max_line, out_tx));
    }
    if let Some(stderr) = process.take_stderr() {
        tokio::spawn(read_stream(stderr, request.max_line, err_tx));
    }

    let deliver = |stream: Stream, line: String| {
        match &latest {
            Some(latest) => {
                latest.send_replace(Some((stream, line)));
            }
            None => {
                let _ = events.send(TaskEvent::Output { id, stream, line });
            }
        }
    };

    let mut stderr_text = String::new();
    let mut out_open = true;
    let mut err_open = true;
    loop {
        tokio::select! {
            line = out_rx.recv(), if out_open => match line {
                Some(line) => {
                    if let Some(log) = &request.log {
                        log.append(line.clone());
                    }
                    // falling behind: burn off lines without showing them
                    if out_rx.len() > DISPLAY_BACKLOG {
                        continue;
                    }
                    deliver(Stream::Stdout, line);
                }
                None => out_open = false,
            },
            line = err_rx.recv(), if err_open => match line {
                Some(line) => {
                    if let Some(log) = &request.log {
                        log.append(line.clone());
                    }
                    stderr_text.push_str(&line);
                    stderr_text.push('\n');
                    deliver(Stream::Stderr, line);
                }
                None => err_open = false,
            },
            else => break,
        }
    }

    let exit_code = match process.wait().await {
        Ok(code) => code,
        Err(e) => {
            let message = format!("Failed to run: {}", e);
            log::error!("Task {}: {}", request.name, message);
            if let Some(log) = &request.log {
                log.append(message.clone());
            }
            stderr_text.push_str(&message);
            stderr_text.push('\n');
            let _ = events.send(TaskEvent::Output {
                id,
                stream: Stream::Stderr,
                line: message,
            });
            -1
        }
    };
    let stopped_at = Instant::now();
    log::info!("Completed task: {} (rc:{})", request.name, exit_code);

    let env = match env_task.await {
        Ok(Ok(text)) if request.harvest_env => Some(parse_env(&text)),
        Ok(Ok(_)) => None,
        Ok(Err(e)) => {
            log::warn!("Task {}: {}", request.name, e);
            None
        }
        Err(e) => {
            log::warn!("Task {}: env reader failed: {}", request.name, e);
            None
        }
    };

    let _ = events.send(TaskEvent::Completed {
        id,
        exit_code,
        stopped_at,
        stderr: stderr_text,
        env,
    });
}

async fn read_stream<R>(mut reader: R, max_line: usize, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new(max_line);
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("Pipe read error: {}", e);
                break;
            }
        }
    }
    for line in splitter.finish() {
        if tx.send(line).await.is_err() {
            return;
        }
    }
}
