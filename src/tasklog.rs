//! Per-task log files
//!
//! Every started task gets its own ordered channel of output lines. A writer
//! task appends them to `<dir>/<id>-<name>.log` and exits once the channel
//! closes, which happens when the task completes.

use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One line destined for a task log
#[derive(Debug, Clone)]
pub struct LogItem {
    pub name: String,
    pub line: String,
}

/// Sending side of a task's log channel
#[derive(Debug, Clone)]
pub struct LogHandle {
    name: String,
    tx: mpsc::UnboundedSender<LogItem>,
}

impl LogHandle {
    pub fn append(&self, line: impl Into<String>) {
        // writer gone means the file could not be opened; already reported
        let _ = self.tx.send(LogItem {
            name: self.name.clone(),
            line: line.into(),
        });
    }
}

/// Factory for task log channels
#[derive(Debug, Clone, Default)]
pub struct TaskLogger {
    dir: Option<PathBuf>,
}

impl TaskLogger {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Path of the log file for a task
    pub fn path_for(&self, id: usize, name: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.log", id, sanitize(name))))
    }

    /// Open a channel for one task; `None` when logging is disabled
    pub fn open(&self, id: usize, name: &str) -> Option<(LogHandle, JoinHandle<()>)> {
        let path = self.path_for(id, name)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_log(path, rx));
        Some((
            LogHandle {
                name: name.to_string(),
                tx,
            },
            writer,
        ))
    }
}

async fn write_log(path: PathBuf, mut rx: mpsc::UnboundedReceiver<LogItem>) {
    let mut file = match open_append(&path).await {
        Ok(file) => file,
        Err(e) => {
            log::warn!("Cannot open task log {}: {}", path.display(), e);
            while rx.recv().await.is_some() {}
            return;
        }
    };

    while let Some(item) = rx.recv().await {
        let entry = format!(
            "{} [{}] {}\n",
            Local::now().format("%H:%M:%S%.3f"),
            item.name,
            item.line
        );
        if let Err(e) = file.write_all(entry.as_bytes()).await {
            log::warn!("Failed writing task log {}: {}", path.display(), e);
            break;
        }
    }
    if let Err(e) = file.flush().await {
        log::warn!("Failed flushing task log {}: {}", path.display(), e);
    }
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(48)
        .collect();
    if cleaned.is_empty() {
        "task".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("build: web/app"), "build__web_app");
        assert_eq!(sanitize(""), "task");
    }

    #[tokio::test]
    async fn test_lines_written_in_order_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let logger = TaskLogger::new(Some(dir.path().to_path_buf()));
        let (handle, writer) = logger.open(4, "unit tests").unwrap();

        handle.append("first");
        handle.append("second");
        drop(handle);
        writer.await.unwrap();

        let content = std::fs::read_to_string(logger.path_for(4, "unit tests").unwrap()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[unit tests] first"));
        assert!(lines[1].ends_with("[unit tests] second"));
    }

    #[tokio::test]
    async fn test_disabled_logger_opens_nothing() {
        let logger = TaskLogger::disabled();
        assert!(!logger.is_enabled());
        assert!(logger.open(0, "x").is_none());
    }
}
