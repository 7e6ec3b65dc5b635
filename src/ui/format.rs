//! Pure formatting of status lines, the summary footer and the final report

use crate::core::estimate::format_duration;
use crate::core::lines::{strip_ansi, visible_width};
use crate::core::{Branch, NodeState};
use crossterm::style::{Color, Stylize};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Width reserved for task titles
pub const TITLE_COLUMN: usize = 25;

/// ANSI 256-color codes per state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Palette {
    pub pending: u8,
    pub running: u8,
    pub success: u8,
    pub error: u8,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            pending: 22,
            running: 22,
            success: 76,
            error: 160,
        }
    }
}

impl Palette {
    pub fn color(&self, state: NodeState) -> Color {
        let code = match state {
            NodeState::Pending => self.pending,
            NodeState::Running => self.running,
            NodeState::Succeeded => self.success,
            NodeState::Failed => self.error,
        };
        Color::AnsiValue(code)
    }
}

/// How the message column is colored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tone {
    #[default]
    Plain,
    Output,
    Error,
}

/// Everything one task line shows
#[derive(Debug, Clone)]
pub struct LineStatus<'a> {
    pub state: NodeState,
    pub title: &'a str,
    pub message: &'a str,
    pub tone: Tone,
    /// Spinner frame or bullet
    pub prefix: &'a str,
    pub eta: &'a str,
    pub branch: Branch,
}

fn glyph(branch: Branch) -> &'static str {
    match branch {
        Branch::Root => "",
        Branch::Middle => "├─ ",
        Branch::Last => "└─ ",
    }
}

fn paint(text: &str, tone: Tone) -> String {
    match tone {
        Tone::Plain => text.to_string(),
        Tone::Output => text.blue().to_string(),
        Tone::Error => text.red().to_string(),
    }
}

/// Cut `text` to `max` visible characters, ending with `...`
pub fn truncate_visible(text: &str, max: usize) -> String {
    if visible_width(text) <= max {
        return text.to_string();
    }
    let plain = strip_ansi(text);
    if max <= 3 {
        return ".".repeat(max);
    }
    let head: String = plain.chars().take(max - 3).collect();
    format!("{}...", head)
}

/// Render one task line, fitted to `width` with the ETA pushed right
pub fn format_line(status: &LineStatus<'_>, palette: &Palette, width: usize) -> String {
    let block = "  ".on(palette.color(status.state)).to_string();
    let prefix: String = status.prefix.chars().take(1).collect();
    let base = format!(
        " {}  {:1} {}{:<w$} ",
        block,
        prefix,
        glyph(status.branch),
        status.title,
        w = TITLE_COLUMN
    );
    let eta = if status.eta.is_empty() {
        String::new()
    } else {
        status.eta.bold().to_string()
    };

    let used = visible_width(&base) + visible_width(&eta);
    let room = width.saturating_sub(used);
    let message = truncate_visible(status.message, room);
    let split = " ".repeat(room.saturating_sub(visible_width(&message)));

    format!(
        "{}{}{}{}",
        base,
        paint(&message, status.tone),
        split,
        eta
    )
}

/// Values shown in the summary footer
#[derive(Debug, Clone, Default)]
pub struct FooterStatus {
    pub completed: usize,
    pub total: usize,
    pub failed: usize,
    pub elapsed: Duration,
    /// Expected total runtime, when any history exists
    pub expected: Option<Duration>,
    pub show_steps: bool,
    pub show_errors: bool,
    pub show_times: bool,
}

/// Centered summary with a progress fill proportional to completion
pub fn format_footer(status: &FooterStatus, palette: &Palette, width: usize) -> String {
    let mut text = String::new();
    if status.show_steps {
        text.push_str(&format!(" Tasks[{}/{}]", status.completed, status.total));
    }
    if status.show_errors {
        text.push_str(&format!(" Errors[{}]", status.failed));
    }
    if status.show_times {
        text.push_str(&format!(" Runtime[{}]", format_duration(status.elapsed)));
        if status.completed < status.total {
            if let Some(expected) = status.expected {
                let remaining = expected.saturating_sub(status.elapsed);
                text.push_str(&format!(" ETA[{}]", format_duration(remaining)));
            }
        }
    }

    let len = text.chars().count();
    let width = width.max(len);
    let left = (width - len) / 2;
    let padded = format!("{}{}{}", " ".repeat(left), text, " ".repeat(width - len - left));

    let fill = if status.total == 0 {
        0
    } else {
        (width * status.completed / status.total).min(width)
    };
    let state = if status.failed > 0 {
        NodeState::Failed
    } else {
        NodeState::Succeeded
    };
    let color = palette.color(state);
    let filled: String = padded.chars().take(fill).collect();
    let empty: String = padded.chars().skip(fill).collect();
    format!(
        "{}{}",
        filled.as_str().on(color).white(),
        empty.as_str().with(color)
    )
}

/// One failed task in the post-run report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub title: String,
    pub command: String,
    pub exit_code: i32,
    pub stderr: String,
}

/// Concatenate every failure's stderr under a heading
pub fn format_report(failures: &[FailureReport]) -> String {
    let mut out = String::new();
    for failure in failures {
        out.push_str(&format!(
            "{} {}\n",
            "Failed task:".red().bold(),
            failure.title
        ));
        out.push_str(&format!(" ├─ command: {}\n", failure.command));
        out.push_str(&format!(" ├─ return code: {}\n", failure.exit_code));
        out.push_str(" └─ stderr:\n");
        if failure.stderr.trim().is_empty() {
            out.push_str("    (none)\n");
        }
        for line in failure.stderr.lines() {
            out.push_str(&format!("    {}\n", line));
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status<'a>(message: &'a str, eta: &'a str) -> LineStatus<'a> {
        LineStatus {
            state: NodeState::Running,
            title: "compile",
            message,
            tone: Tone::Output,
            prefix: "⠋",
            eta,
            branch: Branch::Middle,
        }
    }

    #[test]
    fn test_line_fits_width() {
        let line = format_line(&status("building crate foo", "[12s]"), &Palette::default(), 80);
        assert_eq!(visible_width(&line), 80);
        let plain = strip_ansi(&line);
        assert!(plain.contains("├─ compile"));
        assert!(plain.trim_end().ends_with("[12s]"));
    }

    #[test]
    fn test_long_message_is_truncated() {
        let long = "x".repeat(200);
        let line = format_line(&status(&long, ""), &Palette::default(), 60);
        assert_eq!(visible_width(&line), 60);
        assert!(strip_ansi(&line).ends_with("..."));
    }

    #[test]
    fn test_truncate_visible() {
        assert_eq!(truncate_visible("short", 10), "short");
        assert_eq!(truncate_visible("abcdefghij", 6), "abc...");
        assert_eq!(truncate_visible("abcdef", 2), "..");
    }

    #[test]
    fn test_footer_contents() {
        let footer = FooterStatus {
            completed: 1,
            total: 4,
            failed: 1,
            elapsed: Duration::from_secs(5),
            expected: Some(Duration::from_secs(65)),
            show_steps: true,
            show_errors: true,
            show_times: true,
        };
        let line = strip_ansi(&format_footer(&footer, &Palette::default(), 70));
        assert_eq!(line.chars().count(), 70);
        assert!(line.contains("Tasks[1/4]"));
        assert!(line.contains("Errors[1]"));
        assert!(line.contains("Runtime[5s]"));
        assert!(line.contains("ETA[1m0s]"));
    }

    #[test]
    fn test_report_lists_stderr() {
        let report = strip_ansi(&format_report(&[FailureReport {
            title: "deploy".into(),
            command: "exit 5".into(),
            exit_code: 5,
            stderr: "permission denied\n".into(),
        }]));
        assert!(report.contains("Failed task: deploy"));
        assert!(report.contains("return code: 5"));
        assert!(report.contains("    permission denied"));
    }
}
