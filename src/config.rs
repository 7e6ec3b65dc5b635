//! Run configuration - parses a YAML task file into task specs and options

use crate::core::{Executable, RunOptions, TaskSpec};
use crate::error::ConfigError;
use crate::ui::Palette;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the password fed to `sudo -S`
pub const SUDO_PASSWORD_VAR: &str = "TASKLINE_SUDO_PASSWORD";

/// A whole task file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub config: Options,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// Global options, plus the defaults tasks inherit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Options {
    pub max_parallel_commands: usize,
    pub bullet_char: String,
    pub exec_replace_text: String,
    pub replica_replace_pattern: String,
    pub show_summary_footer: bool,
    pub show_summary_errors: bool,
    pub show_summary_steps: bool,
    pub show_summary_times: bool,
    pub show_task_eta: bool,
    pub show_task_output: bool,
    pub event_driven: bool,
    pub stop_on_failure: bool,
    pub ignore_failure: bool,
    pub collapse_on_completion: bool,
    /// Redraw tick in milliseconds
    pub update_interval: u64,
    pub log_path: Option<PathBuf>,
    pub cache_path: Option<PathBuf>,
    pub shell: Option<String>,
    pub colors: Palette,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_parallel_commands: 4,
            bullet_char: "•".to_string(),
            exec_replace_text: "<exec>".to_string(),
            replica_replace_pattern: "<replace>".to_string(),
            show_summary_footer: true,
            show_summary_errors: true,
            show_summary_steps: true,
            show_summary_times: true,
            show_task_eta: true,
            show_task_output: true,
            event_driven: true,
            stop_on_failure: true,
            ignore_failure: false,
            collapse_on_completion: false,
            update_interval: 150,
            log_path: None,
            cache_path: None,
            shell: None,
            colors: Palette::default(),
        }
    }
}

/// One task entry; unset flags fall back to [`Options`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TaskConfig {
    #[serde(default)]
    pub name: String,
    pub cmd: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub sudo: bool,
    pub ignore_failure: Option<bool>,
    pub stop_on_failure: Option<bool>,
    pub event_driven: Option<bool>,
    pub show_output: Option<bool>,
    pub collapse_on_completion: Option<bool>,
    #[serde(default)]
    pub for_each: Vec<String>,
    #[serde(default)]
    pub parallel_tasks: Vec<TaskConfig>,
}

impl TaskConfig {
    fn label(&self) -> &str {
        if !self.name.is_empty() {
            &self.name
        } else {
            self.cmd.as_deref().or(self.url.as_deref()).unwrap_or("<unnamed>")
        }
    }

    fn replica(&self, pattern: &str, value: &str) -> Self {
        let swap = |text: &str| text.replace(pattern, value);
        Self {
            name: swap(&self.name),
            cmd: self.cmd.as_deref().map(swap),
            url: self.url.as_deref().map(swap),
            for_each: Vec::new(),
            parallel_tasks: self
                .parallel_tasks
                .iter()
                .map(|child| child.replica(pattern, value))
                .collect(),
            ..self.clone()
        }
    }
}

/// Replace every `for-each` task with one copy per value
fn expand_replicas(tasks: Vec<TaskConfig>, pattern: &str) -> Vec<TaskConfig> {
    let mut out = Vec::with_capacity(tasks.len());
    for mut task in tasks {
        task.parallel_tasks = expand_replicas(std::mem::take(&mut task.parallel_tasks), pattern);
        if task.for_each.is_empty() {
            out.push(task);
            continue;
        }
        for value in &task.for_each {
            out.push(task.replica(pattern, value));
        }
    }
    out
}

impl Config {
    /// Load and validate a task file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&content)?;
        log::debug!(
            "Loaded {} tasks from {}",
            config.tasks.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        let pattern = config.config.replica_replace_pattern.clone();
        config.tasks = expand_replicas(std::mem::take(&mut config.tasks), &pattern);
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let options = &self.config;
        if options.max_parallel_commands == 0 {
            return Err(ConfigError::Invalid(
                "max-parallel-commands must be at least 1".to_string(),
            ));
        }
        if options.update_interval == 0 {
            return Err(ConfigError::Invalid(
                "update-interval must be at least 1ms".to_string(),
            ));
        }
        if options.exec_replace_text.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "exec-replace-text must not be empty".to_string(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(ConfigError::Invalid("no tasks defined".to_string()));
        }
        for task in &self.tasks {
            validate_task(task, options)?;
        }
        Ok(())
    }

    /// Task specs for the engine, with option defaults applied
    pub fn specs(&self) -> Vec<TaskSpec> {
        self.tasks
            .iter()
            .map(|task| to_spec(task, &self.config))
            .collect()
    }

    /// Engine options; the sudo password is left for the caller to supply
    pub fn run_options(&self) -> RunOptions {
        let options = &self.config;
        let shell = options
            .shell
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .filter(|shell| !shell.trim().is_empty())
            .unwrap_or_else(|| "sh".to_string());
        RunOptions {
            max_parallel: options.max_parallel_commands,
            bullet: options.bullet_char.clone(),
            shell,
            sudo_password: None,
            show_footer: options.show_summary_footer,
            show_errors: options.show_summary_errors,
            show_steps: options.show_summary_steps,
            show_times: options.show_summary_times,
            show_eta: options.show_task_eta,
            update_interval: Duration::from_millis(options.update_interval),
            palette: options.colors,
        }
    }

    /// Placeholder replaced by a task's `url` inside its `cmd`
    pub fn placeholder(&self) -> &str {
        &self.config.exec_replace_text
    }
}

fn validate_task(task: &TaskConfig, options: &Options) -> Result<(), ConfigError> {
    let has_exec = task.cmd.as_deref().is_some_and(|c| !c.trim().is_empty())
        || task.url.as_deref().is_some_and(|u| !u.trim().is_empty());
    if !has_exec && task.parallel_tasks.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "task '{}' needs a cmd, a url or parallel-tasks",
            task.label()
        )));
    }
    if !task.for_each.is_empty() {
        let pattern = &options.replica_replace_pattern;
        let uses_pattern = [Some(task.name.as_str()), task.cmd.as_deref(), task.url.as_deref()]
            .into_iter()
            .flatten()
            .any(|text| text.contains(pattern.as_str()));
        if !uses_pattern {
            log::warn!(
                "Task '{}' has for-each values but never uses {}",
                task.label(),
                pattern
            );
        }
    }
    for child in &task.parallel_tasks {
        validate_task(child, options)?;
    }
    Ok(())
}

fn to_spec(task: &TaskConfig, options: &Options) -> TaskSpec {
    let exec = match (&task.url, &task.cmd) {
        (Some(url), command) => Some(Executable::Remote {
            url: url.clone(),
            command: command.clone(),
        }),
        (None, Some(cmd)) => Some(Executable::Command(cmd.clone())),
        (None, None) => None,
    };
    TaskSpec {
        name: task.name.clone(),
        exec,
        sudo: task.sudo,
        ignore_failure: task.ignore_failure.unwrap_or(options.ignore_failure),
        stop_on_failure: task.stop_on_failure.unwrap_or(options.stop_on_failure),
        event_driven: task.event_driven.unwrap_or(options.event_driven),
        show_output: task.show_output.unwrap_or(options.show_task_output),
        collapse_on_completion: task
            .collapse_on_completion
            .unwrap_or(options.collapse_on_completion),
        children: task
            .parallel_tasks
            .iter()
            .map(|child| to_spec(child, options))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
config:
  max-parallel-commands: 2
  stop-on-failure: false
  update-interval: 50
  colors:
    error: 196
tasks:
  - name: prepare
    cmd: echo prepare
  - name: test <replace>
    for-each: [unit, lint]
    cmd: make <replace>
  - name: deploy
    url: ./deploy.sh
    cmd: bash <exec> --now
    parallel-tasks:
      - cmd: echo one
        stop-on-failure: true
      - name: notify
        cmd: echo two
        show-output: false
"#;

    #[test]
    fn test_parse_and_expand() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.config.max_parallel_commands, 2);
        assert_eq!(config.config.colors.error, 196);
        assert_eq!(config.config.colors.success, 76);
        let names: Vec<_> = config.tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["prepare", "test unit", "test lint", "deploy"]);
        assert_eq!(config.tasks[2].cmd.as_deref(), Some("make lint"));
    }

    #[test]
    fn test_specs_inherit_defaults() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let specs = config.specs();
        assert!(!specs[0].stop_on_failure);
        assert!(specs[0].show_output);

        let deploy = &specs[3];
        assert_eq!(
            deploy.command_text(config.placeholder()).as_deref(),
            Some("bash ./deploy.sh --now")
        );
        assert!(deploy.children[0].stop_on_failure);
        assert!(!deploy.children[1].show_output);
    }

    #[test]
    fn test_run_options() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let options = config.run_options();
        assert_eq!(options.max_parallel, 2);
        assert_eq!(options.update_interval, Duration::from_millis(50));
        assert!(options.sudo_password.is_none());
        assert!(!options.shell.is_empty());
    }

    #[test]
    fn test_task_without_work_is_rejected() {
        let err = Config::from_yaml("tasks:\n  - name: empty\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("empty")));
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let yaml = "config:\n  max-parallel-commands: 0\ntasks:\n  - cmd: echo ok\n";
        assert!(matches!(
            Config::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_placeholder_is_rejected() {
        let yaml = "config:\n  exec-replace-text: \"\"\ntasks:\n  - url: ./deploy.sh\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("exec-replace-text")));
    }

    #[test]
    fn test_bad_yaml() {
        assert!(matches!(
            Config::from_yaml("tasks: [ {"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/taskline.yml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("/nonexistent/taskline.yml"));
    }
}
