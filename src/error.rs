//! Error types for process management and configuration

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failures while launching, waiting on or signalling a task process
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The shell could not be started at all
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The OS refused to report the exit status
    #[error("failed to wait for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The environment side channel could not be created or read
    #[error("environment pipe error: {0}")]
    EnvPipe(#[source] io::Error),

    /// Delivering a termination signal to the process group failed
    #[error("failed to signal process group {pgid}: {source}")]
    Signal {
        pgid: i32,
        #[source]
        source: io::Error,
    },
}

/// Failures while reading or validating a run configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
