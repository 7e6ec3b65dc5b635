//! Duration history - last observed runtime per exact command text
//!
//! Loaded before a run to seed estimates, updated as commands finish and
//! flushed afterwards.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CACHE_DIR: &str = ".taskline";
const CACHE_FILE: &str = "cache.json";

/// Lookup/store interface the engine needs from the persistence layer
pub trait DurationStore {
    fn lookup(&self, command: &str) -> Option<Duration>;
    fn store(&mut self, command: &str, duration: Duration);
}

/// JSON-backed duration cache
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DurationCache {
    pub updated_at: Option<DateTime<Utc>>,
    /// Seconds, keyed by command text
    #[serde(default)]
    commands: HashMap<String, f64>,
}

impl DurationCache {
    /// `~/.taskline/cache.json`, or relative to the cwd without a home dir
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CACHE_DIR)
            .join(CACHE_FILE)
    }

    /// Load the cache; a missing file is an empty cache
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading duration cache {}", path.display()))?;
        let cache = serde_json::from_str(&content)
            .with_context(|| format!("parsing duration cache {}", path.display()))?;
        Ok(cache)
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        self.updated_at = Some(Utc::now());
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("writing duration cache {}", path.display()))?;
        Ok(())
    }

    pub fn lookup(&self, command: &str) -> Option<Duration> {
        self.commands
            .get(command)
            .filter(|secs| secs.is_finite() && **secs >= 0.0)
            .map(|secs| Duration::from_secs_f64(*secs))
    }

    pub fn store(&mut self, command: &str, duration: Duration) {
        self.commands
            .insert(command.to_string(), duration.as_secs_f64());
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl DurationStore for DurationCache {
    fn lookup(&self, command: &str) -> Option<Duration> {
        DurationCache::lookup(self, command)
    }

    fn store(&mut self, command: &str, duration: Duration) {
        DurationCache::store(self, command, duration)
    }
}
