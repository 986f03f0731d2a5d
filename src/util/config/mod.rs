//! taskcore configuration system
//!
//! Runtime settings are plain serde structs stored as RON. Every field has a
//! default, so a config file only needs to name what it changes.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments
//! 2. File named by the TASKCORE_CONFIG environment variable
//! 3. Default values
//! ```
//!
//! # Usage
//!
//! ```rust
//! use taskcore::util::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_ron_str("(scheduler: (workers: 2))").unwrap();
//! assert_eq!(config.scheduler.workers, 2);
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Environment variable naming a RON config file.
pub const CONFIG_ENV: &str = "TASKCORE_CONFIG";

/// Top-level runtime configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Worker pool settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Task stack allocator settings
    #[serde(default)]
    pub allocator: AllocatorConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Worker pool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum jobs taken from a victim in one steal.
    #[serde(default = "default_steal_batch")]
    pub steal_batch: usize,
    /// How long an idle worker parks before re-checking for work.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Whether idle workers steal from their siblings.
    #[serde(default = "default_use_work_stealing")]
    pub use_work_stealing: bool,
}

fn default_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_steal_batch() -> usize {
    4
}

fn default_idle_timeout_ms() -> u64 {
    1
}

fn default_use_work_stealing() -> bool {
    true
}

impl SchedulerConfig {
    /// Idle timeout as a `Duration`.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            steal_batch: default_steal_batch(),
            idle_timeout_ms: default_idle_timeout_ms(),
            use_work_stealing: default_use_work_stealing(),
        }
    }
}

/// Task stack allocator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Bytes requested for each slab of a task's frame allocator.
    #[serde(default = "default_slab_size")]
    pub slab_size: usize,
}

/// Default slab size for task frame allocation.
pub const DEFAULT_SLAB_SIZE: usize = 1024;

fn default_slab_size() -> usize {
    DEFAULT_SLAB_SIZE
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            slab_size: DEFAULT_SLAB_SIZE,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// One of trace, debug, info, warn, error.
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a config from RON text.
    pub fn from_ron_str(content: &str) -> Result<Self, ConfigError> {
        ron::from_str(content).map_err(ConfigError::Parse)
    }

    /// Render the config as pretty RON.
    pub fn to_ron_string(&self) -> Result<String, ConfigError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(ConfigError::Serialize)
    }

    /// Load the file named by `TASKCORE_CONFIG`, or defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match config_path_from_env() {
            Some(path) => load_config(&path),
            None => Ok(Self::default()),
        }
    }
}

/// Path named by `TASKCORE_CONFIG`, if any.
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Load configuration from a RON file
pub fn load_config(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    RuntimeConfig::from_ron_str(&content)
}

/// Save configuration to a RON file
pub fn save_config(
    path: &Path,
    config: &RuntimeConfig,
) -> Result<(), ConfigError> {
    let content = config.to_ron_string()?;
    fs::write(path, content).map_err(ConfigError::Io)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[source] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[source] ron::error::SpannedError),

    #[error("Config serialize error: {0}")]
    Serialize(#[source] ron::Error),
}

#[cfg(test)]
mod tests;
