//! Configuration file handling for tpub.
//!
//! Settings are read from a `.tpub.toml` file and merged with command-line
//! overrides. Every key is optional.
//!
//! ```toml
//! [paths]
//! definitions_root = "types"
//! data_dir = "data"
//! state_dir = ".tpub"
//!
//! [registry]
//! scope = "types"
//!
//! [pool]
//! processes = 4
//! crash_recovery = true
//! memory_ceiling_mb = 2048
//! crash_recovery_memory_ceiling_mb = 4096
//! oom_exit_code = 134
//! soft_timeout = "30m"
//! ```
//!
//! # Example
//!
//! ```
//! use tpub_config::{Config, load_config};
//! use std::path::Path;
//!
//! let config = load_config(Path::new(".")).expect("load config");
//! assert!(config.processes() >= 1);
//! ```

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Default configuration file name
pub const CONFIG_FILE: &str = ".tpub.toml";

/// Exit status a worker uses to signal it ran out of memory.
pub const DEFAULT_OOM_EXIT_CODE: i32 = 134;

/// Memory ceiling used for the last crash recovery attempt.
pub const DEFAULT_CRASH_RECOVERY_MEMORY_CEILING_MB: u64 = 4096;

/// Get the config file path for a directory
pub fn config_path(dir: &Path) -> PathBuf {
    dir.join(CONFIG_FILE)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn definitions_root(&self) -> &Path {
        &self.paths.definitions_root
    }

    pub fn data_dir(&self) -> &Path {
        &self.paths.data_dir
    }

    pub fn state_dir(&self) -> &Path {
        &self.paths.state_dir
    }

    /// Package scope used for full npm names, without the leading `@`.
    pub fn scope(&self) -> &str {
        &self.registry.scope
    }

    /// Worker count; falls back to the machine's available parallelism.
    pub fn processes(&self) -> usize {
        self.pool.processes.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
        })
    }

    pub fn crash_recovery(&self) -> bool {
        self.pool.crash_recovery
    }

    pub fn memory_ceiling_mb(&self) -> Option<u64> {
        self.pool.memory_ceiling_mb
    }

    pub fn crash_recovery_memory_ceiling_mb(&self) -> u64 {
        self.pool.crash_recovery_memory_ceiling_mb
    }

    pub fn oom_exit_code(&self) -> i32 {
        self.pool.oom_exit_code
    }

    pub fn soft_timeout(&self) -> Option<Duration> {
        self.pool.soft_timeout
    }

    /// Merge this config with another (other takes precedence).
    ///
    /// Plain values in `other` only win when they differ from the default, so
    /// a sparse override built from CLI flags leaves file settings in place.
    pub fn merge(&self, other: &Config) -> Config {
        let default_paths = PathsConfig::default();
        let default_registry = RegistryConfig::default();
        let default_pool = PoolConfig::default();

        Config {
            paths: PathsConfig {
                definitions_root: pick(
                    &other.paths.definitions_root,
                    &self.paths.definitions_root,
                    &default_paths.definitions_root,
                ),
                data_dir: pick(
                    &other.paths.data_dir,
                    &self.paths.data_dir,
                    &default_paths.data_dir,
                ),
                state_dir: pick(
                    &other.paths.state_dir,
                    &self.paths.state_dir,
                    &default_paths.state_dir,
                ),
            },
            registry: RegistryConfig {
                scope: pick(&other.registry.scope, &self.registry.scope, &default_registry.scope),
            },
            pool: PoolConfig {
                processes: other.pool.processes.or(self.pool.processes),
                crash_recovery: other.pool.crash_recovery && self.pool.crash_recovery,
                memory_ceiling_mb: other.pool.memory_ceiling_mb.or(self.pool.memory_ceiling_mb),
                crash_recovery_memory_ceiling_mb: pick(
                    &other.pool.crash_recovery_memory_ceiling_mb,
                    &self.pool.crash_recovery_memory_ceiling_mb,
                    &default_pool.crash_recovery_memory_ceiling_mb,
                ),
                oom_exit_code: pick(
                    &other.pool.oom_exit_code,
                    &self.pool.oom_exit_code,
                    &default_pool.oom_exit_code,
                ),
                soft_timeout: other.pool.soft_timeout.or(self.pool.soft_timeout),
            },
        }
    }
}

fn pick<T: Clone + PartialEq>(other: &T, base: &T, default: &T) -> T {
    if other != default {
        other.clone()
    } else {
        base.clone()
    }
}

/// Filesystem layout, relative to the directory tpub runs in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding one sub-directory per package.
    #[serde(default = "default_definitions_root")]
    pub definitions_root: PathBuf,
    /// Directory holding `typings.json`, `notNeededPackages.json` and `versions.json`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory holding `events.jsonl`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

fn default_definitions_root() -> PathBuf {
    PathBuf::from("types")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tpub")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            definitions_root: default_definitions_root(),
            data_dir: default_data_dir(),
            state_dir: default_state_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_scope")]
    pub scope: String,
}

fn default_scope() -> String {
    "types".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            scope: default_scope(),
        }
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processes: Option<usize>,
    #[serde(default = "default_crash_recovery")]
    pub crash_recovery: bool,
    /// Ceiling handed to workers on normal runs; unset means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_ceiling_mb: Option<u64>,
    #[serde(default = "default_crash_recovery_memory_ceiling_mb")]
    pub crash_recovery_memory_ceiling_mb: u64,
    #[serde(default = "default_oom_exit_code")]
    pub oom_exit_code: i32,
    /// Wall-clock budget for a whole pool run.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "humantime_serde")]
    pub soft_timeout: Option<Duration>,
}

fn default_crash_recovery() -> bool {
    true
}

fn default_crash_recovery_memory_ceiling_mb() -> u64 {
    DEFAULT_CRASH_RECOVERY_MEMORY_CEILING_MB
}

fn default_oom_exit_code() -> i32 {
    DEFAULT_OOM_EXIT_CODE
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            processes: None,
            crash_recovery: default_crash_recovery(),
            memory_ceiling_mb: None,
            crash_recovery_memory_ceiling_mb: default_crash_recovery_memory_ceiling_mb(),
            oom_exit_code: default_oom_exit_code(),
            soft_timeout: None,
        }
    }
}

/// Load configuration from a directory
pub fn load_config(dir: &Path) -> Result<Config> {
    load_config_from_file(&config_path(dir))
}

/// Load configuration from a specific file path. A missing file yields defaults.
pub fn load_config_from_file(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;

    if config.pool.processes == Some(0) {
        anyhow::bail!("{}: pool.processes must be at least 1", path.display());
    }

    Ok(config)
}

/// Find configuration file by walking up the directory tree
pub fn find_config(start_dir: &Path) -> Option<PathBuf> {
    start_dir
        .ancestors()
        .map(config_path)
        .find(|candidate| candidate.exists())
}
