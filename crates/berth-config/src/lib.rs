//! # berth-config
//!
//! Configuration for the berth storage engine.
//!
//! Loads configuration from:
//! 1. `~/.berth/config.toml` (global)
//! 2. An explicit config file, when one is passed
//! 3. Environment variables (highest priority)

pub mod logging;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Default grace before an unreferenced blob or stale upload session may be
/// reclaimed by the garbage collector.
pub const DEFAULT_GC_DELAY_SECS: u64 = 3600;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage root; every repository lives under this directory.
    pub root_directory: PathBuf,
    /// Share identical blobs across repositories via hard links.
    pub dedupe: bool,
    /// Run the per-repository garbage collector.
    pub gc: bool,
    /// Minimum age (seconds) before GC reclaims unreferenced content.
    pub gc_delay_secs: u64,
    /// Fsync engine-written files before rename/return.
    pub commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from("/var/lib/berth"),
            dedupe: true,
            gc: true,
            gc_delay_secs: DEFAULT_GC_DELAY_SECS,
            commit: true,
        }
    }
}

impl StorageConfig {
    pub fn gc_delay(&self) -> Duration {
        Duration::from_secs(self.gc_delay_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load config from the global location plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                config = Self::from_file(&global_path)?;
            }
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a specific TOML file, then apply environment
    /// overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: `~/.berth/config.toml`.
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".berth/config.toml"))
    }

    /// Apply environment variable overrides (highest priority).
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("BERTH_ROOT_DIR") {
            self.storage.root_directory = PathBuf::from(root);
        }
        if let Ok(dedupe) = std::env::var("BERTH_DEDUPE") {
            if let Ok(value) = dedupe.parse() {
                self.storage.dedupe = value;
            }
        }
        if let Ok(gc) = std::env::var("BERTH_GC") {
            if let Ok(value) = gc.parse() {
                self.storage.gc = value;
            }
        }
        if let Ok(delay) = std::env::var("BERTH_GC_DELAY_SECS") {
            if let Ok(secs) = delay.parse() {
                self.storage.gc_delay_secs = secs;
            }
        }
        if let Ok(commit) = std::env::var("BERTH_COMMIT") {
            if let Ok(value) = commit.parse() {
                self.storage.commit = value;
            }
        }
        if let Ok(level) = std::env::var("BERTH_LOG") {
            self.log.level = level;
        }
    }
}
