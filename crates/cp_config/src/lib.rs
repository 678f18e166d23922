//! Configuration management for ClassPoints
//!
//! This crate handles loading `.classpoints/config.toml`. Every section and
//! every key is optional; a missing file yields the defaults.

use cp_common::{Collection, CpError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Directory holding config and cache, relative to the workspace root
pub const CONFIG_DIR: &str = ".classpoints";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Workspace root (set programmatically, not in TOML)
    #[serde(skip)]
    pub root: PathBuf,

    /// Sync settings
    #[serde(default)]
    pub sync: SyncSection,

    /// Local cache settings
    #[serde(default)]
    pub cache: CacheSection,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Sync configuration ([sync])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSection {
    /// Window within which an unconfirmed local record may be matched to
    /// an inbound remote record with the same subject and discriminant
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,

    /// Period of the background offline-queue flush
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Collections that get a live subscription on `start_sync`
    #[serde(default = "default_tracked")]
    pub tracked: Vec<Collection>,
}

fn default_dedup_window_ms() -> u64 {
    5_000
}
fn default_flush_interval_secs() -> u64 {
    30
}
fn default_tracked() -> Vec<Collection> {
    Collection::ALL.to_vec()
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            dedup_window_ms: default_dedup_window_ms(),
            flush_interval_secs: default_flush_interval_secs(),
            tracked: default_tracked(),
        }
    }
}

/// Cache configuration ([cache])
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// SQLite file, relative to the workspace root
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// Log collections keep only this many newest entries
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("cache.db")
}
fn default_max_log_entries() -> usize {
    500
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            max_log_entries: default_max_log_entries(),
        }
    }
}

/// Logging configuration ([logging])
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub json: bool,
}

impl Config {
    /// Load configuration from workspace root
    pub fn load(workspace_root: &Path) -> Result<Self> {
        let config_path = workspace_root.join(CONFIG_DIR).join("config.toml");

        if !config_path.exists() {
            tracing::debug!("No config at {:?}, using defaults", config_path);
            return Ok(Self {
                root: workspace_root.to_path_buf(),
                ..Self::default()
            });
        }

        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| CpError::ConfigError(format!("Failed to read config: {}", e)))?;

        let mut config = Self::parse(&content)?;
        config.root = workspace_root.to_path_buf();
        Ok(config)
    }

    /// Parse a TOML document without touching the filesystem
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| CpError::ConfigError(format!("Failed to parse config: {}", e)))
    }

    /// Absolute location of the cache database
    pub fn cache_path(&self) -> PathBuf {
        if self.cache.path.is_absolute() {
            self.cache.path.clone()
        } else {
            self.root.join(&self.cache.path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = assert_fs::TempDir::new().unwrap();
        let config = Config::load(temp.path()).unwrap();

        assert_eq!(config.sync.dedup_window_ms, 5_000);
        assert_eq!(config.sync.tracked.len(), 4);
        assert_eq!(config.cache.max_log_entries, 500);
        assert_eq!(config.cache_path(), temp.path().join(".classpoints/cache.db"));
    }

    #[test]
    fn test_partial_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".classpoints/config.toml")
            .write_str(
                r#"
[sync]
dedup_window_ms = 2000
tracked = ["praise_log", "emotion_log"]

[logging]
json = true
"#,
            )
            .unwrap();

        let config = Config::load(temp.path()).unwrap();
        assert_eq!(config.sync.dedup_window_ms, 2_000);
        assert_eq!(
            config.sync.tracked,
            vec![Collection::PraiseLog, Collection::EmotionLog]
        );
        assert_eq!(config.sync.flush_interval_secs, 30);
        assert!(config.logging.json);
        assert!(!config.logging.verbose);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let err = Config::parse("[sync]\ndedup_window_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, CpError::ConfigError(_)));

        let err = Config::parse("[sync]\ntracked = [\"homework\"]").unwrap_err();
        assert!(matches!(err, CpError::ConfigError(_)));
    }
}
