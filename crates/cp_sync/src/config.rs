//! Runtime configuration for the sync engine

use cp_common::Collection;
use cp_config::Config;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Heuristic dedup window. Tuned empirically, not a guaranteed-correct
    /// bound: an echo arriving later than this is inserted and later folded
    /// by the write acknowledgment instead.
    pub dedup_window: Duration,

    /// Period of the background offline-queue flush (default: 30 seconds)
    pub flush_interval: Duration,

    /// Log collections keep only this many newest entries
    pub max_log_entries: usize,

    /// Collections subscribed on `start_sync`
    pub tracked: Vec<Collection>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SyncConfig {
    /// Runtime form of the `[sync]` and `[cache]` sections
    pub fn from_config(config: &Config) -> Self {
        Self {
            dedup_window: Duration::from_millis(config.sync.dedup_window_ms),
            flush_interval: Duration::from_secs(config.sync.flush_interval_secs),
            max_log_entries: config.cache.max_log_entries,
            tracked: config.sync.tracked.clone(),
        }
    }

    /// Load config from a TOML file in the workspace config format
    pub fn from_toml(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        let config = Config::parse(&content)?;
        Ok(Self::from_config(&config))
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_max_log_entries(mut self, max: usize) -> Self {
        self.max_log_entries = max;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dedup_window.is_zero() {
            anyhow::bail!("dedup_window must be greater than zero");
        }
        if self.flush_interval.is_zero() {
            anyhow::bail!("flush_interval must be greater than zero");
        }
        if self.max_log_entries == 0 {
            anyhow::bail!("max_log_entries must be greater than zero");
        }
        if self.tracked.is_empty() {
            anyhow::bail!("at least one collection must be tracked");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.dedup_window, Duration::from_secs(5));
        assert_eq!(config.flush_interval, Duration::from_secs(30));
        assert_eq!(config.tracked.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = SyncConfig::default().with_dedup_window(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = SyncConfig {
            tracked: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml() {
        let temp = assert_fs::TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[sync]\ndedup_window_ms = 1500\n[cache]\nmax_log_entries = 20\n")
            .unwrap();

        let config = SyncConfig::from_toml(&path).unwrap();
        assert_eq!(config.dedup_window, Duration::from_millis(1500));
        assert_eq!(config.max_log_entries, 20);
    }
}
