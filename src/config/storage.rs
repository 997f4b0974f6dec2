//! Persistent usage statistics
//!
//! Counts of notable git subcommands, kept as JSON in the data directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{ConfigError, Result};
use crate::git::UsageCounter;

use super::Config;

/// Subcommand counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Calls per subcommand
    #[serde(default)]
    pub counts: BTreeMap<String, u64>,

    /// Last time any counter moved
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    /// Application version that last wrote this file
    #[serde(default)]
    pub version: String,

    #[serde(skip)]
    stats_path: Option<PathBuf>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    /// Load stats from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Config::usage_file_path()?)
    }

    /// Load stats from a specific path; a missing file is an empty record
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            let mut stats = Self::new();
            stats.stats_path = Some(path.to_path_buf());
            return Ok(stats);
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to read usage file: {}", e)))?;

        let mut stats: UsageStats = serde_json::from_str(&content)
            .map_err(|e| ConfigError::LoadFailed(format!("Failed to parse usage file: {}", e)))?;

        stats.version = env!("CARGO_PKG_VERSION").to_string();
        stats.stats_path = Some(path.to_path_buf());
        Ok(stats)
    }

    /// Load stats from `path`, starting over when the file is unreadable
    pub fn load_or_reset(path: &Path) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            warn!(path = %path.display(), "discarding usage stats: {}", e);
            let mut stats = Self::new();
            stats.stats_path = Some(path.to_path_buf());
            stats
        })
    }

    /// Save to the remembered location (or default if none)
    pub fn save(&self) -> Result<()> {
        let path = match &self.stats_path {
            Some(p) => p.clone(),
            None => Config::usage_file_path()?,
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::SaveFailed(format!("Failed to create data directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to serialize usage: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::SaveFailed(format!("Failed to write usage file: {}", e)))?;

        Ok(())
    }

    /// Count one call of `subcommand`
    pub fn record(&mut self, subcommand: &str) {
        *self.counts.entry(subcommand.to_string()).or_default() += 1;
        self.updated_at = Some(Utc::now());
    }

    pub fn count(&self, subcommand: &str) -> u64 {
        self.counts.get(subcommand).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Counters, most used first
    pub fn ranked(&self) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> = self.counts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(b.0)));
        ranked
    }

    /// A usage callback that records into these stats.
    ///
    /// The callback only queues the subcommand; a background task owns the
    /// stats and writes them back off the runtime threads. Write failures
    /// are logged. Must be called inside a tokio runtime.
    pub fn into_counter(mut self) -> UsageCounter {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(subcommand) = rx.recv().await {
                self.record(&subcommand);
                // One write for everything queued meanwhile
                while let Ok(subcommand) = rx.try_recv() {
                    self.record(&subcommand);
                }

                let snapshot = self.clone();
                match tokio::task::spawn_blocking(move || snapshot.save()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("failed to persist usage stats: {}", e),
                    Err(e) => warn!("usage stats writer failed: {}", e),
                }
            }
            debug!("usage counter closed");
        });

        Arc::new(move |subcommand: &str| {
            let _ = tx.send(subcommand.to_string());
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_new_stats() {
        let stats = UsageStats::new();
        assert!(stats.counts.is_empty());
        assert_eq!(stats.total(), 0);
        assert!(stats.updated_at.is_none());
    }

    #[test]
    fn test_record_and_rank() {
        let mut stats = UsageStats::new();
        for subcommand in ["fetch", "push", "fetch", "commit", "fetch", "push"] {
            stats.record(subcommand);
        }

        assert_eq!(stats.count("fetch"), 3);
        assert_eq!(stats.count("status"), 0);
        assert_eq!(stats.total(), 6);
        assert_eq!(stats.ranked(), vec![("fetch", 3), ("push", 2), ("commit", 1)]);
        assert!(stats.updated_at.is_some());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let stats = UsageStats::load_from(&temp_dir.path().join("usage.json")).unwrap();
        assert_eq!(stats.total(), 0);
    }

    async fn wait_for_count(path: &Path, subcommand: &str, expected: u64) -> UsageStats {
        for _ in 0..500 {
            if let Ok(stats) = UsageStats::load_from(path) {
                if stats.count(subcommand) == expected {
                    return stats;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("usage file never reached {} x {}", expected, subcommand);
    }

    #[tokio::test]
    async fn test_counter_persists_in_the_background() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("usage.json");

        let counter = UsageStats::load_from(&path).unwrap().into_counter();
        counter("checkout");
        counter("push");
        counter("push");

        let loaded = wait_for_count(&path, "push", 2).await;
        assert_eq!(loaded.count("checkout"), 1);
    }

    #[tokio::test]
    async fn test_counter_survives_unwritable_location() {
        let temp_dir = TempDir::new().unwrap();
        let blocker = temp_dir.path().join("file");
        std::fs::write(&blocker, "").unwrap();

        let counter = UsageStats::load_from(&blocker.join("usage.json")).unwrap().into_counter();
        counter("fetch");
        counter("fetch");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        counter("fetch");
    }

    #[test]
    fn test_corrupt_file_is_reset() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("usage.json");
        std::fs::write(&path, "{not json").unwrap();

        let stats = UsageStats::load_or_reset(&path);
        assert_eq!(stats.total(), 0);
        stats.save().unwrap();
        assert_eq!(UsageStats::load_from(&path).unwrap().total(), 0);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("usage.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = UsageStats::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse usage file"));
    }
}
