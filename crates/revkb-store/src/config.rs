//! Knowledge base configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for one `KnowledgeBase` instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KbConfig {
    /// Upper bound for waiting on an in-progress commit or refetch. Also the
    /// interval at which a publisher waiting for its listener turn logs.
    pub refetch_timeout_ms: u64,
    /// Author recorded for commits whose session did not set one.
    pub default_author: String,
    /// Prune superseded values of live items once no session can observe them.
    pub cleanup_history: bool,
    /// Write-ahead log of the backing database (CLI and embedded use).
    pub wal_path: Option<PathBuf>,
    /// fsync every WAL frame.
    pub sync_wal: bool,
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Retries after the first attempt for retryable storage failures.
    pub retry_count: u32,
    /// Linear back-off step between retries.
    pub retry_backoff_ms: u64,
    pub max_idle_connections: usize,
    /// How long `begin` waits for another writer to finish.
    pub writer_timeout_ms: u64,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            refetch_timeout_ms: 30_000,
            default_author: "system".to_string(),
            cleanup_history: true,
            wal_path: None,
            sync_wal: true,
            pool: PoolConfig::default(),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_backoff_ms: 10,
            max_idle_connections: 8,
            writer_timeout_ms: 30_000,
        }
    }
}

impl KbConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    #[must_use]
    pub fn refetch_timeout(&self) -> Duration {
        Duration::from_millis(self.refetch_timeout_ms)
    }
}

impl PoolConfig {
    #[must_use]
    pub fn writer_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("revkb.json");
        std::fs::write(&path, r#"{ "refetch_timeout_ms": 250, "pool": { "retry_count": 1 } }"#)
            .unwrap();

        let config = KbConfig::from_json_file(&path).unwrap();
        assert_eq!(config.refetch_timeout(), Duration::from_millis(250));
        assert_eq!(config.pool.retry_count, 1);
        assert_eq!(config.pool.max_idle_connections, 8);
        assert_eq!(config.pool.writer_timeout(), Duration::from_secs(30));
        assert_eq!(config.default_author, "system");
    }
}
