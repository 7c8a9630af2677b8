//! Runtime configuration.
//!
//! Every field has a default; `from_env` overrides the ones operators usually tune.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use fieldqueue_core::RetryPolicy;
use fieldqueue_observability::LogConfig;
use serde::{Deserialize, Serialize};

const ENV_DB_PATH: &str = "FIELDQUEUE_DB_PATH";
const ENV_SYNC_INTERVAL: &str = "FIELDQUEUE_SYNC_INTERVAL_SECS";
const ENV_SUBMIT_TIMEOUT: &str = "FIELDQUEUE_SUBMIT_TIMEOUT_SECS";
const ENV_MAX_ATTEMPTS: &str = "FIELDQUEUE_MAX_ATTEMPTS";
const ENV_CONFLICT_WINDOW: &str = "FIELDQUEUE_CONFLICT_WINDOW_SECS";
const ENV_QUOTA: &str = "FIELDQUEUE_STORAGE_QUOTA_BYTES";
const ENV_CLEANUP_THRESHOLD: &str = "FIELDQUEUE_CLEANUP_THRESHOLD";
const ENV_LOG: &str = "FIELDQUEUE_LOG";

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// SQLite database file. `None` means `{data_dir}/fieldqueue/queue.db`.
    pub database_path: Option<PathBuf>,
    pub sync: SyncConfig,
    pub conflicts: ConflictConfig,
    pub storage: StorageConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Period of the background flush loop.
    pub interval: Duration,
    /// Upper bound of a single remote submission.
    pub submit_timeout: Duration,
    pub retry: RetryPolicy,
    /// Consecutive transient failures after which the rest of a pass is skipped.
    pub circuit_breaker_threshold: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            submit_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            circuit_breaker_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Records with the same correlation key closer than this are the same submission.
    pub window: Duration,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub quota_bytes: u64,
    /// Fraction of the quota above which cleanup is needed.
    pub cleanup_threshold: f64,
    /// Fraction of the quota a pressured cleanup aims to get under.
    pub cleanup_target: f64,
    pub cache_max_age: Duration,
    pub metadata_retention: Duration,
    pub synced_job_retention: Duration,
    pub sample_interval: Duration,
    pub trend_horizon: Duration,
    /// Period of the background maintenance loop.
    pub check_interval: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            quota_bytes: 512 * 1024 * 1024,
            cleanup_threshold: 0.8,
            cleanup_target: 0.6,
            cache_max_age: 7 * DAY,
            metadata_retention: 7 * DAY,
            synced_job_retention: 7 * DAY,
            sample_interval: Duration::from_secs(60 * 60),
            trend_horizon: 7 * DAY,
            check_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl OfflineConfig {
    /// Defaults overridden by `FIELDQUEUE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`OfflineConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SYNC_INTERVAL) {
            config.sync.interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SUBMIT_TIMEOUT) {
            config.sync.submit_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(attempts) = parse_var::<u32>(&lookup, ENV_MAX_ATTEMPTS) {
            config.sync.retry.max_attempts = attempts;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_CONFLICT_WINDOW) {
            config.conflicts.window = Duration::from_secs(secs);
        }
        if let Some(bytes) = parse_var::<u64>(&lookup, ENV_QUOTA) {
            config.storage.quota_bytes = bytes;
        }
        match parse_var::<f64>(&lookup, ENV_CLEANUP_THRESHOLD) {
            Some(threshold) if threshold > 0.0 && threshold <= 1.0 => {
                config.storage.cleanup_threshold = threshold;
                config.storage.cleanup_target = config.storage.cleanup_target.min(threshold);
            }
            Some(threshold) => {
                tracing::warn!(threshold, "{ENV_CLEANUP_THRESHOLD} must be in (0, 1]; keeping default");
            }
            None => {}
        }
        if let Some(filter) = lookup(ENV_LOG).filter(|f| !f.trim().is_empty()) {
            config.log.filter = filter;
        }

        config
    }

    /// Install the process-wide tracing subscriber described by `log`. Idempotent.
    pub fn init_logging(&self) {
        fieldqueue_observability::init_with(&self.log);
    }

    /// Configured database path, or the default under the OS data directory.
    pub fn resolve_database_path(&self) -> anyhow::Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => default_database_path(),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "unparsable configuration value; keeping default");
            None
        }
    }
}

fn default_database_path() -> anyhow::Result<PathBuf> {
    let mut dir = dirs::data_dir()
        .or_else(|| {
            dirs::home_dir().map(|mut h| {
                h.push(".local");
                h.push("share");
                h
            })
        })
        .context("failed to resolve OS app data directory - tried data_dir() and home_dir()/.local/share")?;

    dir.push("fieldqueue");
    dir.push("queue.db");
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = OfflineConfig::default();
        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.sync.retry.max_attempts, 5);
        assert_eq!(config.sync.circuit_breaker_threshold, 3);
        assert_eq!(config.conflicts.window, Duration::from_secs(300));
        assert_eq!(config.storage.cleanup_threshold, 0.8);
        assert_eq!(config.storage.cleanup_target, 0.6);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = OfflineConfig::from_lookup(lookup(&[
            (ENV_DB_PATH, "/tmp/q.db"),
            (ENV_SYNC_INTERVAL, "15"),
            (ENV_MAX_ATTEMPTS, "8"),
            (ENV_CONFLICT_WINDOW, "120"),
            (ENV_QUOTA, "1048576"),
            (ENV_CLEANUP_THRESHOLD, "0.5"),
            (ENV_LOG, "fieldqueue_offline=debug"),
        ]));

        assert_eq!(config.database_path, Some(PathBuf::from("/tmp/q.db")));
        assert_eq!(config.sync.interval, Duration::from_secs(15));
        assert_eq!(config.sync.retry.max_attempts, 8);
        assert_eq!(config.conflicts.window, Duration::from_secs(120));
        assert_eq!(config.storage.quota_bytes, 1_048_576);
        assert_eq!(config.storage.cleanup_threshold, 0.5);
        assert_eq!(config.storage.cleanup_target, 0.5);
        assert_eq!(config.log.filter, "fieldqueue_offline=debug");
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        let config = OfflineConfig::from_lookup(lookup(&[
            (ENV_SYNC_INTERVAL, "soon"),
            (ENV_CLEANUP_THRESHOLD, "1.5"),
        ]));

        assert_eq!(config.sync.interval, Duration::from_secs(60));
        assert_eq!(config.storage.cleanup_threshold, 0.8);
    }

    #[test]
    fn default_database_lives_under_fieldqueue() {
        let config = OfflineConfig::default();
        if let Ok(path) = config.resolve_database_path() {
            assert!(path.ends_with("fieldqueue/queue.db"));
        }
    }
}
