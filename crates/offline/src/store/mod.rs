//! Durable local persistence for jobs, attachments and key/value entries.
//!
//! Two implementations share the traits below: [`SqliteStore`] for production and
//! [`InMemoryStore`] for tests and as the degraded fallback when SQLite is unusable.
//! The eviction primitives only ever touch jobs whose status is `synced`; unsynced jobs
//! are the only record of unconfirmed user work.

mod memory;
mod sqlite;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use fieldqueue_core::{Job, JobFilter, JobId, JobPayload, MediaAttachment, NewAttachment};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use crate::config::OfflineConfig;
use crate::error::StoreError;

/// Persistence of queued jobs and their attachments.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a fully-formed job together with its attachments, atomically.
    async fn insert(&self, job: Job, attachments: Vec<MediaAttachment>) -> Result<(), StoreError>;

    /// Enqueue a new pending job for `payload`; the payload variant decides the kind.
    async fn add_job(
        &self,
        payload: JobPayload,
        attachments: Vec<NewAttachment>,
    ) -> Result<JobId, StoreError> {
        let job = Job::new(payload);
        let (id, created_at) = (job.id, job.created_at);
        let attachments = attachments
            .into_iter()
            .map(|a| a.into_attachment(id, created_at))
            .collect();

        self.insert(job, attachments).await?;
        Ok(id)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Matching jobs, FIFO by creation time then insertion order.
    async fn get_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Number of unsynced jobs (pending, rejected and stalled).
    async fn pending_count(&self) -> Result<usize, StoreError>;

    /// Replace the mutable state of an existing job.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job and its attachments. Returns whether the job existed.
    async fn remove_job(&self, id: JobId) -> Result<bool, StoreError>;

    async fn attachments(&self, job_id: JobId) -> Result<Vec<MediaAttachment>, StoreError>;

    async fn usage(&self) -> Result<JobUsage, StoreError>;

    /// Delete the attachments of synced jobs, except those of `exclude`.
    async fn evict_synced_attachments(
        &self,
        exclude: &HashSet<JobId>,
    ) -> Result<Evicted, StoreError>;

    /// Delete synced jobs confirmed before `older_than`, except those of `exclude`.
    async fn purge_synced_jobs(
        &self,
        older_than: DateTime<Utc>,
        exclude: &HashSet<JobId>,
    ) -> Result<Evicted, StoreError>;

    async fn mark_synced(&self, id: JobId, remote_id: Option<String>) -> Result<Job, StoreError> {
        let mut job = self.get_job(id).await?.ok_or(StoreError::NotFound(id))?;
        job.mark_synced(remote_id, Utc::now());
        self.update(&job).await?;
        Ok(job)
    }

    /// Count a failed attempt and remember the error. Scheduling is up to the caller.
    async fn record_failure(&self, id: JobId, error: &str) -> Result<Job, StoreError> {
        let mut job = self.get_job(id).await?.ok_or(StoreError::NotFound(id))?;
        job.record_failure(error);
        self.update(&job).await?;
        Ok(job)
    }
}

/// Namespaces of the key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Cached remote snapshots.
    Cache,
    /// Sync bookkeeping, e.g. storage usage samples.
    Metadata,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Cache => "cache",
            Namespace::Metadata => "metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
    /// Bytes accounted for this entry (key plus serialized value).
    pub size: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: Value, updated_at: DateTime<Utc>) -> Self {
        let key = key.into();
        let size = entry_size(&key, &value);
        Self {
            key,
            value,
            updated_at,
            size,
        }
    }
}

/// Namespaced key/value entries with timestamps.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn put_at(
        &self,
        ns: Namespace,
        key: &str,
        value: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn put(&self, ns: Namespace, key: &str, value: &Value) -> Result<(), StoreError> {
        self.put_at(ns, key, value, Utc::now()).await
    }

    /// Entry value, unless it is older than `max_age`.
    async fn get(
        &self,
        ns: Namespace,
        key: &str,
        max_age: Option<chrono::Duration>,
    ) -> Result<Option<Value>, StoreError>;

    /// Entries whose key starts with `prefix`, oldest first.
    async fn list(&self, ns: Namespace, prefix: &str) -> Result<Vec<CacheEntry>, StoreError>;

    async fn remove(&self, ns: Namespace, key: &str) -> Result<bool, StoreError>;

    /// Delete entries under `prefix` last updated before `cutoff`.
    async fn evict_older_than(
        &self,
        ns: Namespace,
        prefix: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Evicted, StoreError>;

    async fn usage_in(&self, ns: Namespace) -> Result<Usage, StoreError>;
}

/// Item count and bytes of one storage category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub items: u64,
    pub bytes: u64,
}

/// What an eviction primitive removed.
pub type Evicted = Usage;

/// Accounting of the job tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUsage {
    /// All job records (serialized payload bytes).
    pub records: Usage,
    /// Unsynced job records.
    pub pending_records: Usage,
    pub attachments: Usage,
    /// Attachments owned by synced jobs; the first thing cleanup reclaims.
    pub synced_attachments: Usage,
}

impl JobUsage {
    /// Bytes of unsynced work, records plus their attachments.
    pub fn pending_bytes(&self) -> u64 {
        let pending_attachments = self
            .attachments
            .bytes
            .saturating_sub(self.synced_attachments.bytes);
        self.pending_records.bytes + pending_attachments
    }
}

/// Opened store handles.
#[derive(Clone)]
pub struct Stores {
    pub jobs: Arc<dyn JobStore>,
    pub cache: Arc<dyn CacheStore>,
    /// Set when persistence failed to open and state lives in memory only.
    pub degraded: bool,
}

impl Stores {
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            jobs: store.clone(),
            cache: store,
            degraded: false,
        }
    }
}

impl core::fmt::Debug for Stores {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Stores")
            .field("degraded", &self.degraded)
            .finish_non_exhaustive()
    }
}

/// Open the SQLite store, falling back to memory when it cannot be opened.
pub async fn open_stores(config: &OfflineConfig) -> Stores {
    let opened = match config.resolve_database_path() {
        Ok(path) => SqliteStore::open(&path).await,
        Err(err) => Err(StoreError::from(err)),
    };

    match opened {
        Ok(store) => {
            let store = Arc::new(store);
            Stores {
                jobs: store.clone(),
                cache: store,
                degraded: false,
            }
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                "job store unavailable; falling back to in-memory state, queued work will not survive a restart"
            );
            Stores {
                degraded: true,
                ..Stores::in_memory()
            }
        }
    }
}

/// Fixed-width timestamp text, so lexical order is chronological order.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn entry_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

pub(crate) fn payload_size(job: &Job) -> Result<(String, u64), StoreError> {
    let payload = job
        .payload_json()
        .map_err(|e| StoreError::corrupt(format!("unserializable payload for job {}: {e}", job.id)))?;
    let size = payload.len() as u64;
    Ok((payload, size))
}
