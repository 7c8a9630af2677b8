//! In-memory store for tests, dev, and the degraded fallback.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldqueue_core::{Job, JobFilter, JobId, MediaAttachment};
use serde_json::Value;

use super::{CacheEntry, CacheStore, Evicted, JobStore, JobUsage, Namespace, Usage, payload_size};
use crate::error::StoreError;

#[derive(Debug, Default)]
struct State {
    next_seq: u64,
    jobs: HashMap<JobId, StoredJob>,
    attachments: HashMap<JobId, Vec<MediaAttachment>>,
    entries: BTreeMap<(Namespace, String), CacheEntry>,
}

#[derive(Debug)]
struct StoredJob {
    seq: u64,
    size: u64,
    job: Job,
}

impl State {
    fn is_synced(&self, id: &JobId) -> bool {
        self.jobs.get(id).is_some_and(|s| s.job.synced())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::unavailable("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::unavailable("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert(&self, job: Job, attachments: Vec<MediaAttachment>) -> Result<(), StoreError> {
        let (_, size) = payload_size(&job)?;
        let mut state = self.write()?;
        if state.jobs.contains_key(&job.id) {
            return Err(StoreError::Duplicate(job.id));
        }

        let id = job.id;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(id, StoredJob { seq, size, job });
        if !attachments.is_empty() {
            state.attachments.insert(id, attachments);
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).map(|s| s.job.clone()))
    }

    async fn get_jobs(&self, filter: JobFilter) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut matching: Vec<&StoredJob> = state
            .jobs
            .values()
            .filter(|s| filter.matches(&s.job))
            .collect();
        matching.sort_by_key(|s| (s.job.created_at, s.seq));
        Ok(matching.into_iter().map(|s| s.job.clone()).collect())
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.jobs.values().filter(|s| !s.job.synced()).count())
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        let (_, size) = payload_size(job)?;
        let mut state = self.write()?;
        let stored = state.jobs.get_mut(&job.id).ok_or(StoreError::NotFound(job.id))?;
        stored.job = job.clone();
        stored.size = size;
        Ok(())
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, StoreError> {
        let mut state = self.write()?;
        state.attachments.remove(&id);
        Ok(state.jobs.remove(&id).is_some())
    }

    async fn attachments(&self, job_id: JobId) -> Result<Vec<MediaAttachment>, StoreError> {
        Ok(self
            .read()?
            .attachments
            .get(&job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn usage(&self) -> Result<JobUsage, StoreError> {
        let state = self.read()?;
        let mut usage = JobUsage::default();

        for stored in state.jobs.values() {
            add(&mut usage.records, stored.size);
            if !stored.job.synced() {
                add(&mut usage.pending_records, stored.size);
            }
        }
        for (job_id, attachments) in &state.attachments {
            let synced = state.is_synced(job_id);
            for attachment in attachments {
                add(&mut usage.attachments, attachment.size);
                if synced {
                    add(&mut usage.synced_attachments, attachment.size);
                }
            }
        }
        Ok(usage)
    }

    async fn evict_synced_attachments(
        &self,
        exclude: &HashSet<JobId>,
    ) -> Result<Evicted, StoreError> {
        let mut state = self.write()?;
        let evictable: Vec<JobId> = state
            .attachments
            .keys()
            .filter(|id| !exclude.contains(id) && state.is_synced(id))
            .copied()
            .collect();

        let mut evicted = Evicted::default();
        for id in evictable {
            for attachment in state.attachments.remove(&id).unwrap_or_default() {
                add(&mut evicted, attachment.size);
            }
        }
        Ok(evicted)
    }

    async fn purge_synced_jobs(
        &self,
        older_than: DateTime<Utc>,
        exclude: &HashSet<JobId>,
    ) -> Result<Evicted, StoreError> {
        let mut state = self.write()?;
        let purgeable: Vec<JobId> = state
            .jobs
            .values()
            .filter(|s| {
                s.job.synced()
                    && s.job.synced_at.is_some_and(|at| at < older_than)
                    && !exclude.contains(&s.job.id)
            })
            .map(|s| s.job.id)
            .collect();

        let mut evicted = Evicted::default();
        for id in purgeable {
            if let Some(stored) = state.jobs.remove(&id) {
                add(&mut evicted, stored.size);
            }
            for attachment in state.attachments.remove(&id).unwrap_or_default() {
                add(&mut evicted, attachment.size);
            }
        }
        Ok(evicted)
    }
}

#[async_trait]
impl CacheStore for InMemoryStore {
    async fn put_at(
        &self,
        ns: Namespace,
        key: &str,
        value: &Value,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let entry = CacheEntry::new(key, value.clone(), at);
        self.write()?.entries.insert((ns, key.to_string()), entry);
        Ok(())
    }

    async fn get(
        &self,
        ns: Namespace,
        key: &str,
        max_age: Option<chrono::Duration>,
    ) -> Result<Option<Value>, StoreError> {
        let state = self.read()?;
        Ok(state
            .entries
            .get(&(ns, key.to_string()))
            .filter(|e| max_age.is_none_or(|age| Utc::now() - e.updated_at <= age))
            .map(|e| e.value.clone()))
    }

    async fn list(&self, ns: Namespace, prefix: &str) -> Result<Vec<CacheEntry>, StoreError> {
        let state = self.read()?;
        let mut entries: Vec<CacheEntry> = state
            .entries
            .iter()
            .filter(|((n, key), _)| *n == ns && key.starts_with(prefix))
            .map(|(_, e)| e.clone())
            .collect();
        entries.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.key.cmp(&b.key)));
        Ok(entries)
    }

    async fn remove(&self, ns: Namespace, key: &str) -> Result<bool, StoreError> {
        Ok(self.write()?.entries.remove(&(ns, key.to_string())).is_some())
    }

    async fn evict_older_than(
        &self,
        ns: Namespace,
        prefix: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Evicted, StoreError> {
        let mut state = self.write()?;
        let mut evicted = Evicted::default();
        state.entries.retain(|(n, key), entry| {
            let stale = *n == ns && key.starts_with(prefix) && entry.updated_at < cutoff;
            if stale {
                add(&mut evicted, entry.size);
            }
            !stale
        });
        Ok(evicted)
    }

    async fn usage_in(&self, ns: Namespace) -> Result<Usage, StoreError> {
        let state = self.read()?;
        let mut usage = Usage::default();
        for ((n, _), entry) in &state.entries {
            if *n == ns {
                add(&mut usage, entry.size);
            }
        }
        Ok(usage)
    }
}

fn add(usage: &mut Usage, bytes: u64) {
    usage.items += 1;
    usage.bytes += bytes;
}
