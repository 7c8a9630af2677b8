//! Collaborator seams towards the remote authority.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldqueue_core::{EntityStatus, Job, JobId, MediaAttachment, RecordState, RemoteRecord};
use serde::{Deserialize, Serialize};

use crate::error::SubmitError;

/// Confirmation returned by the remote authority for an accepted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReceipt {
    pub remote_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

/// Submits one job to the remote authority.
#[async_trait]
pub trait SubmitHandler: Send + Sync {
    async fn submit(
        &self,
        job: &Job,
        attachments: &[MediaAttachment],
    ) -> Result<RemoteReceipt, SubmitError>;
}

/// Confirmed records of one owning entity within a time range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordQuery {
    pub entity: String,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

/// One consistent read of the remote state of an entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSnapshot {
    pub records: Vec<RemoteRecord>,
    #[serde(default)]
    pub entity_status: EntityStatus,
}

/// Reads authoritative records for conflict detection.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
    async fn confirmed_records(&self, query: &RecordQuery) -> Result<RemoteSnapshot, SubmitError>;
}

/// Submit through `submitter`, turning an elapsed `timeout` into a transient failure.
pub(crate) async fn submit_with_timeout(
    submitter: &dyn SubmitHandler,
    job: &Job,
    attachments: &[MediaAttachment],
    timeout: Duration,
) -> Result<RemoteReceipt, SubmitError> {
    match tokio::time::timeout(timeout, submitter.submit(job, attachments)).await {
        Ok(result) => result,
        Err(_) => Err(SubmitError::Timeout(timeout)),
    }
}

/// Scriptable in-process remote authority for tests and local development.
///
/// Submissions succeed unless an outcome was queued with [`InMemoryRemote::push_failure`];
/// accepted jobs become confirmed records visible to [`RemoteQuery`].
#[derive(Debug, Default)]
pub struct InMemoryRemote {
    state: Mutex<RemoteState>,
}

#[derive(Debug, Default)]
struct RemoteState {
    delay: Duration,
    failures: VecDeque<SubmitError>,
    submitted: Vec<JobId>,
    queries: usize,
    records: Vec<RemoteRecord>,
    entities: HashMap<String, EntityStatus>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every submission by `delay`.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = delay;
        self
    }

    /// Fail the next submission with `error`. Queued failures are consumed in order.
    pub fn push_failure(&self, error: SubmitError) {
        self.lock().failures.push_back(error);
    }

    pub fn add_record(&self, record: RemoteRecord) {
        self.lock().records.push(record);
    }

    pub fn set_entity_status(&self, entity: impl Into<String>, status: EntityStatus) {
        self.lock().entities.insert(entity.into(), status);
    }

    /// Jobs submitted so far, in order, including failed attempts.
    pub fn submitted(&self) -> Vec<JobId> {
        self.lock().submitted.clone()
    }

    pub fn submission_count(&self) -> usize {
        self.lock().submitted.len()
    }

    pub fn query_count(&self) -> usize {
        self.lock().queries
    }

    pub fn records(&self) -> Vec<RemoteRecord> {
        self.lock().records.clone()
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SubmitHandler for InMemoryRemote {
    async fn submit(
        &self,
        job: &Job,
        _attachments: &[MediaAttachment],
    ) -> Result<RemoteReceipt, SubmitError> {
        let delay = {
            let mut state = self.lock();
            state.submitted.push(job.id);
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.failures.pop_front() {
            return Err(error);
        }

        let accepted_at = Utc::now();
        let remote_id = format!("remote-{}", state.records.len() + 1);
        state.records.push(RemoteRecord {
            id: remote_id.clone(),
            kind: job.kind,
            key: job.payload.correlation_key(),
            state: RecordState::Submitted,
            created_at: accepted_at,
            data: job.payload.to_value(),
        });

        Ok(RemoteReceipt {
            remote_id: Some(remote_id),
            accepted_at,
        })
    }
}

#[async_trait]
impl RemoteQuery for InMemoryRemote {
    async fn confirmed_records(&self, query: &RecordQuery) -> Result<RemoteSnapshot, SubmitError> {
        let mut state = self.lock();
        state.queries += 1;

        let records = state
            .records
            .iter()
            .filter(|r| {
                r.key.entity == query.entity
                    && r.created_at >= query.since
                    && r.created_at <= query.until
            })
            .cloned()
            .collect();
        let entity_status = state
            .entities
            .get(&query.entity)
            .copied()
            .unwrap_or(EntityStatus::Active);

        Ok(RemoteSnapshot {
            records,
            entity_status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectionReason;
    use fieldqueue_core::WorkSubmission;

    #[tokio::test]
    async fn accepted_jobs_become_queryable_records() {
        let remote = InMemoryRemote::new();
        let job = Job::new(WorkSubmission::new("0xgarden", 9, "Harvest").into());

        let receipt = remote.submit(&job, &[]).await.unwrap();
        assert_eq!(receipt.remote_id.as_deref(), Some("remote-1"));

        let snapshot = remote
            .confirmed_records(&RecordQuery {
                entity: "0xgarden".into(),
                since: job.created_at - chrono::Duration::minutes(5),
                until: Utc::now() + chrono::Duration::minutes(5),
            })
            .await
            .unwrap();
        assert_eq!(snapshot.records.len(), 1);
        assert_eq!(snapshot.records[0].key, job.payload.correlation_key());
        assert_eq!(snapshot.entity_status, EntityStatus::Active);
    }

    #[tokio::test]
    async fn queued_failures_are_consumed_in_order() {
        let remote = InMemoryRemote::new();
        remote.push_failure(SubmitError::network("offline"));
        remote.push_failure(SubmitError::rejected(RejectionReason::Validation, "bad"));
        let job = Job::new(WorkSubmission::new("0xgarden", 1, "t").into());

        assert!(matches!(remote.submit(&job, &[]).await, Err(SubmitError::Network(_))));
        assert!(matches!(remote.submit(&job, &[]).await, Err(SubmitError::Rejected { .. })));
        assert!(remote.submit(&job, &[]).await.is_ok());
        assert_eq!(remote.submission_count(), 3);
        assert_eq!(remote.records().len(), 1);
    }
}
