//! Job records and their attachments.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{AttachmentId, JobId};
use crate::payload::JobPayload;
use crate::retry::RetryPolicy;

/// Tag selecting payload shape and handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Work,
    Approval,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::Work, JobKind::Approval];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Work => "work",
            JobKind::Approval => "approval",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "work" => Ok(JobKind::Work),
            "approval" => Ok(JobKind::Approval),
            other => Err(DomainError::unknown_tag("job kind", other)),
        }
    }
}

/// Lifecycle of a queued job.
///
/// Everything except `Synced` is unsynced user work and counts as pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for (another) submission attempt.
    Pending,
    /// Confirmed by the remote authority.
    Synced,
    /// Explicitly refused by the remote; not retried automatically.
    Rejected,
    /// Retry budget exhausted; needs a conflict resolution or a manual retry.
    Stalled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Synced => "synced",
            JobStatus::Rejected => "rejected",
            JobStatus::Stalled => "stalled",
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, JobStatus::Synced)
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "synced" => Ok(JobStatus::Synced),
            "rejected" => Ok(JobStatus::Rejected),
            "stalled" => Ok(JobStatus::Stalled),
            other => Err(DomainError::unknown_tag("job status", other)),
        }
    }
}

/// A persisted record of one pending local mutation awaiting remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time the next submission may be attempted (backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub synced_at: Option<DateTime<Utc>>,
    /// Identifier assigned by the remote authority on confirmation.
    pub remote_id: Option<String>,
}

impl Job {
    pub fn new(payload: JobPayload) -> Self {
        Self::created_at(payload, Utc::now())
    }

    /// Build a job with an explicit creation time (imports, replays, tests).
    pub fn created_at(payload: JobPayload, created_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: payload.kind(),
            payload,
            created_at,
            status: JobStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            synced_at: None,
            remote_id: None,
        }
    }

    pub fn synced(&self) -> bool {
        self.status.is_synced()
    }

    /// Whether a flush may attempt this job at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_attempt_at.is_none_or(|at| now >= at)
    }

    pub fn mark_synced(&mut self, remote_id: Option<String>, at: DateTime<Utc>) {
        self.status = JobStatus::Synced;
        self.synced_at = Some(at);
        self.remote_id = remote_id;
        self.next_attempt_at = None;
        self.last_error = None;
    }

    /// Count a failed submission attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.attempts += 1;
        self.last_error = Some(error.into());
    }

    /// Schedule the next attempt after a transient failure, or stall the job once the
    /// retry budget is spent. Returns `true` when the job stalled.
    pub fn schedule_retry(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) -> bool {
        if policy.should_retry(self.attempts) {
            let seed = self.id.as_uuid().as_u128() as u64;
            let delay = policy.delay_for_attempt(self.attempts, seed);
            self.next_attempt_at =
                Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
            self.status = JobStatus::Pending;
            false
        } else {
            self.next_attempt_at = None;
            self.status = JobStatus::Stalled;
            true
        }
    }

    pub fn mark_rejected(&mut self, reason: impl Into<String>) {
        self.status = JobStatus::Rejected;
        self.last_error = Some(reason.into());
        self.next_attempt_at = None;
    }

    /// Put a rejected or stalled job back in line with a fresh retry budget.
    pub fn requeue(&mut self) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.next_attempt_at = None;
    }

    /// Replace the payload (merge / manual resolution). The kind never changes.
    pub fn replace_payload(&mut self, payload: JobPayload) -> Result<(), DomainError> {
        payload.expect_kind(self.kind)?;
        payload.validate()?;
        self.payload = payload;
        self.requeue();
        Ok(())
    }

    /// Serialized payload, as stored and as counted by storage accounting.
    pub fn payload_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.payload)
    }
}

/// Query filter for [`Job`] listings. Empty filter matches everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub synced: Option<bool>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn unsynced() -> Self {
        Self {
            synced: Some(false),
            ..Self::default()
        }
    }

    pub fn with_kind(mut self, kind: JobKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_synced(mut self, synced: bool) -> Self {
        self.synced = Some(synced);
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.kind.is_none_or(|k| job.kind == k)
            && self.synced.is_none_or(|s| job.synced() == s)
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// Attachment data supplied when enqueuing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl NewAttachment {
    pub fn new(file_name: impl Into<String>, mime_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            data,
        }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn into_attachment(self, job_id: JobId, created_at: DateTime<Utc>) -> MediaAttachment {
        MediaAttachment {
            id: AttachmentId::new(),
            job_id,
            size: self.data.len() as u64,
            file_name: self.file_name,
            mime_type: self.mime_type,
            data: self.data,
            created_at,
        }
    }
}

/// Binary data owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachment {
    pub id: AttachmentId,
    pub job_id: JobId,
    pub file_name: String,
    pub mime_type: String,
    #[serde(skip)]
    pub data: Vec<u8>,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::WorkSubmission;
    use std::time::Duration;

    fn work_job() -> Job {
        Job::new(WorkSubmission::new("0xgarden", 1, "Planting").into())
    }

    #[test]
    fn new_job_is_pending_and_due() {
        let job = work_job();
        assert_eq!(job.kind, JobKind::Work);
        assert!(!job.synced());
        assert_eq!(job.attempts, 0);
        assert!(job.is_due(Utc::now()));
    }

    #[test]
    fn transient_failures_back_off_then_stall() {
        let policy = RetryPolicy::exponential(2, Duration::from_secs(10), Duration::from_secs(60))
            .without_jitter();
        let mut job = work_job();
        let now = Utc::now();

        job.record_failure("network down");
        assert!(!job.schedule_retry(&policy, now));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.next_attempt_at, Some(now + chrono::Duration::seconds(10)));
        assert!(!job.is_due(now));

        job.record_failure("network down");
        assert!(job.schedule_retry(&policy, now));
        assert_eq!(job.status, JobStatus::Stalled);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("network down"));
    }

    #[test]
    fn jobs_failing_together_retry_at_different_times() {
        let policy = RetryPolicy::default();
        let now = Utc::now();
        let retry_at = |mut job: Job| {
            job.record_failure("network down");
            job.schedule_retry(&policy, now);
            job.next_attempt_at
        };

        let times: std::collections::HashSet<_> =
            (0..8).map(|_| retry_at(work_job())).collect();
        assert!(times.len() > 1);
    }

    #[test]
    fn requeue_resets_budget_but_keeps_last_error() {
        let mut job = work_job();
        job.record_failure("duplicate");
        job.mark_rejected("duplicate");
        job.requeue();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.last_error.as_deref(), Some("duplicate"));
    }

    #[test]
    fn filter_matches_kind_and_sync_state() {
        let mut job = work_job();
        assert!(JobFilter::unsynced().with_kind(JobKind::Work).matches(&job));
        assert!(!JobFilter::all().with_kind(JobKind::Approval).matches(&job));

        job.mark_synced(Some("0x1".into()), Utc::now());
        assert!(!JobFilter::unsynced().matches(&job));
        assert!(JobFilter::all().with_status(JobStatus::Synced).matches(&job));
    }

    #[test]
    fn replace_payload_refuses_other_kind() {
        use crate::payload::ApprovalSubmission;

        let mut job = work_job();
        let err = job
            .replace_payload(ApprovalSubmission::new("0xgarden", "w1", 1, true).into())
            .unwrap_err();
        assert!(matches!(err, DomainError::KindMismatch { .. }));
    }
}
