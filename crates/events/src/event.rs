//! Events emitted by the offline sync core.

use fieldqueue_core::{ConnectivityState, JobId, JobKind, SyncStatus};
use serde::{Deserialize, Serialize};

/// Something observable happened in the queue, the sync engine, the conflict resolver
/// or the storage manager.
///
/// Events are notifications, not the source of truth: a subscriber that misses one can
/// always re-read state (`pending_count`, `sync_status`, `conflicts`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    JobQueued {
        job_id: JobId,
        kind: JobKind,
    },
    JobSynced {
        job_id: JobId,
        remote_id: Option<String>,
    },
    JobFailed {
        job_id: JobId,
        error: String,
        retryable: bool,
    },
    /// Retry budget exhausted; the job now waits for a resolution.
    JobStalled {
        job_id: JobId,
        attempts: u32,
    },
    StatusChanged {
        status: SyncStatus,
    },
    FlushCompleted {
        processed: usize,
        failed: usize,
        skipped: usize,
        deferred: usize,
    },
    ConnectivityChanged {
        state: ConnectivityState,
    },
    ConflictsDetected {
        count: usize,
    },
    ConflictResolved {
        job_id: JobId,
    },
    CleanupCompleted {
        items_removed: u64,
        space_freed: u64,
    },
    StorageWarning {
        message: String,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::JobQueued { .. } => "job_queued",
            SyncEvent::JobSynced { .. } => "job_synced",
            SyncEvent::JobFailed { .. } => "job_failed",
            SyncEvent::JobStalled { .. } => "job_stalled",
            SyncEvent::StatusChanged { .. } => "status_changed",
            SyncEvent::FlushCompleted { .. } => "flush_completed",
            SyncEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SyncEvent::ConflictsDetected { .. } => "conflicts_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::CleanupCompleted { .. } => "cleanup_completed",
            SyncEvent::StorageWarning { .. } => "storage_warning",
        }
    }
}
