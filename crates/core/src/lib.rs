//! `fieldqueue-core`: domain building blocks for the offline job queue.
//!
//! This crate contains **pure domain** types (no IO, no async runtime): job records,
//! kind-specific payloads, the conflict model, retry policy and status enums shared by
//! the sync engine and its consumers.

pub mod conflict;
pub mod error;
pub mod id;
pub mod job;
pub mod payload;
pub mod record;
pub mod retry;
pub mod status;

pub use conflict::{ConflictKind, ConflictType, Severity, WorkConflict};
pub use error::{DomainError, DomainResult};
pub use id::{AttachmentId, JobId};
pub use job::{Job, JobFilter, JobKind, JobStatus, MediaAttachment, NewAttachment};
pub use payload::{ApprovalSubmission, JobPayload, WorkSubmission};
pub use record::{CorrelationKey, EntityStatus, RecordState, RemoteRecord};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use status::{ConnectivityState, SyncStatus};
