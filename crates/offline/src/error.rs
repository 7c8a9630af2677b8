//! Error types of the offline sync core.
//!
//! Each component has its own enum; [`OfflineError`] aggregates them for the facade.

use std::time::Duration;

use fieldqueue_core::{DomainError, JobId, JobKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Persistence cannot be opened or written.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    Duplicate(JobId),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<StoreError>() {
            Ok(store_err) => store_err,
            Err(err) => StoreError::Unavailable(format!("{err:#}")),
        }
    }
}

/// Why the remote authority refused a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    Validation,
    Duplicate,
    Capacity,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Validation => "validation",
            RejectionReason::Duplicate => "duplicate",
            RejectionReason::Capacity => "capacity",
        }
    }
}

impl core::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure talking to the remote authority.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("network error: {0}")]
    Network(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    /// Structured refusal; never retried blindly.
    #[error("rejected by remote ({reason}): {message}")]
    Rejected {
        reason: RejectionReason,
        message: String,
    },
}

impl SubmitError {
    pub fn network(msg: impl Into<String>) -> Self {
        Self::Network(msg.into())
    }

    pub fn rejected(reason: RejectionReason, message: impl Into<String>) -> Self {
        Self::Rejected {
            reason,
            message: message.into(),
        }
    }

    /// Network failures and timeouts are worth another attempt; rejections are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, SubmitError::Network(_) | SubmitError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum ConflictError {
    /// The id is not in the tracked conflict set.
    #[error("no tracked conflict for job {0}")]
    NotFound(JobId),
    #[error("job {0} is being submitted; try again after the current flush")]
    Busy(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote authority: {0}")]
    Remote(#[from] SubmitError),
    #[error("invalid resolution: {0}")]
    InvalidResolution(#[from] DomainError),
    #[error("no handler registered for job kind {0}")]
    UnknownKind(JobKind),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: requested {requested} bytes, {available} available")]
    QuotaExceeded { requested: u64, available: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("no handler registered for job kind {0}")]
    UnknownKind(JobKind),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Conflict(#[from] ConflictError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
