//! Conflict model: divergence between local speculative jobs and remote records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::JobId;
use crate::job::Job;
use crate::record::RemoteRecord;

/// Open tag set of conflict types. Unknown tags round-trip through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum ConflictKind {
    /// The remote already holds the equivalent record.
    AlreadySubmitted,
    /// The local payload shape is stale.
    SchemaMismatch,
    /// The referenced parent entity diverged (gone or archived).
    GardenMismatch,
    /// Field values diverge between local and remote.
    DataConflict,
    /// The remote explicitly refused the job.
    RemoteRejected,
    /// Transient failures exhausted the retry budget.
    RetryExhausted,
    Custom(String),
}

impl ConflictKind {
    pub fn as_str(&self) -> &str {
        match self {
            ConflictKind::AlreadySubmitted => "already_submitted",
            ConflictKind::SchemaMismatch => "schema_mismatch",
            ConflictKind::GardenMismatch => "garden_mismatch",
            ConflictKind::DataConflict => "data_conflict",
            ConflictKind::RemoteRejected => "remote_rejected",
            ConflictKind::RetryExhausted => "retry_exhausted",
            ConflictKind::Custom(tag) => tag,
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ConflictKind::SchemaMismatch => Severity::Low,
            ConflictKind::AlreadySubmitted | ConflictKind::DataConflict => Severity::Medium,
            ConflictKind::GardenMismatch
            | ConflictKind::RemoteRejected
            | ConflictKind::RetryExhausted => Severity::High,
            ConflictKind::Custom(_) => Severity::Medium,
        }
    }

    pub fn default_auto_resolvable(&self) -> bool {
        matches!(
            self,
            ConflictKind::AlreadySubmitted | ConflictKind::SchemaMismatch
        )
    }
}

impl core::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ConflictKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "already_submitted" => ConflictKind::AlreadySubmitted,
            "schema_mismatch" => ConflictKind::SchemaMismatch,
            "garden_mismatch" => ConflictKind::GardenMismatch,
            "data_conflict" => ConflictKind::DataConflict,
            "remote_rejected" => ConflictKind::RemoteRejected,
            "retry_exhausted" => ConflictKind::RetryExhausted,
            _ => ConflictKind::Custom(value),
        }
    }
}

impl From<ConflictKind> for String {
    fn from(value: ConflictKind) -> Self {
        match value {
            ConflictKind::Custom(tag) => tag,
            other => other.as_str().to_string(),
        }
    }
}

impl FromStr for ConflictKind {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ConflictKind::from(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One detected divergence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictType {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub severity: Severity,
    pub auto_resolvable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ConflictType {
    /// Conflict with the default severity and auto-resolvability of its kind.
    pub fn of(kind: ConflictKind) -> Self {
        Self {
            severity: kind.default_severity(),
            auto_resolvable: kind.default_auto_resolvable(),
            kind,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A tracked conflict for one local job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkConflict {
    pub work_id: JobId,
    pub conflicts: Vec<ConflictType>,
    /// Local job as it was when the conflict was detected.
    pub local_data: Job,
    /// Matching remote record, when one was found.
    pub remote_data: Option<RemoteRecord>,
    pub detected_at: DateTime<Utc>,
}

impl WorkConflict {
    pub fn has(&self, kind: &ConflictKind) -> bool {
        self.conflicts.iter().any(|c| &c.kind == kind)
    }

    pub fn is_auto_resolvable(&self) -> bool {
        !self.conflicts.is_empty() && self.conflicts.iter().all(|c| c.auto_resolvable)
    }

    pub fn severity(&self) -> Option<Severity> {
        self.conflicts.iter().map(|c| c.severity).max()
    }
}
