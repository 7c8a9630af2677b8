//! Authoritative remote records, as seen by conflict detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::JobKind;

/// Domain identifier matching a local job to its remote counterpart: the logical
/// action within its owning entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub entity: String,
    pub action: String,
}

impl CorrelationKey {
    pub fn new(entity: impl Into<String>, action: impl ToString) -> Self {
        Self {
            entity: entity.into(),
            action: action.to_string(),
        }
    }
}

impl core::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}/{}", self.entity, self.action)
    }
}

/// Review state of a remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Submitted,
    Approved,
    Rejected,
}

/// A confirmed record held by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub id: String,
    pub kind: JobKind,
    pub key: CorrelationKey,
    pub state: RecordState,
    pub created_at: DateTime<Utc>,
    /// Remote field values, keyed like the local payload JSON.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// What the remote knows about the owning entity of a set of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Active,
    /// The entity no longer exists remotely.
    Missing,
    /// The entity exists but no longer accepts submissions.
    Archived,
    /// The remote did not report on the entity.
    #[default]
    Unknown,
}

impl EntityStatus {
    pub fn diverged(&self) -> bool {
        matches!(self, EntityStatus::Missing | EntityStatus::Archived)
    }
}
