//! Kind-specific job payloads.
//!
//! Each job kind has exactly one payload shape. The enum is internally tagged with
//! `kind`, so a persisted payload is self-describing:
//!
//! ```json
//! { "kind": "work", "garden": "0xabc", "actionUID": 1, "title": "Weeding", "schemaVersion": 2 }
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::job::JobKind;
use crate::record::CorrelationKey;

/// Current shape of [`WorkSubmission`].
pub const WORK_SCHEMA_VERSION: u32 = 2;

/// Current shape of [`ApprovalSubmission`].
pub const APPROVAL_SCHEMA_VERSION: u32 = 1;

/// Payloads persisted before versioning carry no `schemaVersion` field.
fn legacy_schema() -> u32 {
    1
}

/// Work recorded in the field against an action of a garden.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSubmission {
    /// Owning garden (address of the parent entity).
    pub garden: String,
    /// Action performed, unique within the garden.
    #[serde(rename = "actionUID")]
    pub action_uid: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub feedback: String,
    #[serde(default)]
    pub plant_selection: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plant_count: Option<u32>,
    #[serde(default = "legacy_schema")]
    pub schema_version: u32,
}

impl WorkSubmission {
    pub fn new(garden: impl Into<String>, action_uid: u64, title: impl Into<String>) -> Self {
        Self {
            garden: garden.into(),
            action_uid,
            title: title.into(),
            feedback: String::new(),
            plant_selection: Vec::new(),
            plant_count: None,
            schema_version: WORK_SCHEMA_VERSION,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = feedback.into();
        self
    }

    pub fn with_plants(mut self, selection: Vec<String>, count: Option<u32>) -> Self {
        self.plant_selection = selection;
        self.plant_count = count;
        self
    }
}

/// An operator's verdict on previously submitted work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSubmission {
    pub garden: String,
    /// Remote identifier of the work being judged.
    #[serde(rename = "workUID")]
    pub work_uid: String,
    #[serde(rename = "actionUID")]
    pub action_uid: u64,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default = "legacy_schema")]
    pub schema_version: u32,
}

impl ApprovalSubmission {
    pub fn new(
        garden: impl Into<String>,
        work_uid: impl Into<String>,
        action_uid: u64,
        approved: bool,
    ) -> Self {
        Self {
            garden: garden.into(),
            work_uid: work_uid.into(),
            action_uid,
            approved,
            feedback: None,
            schema_version: APPROVAL_SCHEMA_VERSION,
        }
    }
}

/// Tagged union of every payload the queue can carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Work(WorkSubmission),
    Approval(ApprovalSubmission),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Work(_) => JobKind::Work,
            JobPayload::Approval(_) => JobKind::Approval,
        }
    }

    /// Owning entity the payload refers to.
    pub fn garden(&self) -> &str {
        match self {
            JobPayload::Work(w) => &w.garden,
            JobPayload::Approval(a) => &a.garden,
        }
    }

    /// Logical action identifier within the owning garden.
    ///
    /// A work submission is identified by its action; an approval by the work it rules on.
    pub fn correlation_key(&self) -> CorrelationKey {
        match self {
            JobPayload::Work(w) => CorrelationKey::new(w.garden.clone(), w.action_uid),
            JobPayload::Approval(a) => CorrelationKey::new(a.garden.clone(), &a.work_uid),
        }
    }

    pub fn schema_version(&self) -> u32 {
        match self {
            JobPayload::Work(w) => w.schema_version,
            JobPayload::Approval(a) => a.schema_version,
        }
    }

    pub fn current_schema_version(&self) -> u32 {
        match self {
            JobPayload::Work(_) => WORK_SCHEMA_VERSION,
            JobPayload::Approval(_) => APPROVAL_SCHEMA_VERSION,
        }
    }

    pub fn is_current_schema(&self) -> bool {
        self.schema_version() >= self.current_schema_version()
    }

    /// Bring a stale payload to the current shape.
    ///
    /// Fields added since the legacy shape all have serde defaults, so migration only
    /// stamps the version once the payload validates.
    pub fn migrate(&mut self) -> DomainResult<()> {
        self.validate()?;
        let current = self.current_schema_version();
        match self {
            JobPayload::Work(w) => w.schema_version = current,
            JobPayload::Approval(a) => a.schema_version = current,
        }
        Ok(())
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.garden().trim().is_empty() {
            return Err(DomainError::validation("payload must reference a garden"));
        }
        if let JobPayload::Approval(a) = self {
            if a.work_uid.trim().is_empty() {
                return Err(DomainError::validation("approval must reference a work uid"));
            }
        }
        Ok(())
    }

    /// Ensure the payload matches the kind of the job it replaces.
    pub fn expect_kind(&self, expected: JobKind) -> DomainResult<()> {
        let actual = self.kind();
        if actual == expected {
            Ok(())
        } else {
            Err(DomainError::KindMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
    }

    /// JSON object form used for field-by-field comparisons.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<WorkSubmission> for JobPayload {
    fn from(value: WorkSubmission) -> Self {
        JobPayload::Work(value)
    }
}

impl From<ApprovalSubmission> for JobPayload {
    fn from(value: ApprovalSubmission) -> Self {
        JobPayload::Approval(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn work_payload_serializes_with_kind_tag() {
        let payload = JobPayload::from(WorkSubmission::new("0xgarden", 7, "Weeding"));
        let value = payload.to_value();

        assert_eq!(value["kind"], "work");
        assert_eq!(value["actionUID"], 7);
        assert_eq!(value["schemaVersion"], WORK_SCHEMA_VERSION);
    }

    #[test]
    fn unversioned_payload_is_read_as_legacy_and_migrates() {
        let mut payload: JobPayload = serde_json::from_value(json!({
            "kind": "work",
            "garden": "0xgarden",
            "actionUID": 1,
        }))
        .unwrap();

        assert_eq!(payload.schema_version(), 1);
        assert!(!payload.is_current_schema());

        payload.migrate().unwrap();
        assert!(payload.is_current_schema());
    }

    #[test]
    fn approval_without_work_uid_fails_validation() {
        let payload = JobPayload::from(ApprovalSubmission::new("0xgarden", " ", 3, true));
        assert!(matches!(payload.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn correlation_key_follows_kind() {
        let work = JobPayload::from(WorkSubmission::new("0xgarden", 4, "Mulching"));
        let approval = JobPayload::from(ApprovalSubmission::new("0xgarden", "w-9", 4, true));

        assert_eq!(work.correlation_key(), CorrelationKey::new("0xgarden", 4));
        assert_eq!(approval.correlation_key(), CorrelationKey::new("0xgarden", "w-9"));
    }

    #[test]
    fn expect_kind_reports_mismatch() {
        let payload = JobPayload::from(WorkSubmission::new("0xgarden", 1, "t"));
        let err = payload.expect_kind(JobKind::Approval).unwrap_err();
        assert_eq!(
            err,
            DomainError::KindMismatch {
                expected: "approval".into(),
                actual: "work".into()
            }
        );
    }
}
