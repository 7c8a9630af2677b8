//! Per-kind dispatch: which handler submits a job and how its conflicts are compared.

use std::collections::HashMap;
use std::sync::Arc;

use fieldqueue_core::{CorrelationKey, JobKind, JobPayload, RemoteRecord};
use serde_json::Value;

use crate::remote::SubmitHandler;

/// Kind-specific comparison between a local payload and a remote record.
pub trait ConflictComparator: Send + Sync {
    /// Key under which local jobs and remote records are matched.
    fn correlation_key(&self, payload: &JobPayload) -> CorrelationKey {
        payload.correlation_key()
    }

    /// Names of fields present on both sides whose values differ.
    fn diverging_fields(&self, payload: &JobPayload, remote: &RemoteRecord) -> Vec<String>;
}

/// Compares the top-level JSON fields both sides carry, minus identity and envelope
/// fields.
#[derive(Debug, Clone)]
pub struct FieldComparator {
    ignored: Vec<&'static str>,
}

impl FieldComparator {
    pub fn new(ignored: Vec<&'static str>) -> Self {
        Self { ignored }
    }

    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Work => Self::new(vec!["kind", "schemaVersion", "garden", "actionUID"]),
            JobKind::Approval => Self::new(vec![
                "kind",
                "schemaVersion",
                "garden",
                "workUID",
                "actionUID",
            ]),
        }
    }
}

impl ConflictComparator for FieldComparator {
    fn diverging_fields(&self, payload: &JobPayload, remote: &RemoteRecord) -> Vec<String> {
        let (Value::Object(local), Value::Object(remote)) = (payload.to_value(), &remote.data)
        else {
            return Vec::new();
        };

        let mut fields: Vec<String> = local
            .iter()
            .filter(|(name, _)| !self.ignored.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                let theirs = remote.get(name)?;
                (theirs != value).then(|| name.clone())
            })
            .collect();
        fields.sort();
        fields
    }
}

#[derive(Clone)]
pub struct KindEntry {
    pub submitter: Arc<dyn SubmitHandler>,
    pub comparator: Arc<dyn ConflictComparator>,
}

/// Registry of kind handlers.
#[derive(Clone, Default)]
pub struct KindRegistry {
    entries: HashMap<JobKind, KindEntry>,
}

impl KindRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every kind submitted through `submitter` and compared field by field.
    pub fn with_defaults(submitter: Arc<dyn SubmitHandler>) -> Self {
        let mut registry = Self::new();
        for kind in JobKind::ALL {
            registry.register(
                kind,
                submitter.clone(),
                Arc::new(FieldComparator::for_kind(kind)),
            );
        }
        registry
    }

    /// Register (or replace) the handlers of `kind`.
    pub fn register(
        &mut self,
        kind: JobKind,
        submitter: Arc<dyn SubmitHandler>,
        comparator: Arc<dyn ConflictComparator>,
    ) -> &mut Self {
        self.entries.insert(
            kind,
            KindEntry {
                submitter,
                comparator,
            },
        );
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&KindEntry> {
        self.entries.get(&kind)
    }

    pub fn contains(&self, kind: JobKind) -> bool {
        self.entries.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<JobKind> {
        let mut kinds: Vec<JobKind> = self.entries.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl core::fmt::Debug for KindRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KindRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
