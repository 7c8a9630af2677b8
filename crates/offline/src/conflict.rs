//! Conflict resolver: compares local jobs with authoritative remote records and applies
//! caller-chosen resolutions.
//!
//! Detection matches a job to a remote record by correlation key within a bounded time
//! window and rebuilds the tracked set. Resolution claims the job in the shared
//! [`InFlight`] registry so a concurrent flush never submits it twice.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldqueue_core::{
    ConflictKind, ConflictType, CorrelationKey, DomainError, Job, JobFilter, JobId, JobKind, JobPayload,
    JobStatus, RecordState, RemoteRecord, WorkConflict,
};
use fieldqueue_events::SyncEvent;
use serde::{Deserialize, Serialize};

use crate::config::{ConflictConfig, SyncConfig};
use crate::error::{ConflictError, StoreError};
use crate::in_flight::InFlight;
use crate::registry::{ConflictComparator, FieldComparator, KindRegistry};
use crate::remote::{RecordQuery, RemoteQuery, RemoteSnapshot, submit_with_timeout};
use crate::store::JobStore;
use crate::{SharedEventBus, publish};

/// How a tracked conflict is settled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "payload", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Resubmit the local job as the truth, migrating a stale payload first.
    KeepLocal,
    /// Discard the local job and accept the remote record.
    KeepRemote,
    /// Resubmit with a payload merged by the caller.
    Merge(JobPayload),
    /// Resubmit with a payload written by the caller.
    Manual(JobPayload),
}

impl ResolutionStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            ResolutionStrategy::KeepLocal => "keep_local",
            ResolutionStrategy::KeepRemote => "keep_remote",
            ResolutionStrategy::Merge(_) => "merge",
            ResolutionStrategy::Manual(_) => "manual",
        }
    }
}

/// Result of a successful resolution.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRecord {
    pub work_id: JobId,
    pub strategy: &'static str,
    /// The local job after resolution; `None` when it was discarded.
    pub job: Option<Job>,
    /// The remote record the conflict was matched against.
    pub remote: Option<RemoteRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoResolveReport {
    pub resolved: Vec<JobId>,
    /// Conflicts that stayed tracked because their resolution failed.
    pub failed: Vec<JobId>,
}

/// The remote record matching `key` closest in time to `at`, if any lies within
/// `window`.
///
/// Records of another kind never match; the key spaces of different kinds overlap.
pub fn nearest_match<'a>(
    kind: JobKind,
    key: &CorrelationKey,
    at: DateTime<Utc>,
    records: &'a [RemoteRecord],
    window: chrono::Duration,
) -> Option<&'a RemoteRecord> {
    records
        .iter()
        .filter(|r| r.kind == kind && &r.key == key)
        .map(|r| ((r.created_at - at).abs(), r))
        .filter(|(distance, _)| *distance <= window)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, r)| r)
}

pub struct ConflictResolver {
    store: Arc<dyn JobStore>,
    registry: KindRegistry,
    remote: Arc<dyn RemoteQuery>,
    in_flight: InFlight,
    events: SharedEventBus,
    window: chrono::Duration,
    submit_timeout: Duration,
    tracked: RwLock<BTreeMap<JobId, WorkConflict>>,
}

impl ConflictResolver {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: KindRegistry,
        remote: Arc<dyn RemoteQuery>,
        in_flight: InFlight,
        events: SharedEventBus,
    ) -> Self {
        Self {
            store,
            registry,
            remote,
            in_flight,
            events,
            window: to_chrono(ConflictConfig::default().window),
            submit_timeout: SyncConfig::default().submit_timeout,
            tracked: RwLock::new(BTreeMap::new()),
        }
    }

    /// Matching window around a job's creation time.
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = to_chrono(window);
        self
    }

    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Compare `jobs` against the remote and replace the tracked set with the result.
    ///
    /// Synced and in-flight jobs are not examined. The remote is queried once per owning
    /// entity, so every job of an entity is compared against the same snapshot.
    pub async fn detect_conflicts(&self, jobs: &[Job]) -> Result<Vec<WorkConflict>, ConflictError> {
        let mut by_entity: BTreeMap<String, Vec<(&Job, CorrelationKey)>> = BTreeMap::new();
        for job in jobs {
            if job.synced() || self.in_flight.contains(job.id) {
                continue;
            }
            let key = self.comparator(job.kind).correlation_key(&job.payload);
            by_entity
                .entry(key.entity.clone())
                .or_default()
                .push((job, key));
        }

        let now = Utc::now();
        let mut detected = Vec::new();
        for (entity, group) in by_entity {
            let since = group.iter().map(|(j, _)| j.created_at).min().unwrap_or(now);
            let until = group.iter().map(|(j, _)| j.created_at).max().unwrap_or(now);
            let query = RecordQuery {
                entity: entity.clone(),
                since: since - self.window,
                until: until + self.window,
            };
            let snapshot = self.remote.confirmed_records(&query).await?;
            tracing::debug!(%entity, records = snapshot.records.len(), jobs = group.len(), "comparing against remote snapshot");

            for (job, key) in group {
                if let Some(conflict) = self.compare(job, &key, &snapshot, now) {
                    detected.push(conflict);
                }
            }
        }

        // Jobs a concurrent flush confirmed (or a resolution removed) are no longer in
        // conflict.
        let mut conflicts = Vec::with_capacity(detected.len());
        for conflict in detected {
            match self.store.get_job(conflict.work_id).await? {
                Some(job) if !job.synced() => conflicts.push(conflict),
                _ => tracing::debug!(job_id = %conflict.work_id, "job settled during detection"),
            }
        }

        {
            let mut tracked = self.write();
            // Conflicts under resolution were skipped above; keep them so a failed
            // resolution still finds its conflict tracked.
            let resolving: Vec<WorkConflict> = tracked
                .values()
                .filter(|c| self.in_flight.contains(c.work_id))
                .cloned()
                .collect();
            *tracked = conflicts
                .iter()
                .map(|c| (c.work_id, c.clone()))
                .collect();
            for conflict in resolving {
                tracked.entry(conflict.work_id).or_insert(conflict);
            }
        }

        tracing::info!(count = conflicts.len(), "conflict detection complete");
        publish(
            &self.events,
            SyncEvent::ConflictsDetected {
                count: conflicts.len(),
            },
        );
        Ok(conflicts)
    }

    /// Detection over every unsynced job in the store.
    pub async fn detect_pending_conflicts(&self) -> Result<Vec<WorkConflict>, ConflictError> {
        let jobs = self.store.get_jobs(JobFilter::unsynced()).await?;
        self.detect_conflicts(&jobs).await
    }

    fn compare(
        &self,
        job: &Job,
        key: &CorrelationKey,
        snapshot: &RemoteSnapshot,
        now: DateTime<Utc>,
    ) -> Option<WorkConflict> {
        let mut conflicts = Vec::new();

        if snapshot.entity_status.diverged() {
            conflicts.push(
                ConflictType::of(ConflictKind::GardenMismatch)
                    .with_detail(format!("{} is {:?}", key.entity, snapshot.entity_status)),
            );
        }

        let matched = nearest_match(job.kind, key, job.created_at, &snapshot.records, self.window);
        if let Some(record) = matched {
            if record.state == RecordState::Rejected {
                conflicts.push(
                    ConflictType::of(ConflictKind::RemoteRejected)
                        .with_detail(format!("remote record {} was rejected", record.id)),
                );
            } else {
                conflicts.push(ConflictType::of(ConflictKind::AlreadySubmitted));
            }

            let fields = self.comparator(job.kind).diverging_fields(&job.payload, record);
            if !fields.is_empty() {
                conflicts.push(
                    ConflictType::of(ConflictKind::DataConflict).with_detail(fields.join(", ")),
                );
            }
        }

        if !job.payload.is_current_schema() {
            conflicts.push(ConflictType::of(ConflictKind::SchemaMismatch).with_detail(format!(
                "schema v{} is older than v{}",
                job.payload.schema_version(),
                job.payload.current_schema_version()
            )));
        }

        match job.status {
            JobStatus::Rejected if !conflicts.iter().any(|c| c.kind == ConflictKind::RemoteRejected) => {
                let detail = job.last_error.clone().unwrap_or_default();
                conflicts.push(ConflictType::of(ConflictKind::RemoteRejected).with_detail(detail));
            }
            JobStatus::Stalled => {
                conflicts.push(
                    ConflictType::of(ConflictKind::RetryExhausted)
                        .with_detail(format!("{} attempts", job.attempts)),
                );
            }
            _ => {}
        }

        if conflicts.is_empty() {
            return None;
        }
        Some(WorkConflict {
            work_id: job.id,
            conflicts,
            local_data: job.clone(),
            remote_data: matched.cloned(),
            detected_at: now,
        })
    }

    /// Settle the tracked conflict of `id` with `strategy`.
    ///
    /// On success the conflict leaves the tracked set. A resolution that fails on the
    /// remote keeps the conflict tracked and records the error on the job.
    pub async fn resolve_conflict(
        &self,
        id: JobId,
        strategy: ResolutionStrategy,
    ) -> Result<ResolvedRecord, ConflictError> {
        let conflict = self.get_conflict_by_id(id).ok_or(ConflictError::NotFound(id))?;
        let Some(_claim) = self.in_flight.try_claim(id) else {
            return Err(ConflictError::Busy(id));
        };
        let strategy_name = strategy.name();

        let Some(mut job) = self.store.get_job(id).await? else {
            if strategy == ResolutionStrategy::KeepRemote {
                return Ok(self.settle(conflict, strategy_name, None));
            }
            self.clear_conflict(id);
            return Err(ConflictError::Store(StoreError::NotFound(id)));
        };

        let job = match strategy {
            ResolutionStrategy::KeepRemote => {
                self.store.remove_job(id).await?;
                tracing::info!(job_id = %id, "local job discarded in favour of remote record");
                None
            }
            ResolutionStrategy::Merge(_) | ResolutionStrategy::Manual(_) if job.synced() => {
                return Err(ConflictError::InvalidResolution(DomainError::validation(format!(
                    "job {id} was synced before the {strategy_name} payload could be applied"
                ))));
            }
            _ if job.synced() => Some(job),
            ResolutionStrategy::KeepLocal => {
                if !job.payload.is_current_schema() {
                    job.payload.migrate()?;
                }
                job.requeue();
                Some(self.submit(job).await?)
            }
            ResolutionStrategy::Merge(payload) | ResolutionStrategy::Manual(payload) => {
                job.replace_payload(payload)?;
                Some(self.submit(job).await?)
            }
        };

        Ok(self.settle(conflict, strategy_name, job))
    }

    /// Resolve every tracked conflict made only of auto-resolvable types.
    pub async fn resolve_auto_resolvable(&self) -> AutoResolveReport {
        let candidates: Vec<WorkConflict> = self
            .read()
            .values()
            .filter(|c| c.is_auto_resolvable())
            .cloned()
            .collect();

        let mut report = AutoResolveReport::default();
        for conflict in candidates {
            let strategy = if conflict.has(&ConflictKind::AlreadySubmitted) {
                ResolutionStrategy::KeepRemote
            } else {
                ResolutionStrategy::KeepLocal
            };
            match self.resolve_conflict(conflict.work_id, strategy).await {
                Ok(_) => report.resolved.push(conflict.work_id),
                Err(err) => {
                    tracing::warn!(job_id = %conflict.work_id, error = %err, "automatic resolution failed");
                    report.failed.push(conflict.work_id);
                }
            }
        }
        report
    }

    /// Tracked conflicts, oldest job first.
    pub fn get_conflicts(&self) -> Vec<WorkConflict> {
        self.read().values().cloned().collect()
    }

    pub fn get_conflict_by_id(&self, id: JobId) -> Option<WorkConflict> {
        self.read().get(&id).cloned()
    }

    /// Stop tracking `id` without touching the job. Returns whether it was tracked.
    pub fn clear_conflict(&self, id: JobId) -> bool {
        self.write().remove(&id).is_some()
    }

    pub fn clear_all_conflicts(&self) {
        self.write().clear();
    }

    pub fn conflict_count(&self) -> usize {
        self.read().len()
    }

    async fn submit(&self, mut job: Job) -> Result<Job, ConflictError> {
        let entry = self
            .registry
            .get(job.kind)
            .ok_or(ConflictError::UnknownKind(job.kind))?;
        let attachments = self.store.attachments(job.id).await?;

        match submit_with_timeout(entry.submitter.as_ref(), &job, &attachments, self.submit_timeout).await {
            Ok(receipt) => {
                job.mark_synced(receipt.remote_id, receipt.accepted_at);
                self.store.update(&job).await?;
                tracing::info!(job_id = %job.id, "resolved job submitted");
                Ok(job)
            }
            Err(err) => {
                job.record_failure(err.to_string());
                if !err.is_transient() {
                    job.mark_rejected(err.to_string());
                }
                self.store.update(&job).await?;
                tracing::warn!(job_id = %job.id, error = %err, "resolution submit failed; conflict stays tracked");
                Err(ConflictError::Remote(err))
            }
        }
    }

    fn settle(&self, conflict: WorkConflict, strategy: &'static str, job: Option<Job>) -> ResolvedRecord {
        let id = conflict.work_id;
        self.clear_conflict(id);
        tracing::info!(job_id = %id, strategy, "conflict resolved");
        publish(&self.events, SyncEvent::ConflictResolved { job_id: id });
        ResolvedRecord {
            work_id: id,
            strategy,
            job,
            remote: conflict.remote_data,
        }
    }

    fn comparator(&self, kind: JobKind) -> Arc<dyn ConflictComparator> {
        match self.registry.get(kind) {
            Some(entry) => entry.comparator.clone(),
            None => Arc::new(FieldComparator::for_kind(kind)),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<JobId, WorkConflict>> {
        self.tracked.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<JobId, WorkConflict>> {
        self.tracked.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl core::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("window", &self.window)
            .field("tracked", &self.conflict_count())
            .finish_non_exhaustive()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubmitError;
    use crate::remote::InMemoryRemote;
    use crate::store::InMemoryStore;
    use fieldqueue_core::{EntityStatus, Severity, WorkSubmission};
    use fieldqueue_events::InMemoryEventBus;
    use serde_json::json;

    struct Harness {
        resolver: ConflictResolver,
        store: Arc<InMemoryStore>,
        remote: Arc<InMemoryRemote>,
        in_flight: InFlight,
    }

    fn harness() -> Harness {
        harness_with(InMemoryRemote::new())
    }

    fn harness_with(remote: InMemoryRemote) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let remote = Arc::new(remote);
        let in_flight = InFlight::new();
        let resolver = ConflictResolver::new(
            store.clone(),
            KindRegistry::with_defaults(remote.clone()),
            remote.clone(),
            in_flight.clone(),
            Arc::new(InMemoryEventBus::new()),
        );
        Harness {
            resolver,
            store,
            remote,
            in_flight,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(1)
    }

    async fn queue_at(h: &Harness, payload: WorkSubmission, at: DateTime<Utc>) -> Job {
        let job = Job::created_at(payload.into(), at);
        h.store.insert(job.clone(), Vec::new()).await.unwrap();
        job
    }

    fn remote_record(action: u64, at: DateTime<Utc>, data: serde_json::Value) -> RemoteRecord {
        RemoteRecord {
            id: format!("r-{action}"),
            kind: JobKind::Work,
            key: CorrelationKey::new("0xgarden", action),
            state: RecordState::Approved,
            created_at: at,
            data,
        }
    }

    fn kinds(conflict: &WorkConflict) -> Vec<ConflictKind> {
        conflict.conflicts.iter().map(|c| c.kind.clone()).collect()
    }

    #[tokio::test]
    async fn approved_duplicate_is_already_submitted_and_keep_remote_discards() {
        let h = harness();
        let t0 = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t0).await;
        h.remote.add_record(remote_record(
            1,
            t0 + chrono::Duration::seconds(90),
            json!({"title": "Planting"}),
        ));

        let conflicts = h.resolver.detect_pending_conflicts().await.unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].work_id, job.id);
        assert_eq!(
            conflicts[0].conflicts,
            vec![ConflictType {
                kind: ConflictKind::AlreadySubmitted,
                severity: Severity::Medium,
                auto_resolvable: true,
                detail: None,
            }]
        );

        let resolved = h
            .resolver
            .resolve_conflict(job.id, ResolutionStrategy::KeepRemote)
            .await
            .unwrap();
        assert_eq!(resolved.strategy, "keep_remote");
        assert_eq!(resolved.remote.unwrap().id, "r-1");
        assert!(h.resolver.get_conflicts().is_empty());
        assert!(h.resolver.get_conflict_by_id(job.id).is_none());
        assert_eq!(h.store.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn matches_only_inside_the_window() {
        let h = harness();
        let t = t0();
        let near = queue_at(&h, WorkSubmission::new("0xgarden", 1, "a"), t + chrono::Duration::minutes(2)).await;
        queue_at(&h, WorkSubmission::new("0xgarden", 2, "b"), t + chrono::Duration::minutes(10)).await;
        h.remote.add_record(remote_record(1, t, json!({})));
        h.remote.add_record(remote_record(2, t, json!({})));

        let conflicts = h.resolver.detect_pending_conflicts().await.unwrap();

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].work_id, near.id);
    }

    #[test]
    fn nearest_match_prefers_closest_record() {
        let t = t0();
        let key = CorrelationKey::new("0xgarden", 1);
        let records = vec![
            remote_record(1, t - chrono::Duration::minutes(4), json!({})),
            RemoteRecord {
                id: "closest".into(),
                ..remote_record(1, t + chrono::Duration::minutes(1), json!({}))
            },
            remote_record(2, t, json!({})),
        ];
        let window = chrono::Duration::minutes(5);

        let found = nearest_match(JobKind::Work, &key, t, &records, window).unwrap();
        assert_eq!(found.id, "closest");
        assert!(nearest_match(JobKind::Approval, &key, t, &records, window).is_none());
    }

    #[tokio::test]
    async fn one_query_per_entity() {
        let h = harness();
        let t = t0();
        for action in 1..=3 {
            queue_at(&h, WorkSubmission::new("0xgarden", action, "t"), t).await;
        }
        queue_at(&h, WorkSubmission::new("0xother", 1, "t"), t).await;

        h.resolver.detect_pending_conflicts().await.unwrap();

        assert_eq!(h.remote.query_count(), 2);
    }

    #[tokio::test]
    async fn divergent_fields_and_stale_schema_are_flagged() {
        let h = harness();
        let t = t0();
        let diverged = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t).await;
        let mut legacy = WorkSubmission::new("0xgarden", 2, "Weeding");
        legacy.schema_version = 1;
        let stale = queue_at(&h, legacy, t).await;
        h.remote.add_record(remote_record(1, t, json!({"title": "Pruning"})));

        h.resolver.detect_pending_conflicts().await.unwrap();

        let first = h.resolver.get_conflict_by_id(diverged.id).unwrap();
        assert_eq!(kinds(&first), vec![ConflictKind::AlreadySubmitted, ConflictKind::DataConflict]);
        assert_eq!(first.conflicts[1].detail.as_deref(), Some("title"));
        assert!(!first.is_auto_resolvable());

        let second = h.resolver.get_conflict_by_id(stale.id).unwrap();
        assert_eq!(kinds(&second), vec![ConflictKind::SchemaMismatch]);
        assert!(second.is_auto_resolvable());
    }

    #[tokio::test]
    async fn archived_entity_is_a_garden_mismatch() {
        let h = harness();
        queue_at(&h, WorkSubmission::new("0xgarden", 1, "t"), t0()).await;
        h.remote.set_entity_status("0xgarden", EntityStatus::Archived);

        let conflicts = h.resolver.detect_pending_conflicts().await.unwrap();

        assert_eq!(kinds(&conflicts[0]), vec![ConflictKind::GardenMismatch]);
        assert_eq!(conflicts[0].severity(), Some(Severity::High));
    }

    #[tokio::test]
    async fn failed_jobs_surface_as_conflicts() {
        let h = harness();
        let mut stalled = queue_at(&h, WorkSubmission::new("0xgarden", 1, "t"), t0()).await;
        stalled.attempts = 5;
        stalled.status = JobStatus::Stalled;
        h.store.update(&stalled).await.unwrap();
        let mut rejected = queue_at(&h, WorkSubmission::new("0xgarden", 2, "t"), t0()).await;
        rejected.mark_rejected("duplicate");
        h.store.update(&rejected).await.unwrap();

        h.resolver.detect_pending_conflicts().await.unwrap();

        assert_eq!(
            kinds(&h.resolver.get_conflict_by_id(stalled.id).unwrap()),
            vec![ConflictKind::RetryExhausted]
        );
        assert_eq!(
            kinds(&h.resolver.get_conflict_by_id(rejected.id).unwrap()),
            vec![ConflictKind::RemoteRejected]
        );
    }

    #[tokio::test]
    async fn in_flight_jobs_are_not_examined() {
        let h = harness();
        let t = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "t"), t).await;
        h.remote.add_record(remote_record(1, t, json!({})));
        let _claim = h.in_flight.try_claim(job.id).unwrap();

        assert!(h.resolver.detect_pending_conflicts().await.unwrap().is_empty());
        assert_eq!(h.remote.query_count(), 0);
    }

    #[tokio::test]
    async fn resolving_untracked_or_busy_ids_fails() {
        let h = harness();
        assert!(matches!(
            h.resolver.resolve_conflict(JobId::new(), ResolutionStrategy::KeepLocal).await,
            Err(ConflictError::NotFound(_))
        ));

        let t = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "t"), t).await;
        h.remote.add_record(remote_record(1, t, json!({})));
        h.resolver.detect_pending_conflicts().await.unwrap();
        let _claim = h.in_flight.try_claim(job.id).unwrap();

        assert!(matches!(
            h.resolver.resolve_conflict(job.id, ResolutionStrategy::KeepRemote).await,
            Err(ConflictError::Busy(_))
        ));
        assert_eq!(h.resolver.conflict_count(), 1);
    }

    #[tokio::test]
    async fn failed_keep_local_stays_tracked() {
        let h = harness();
        let t = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t).await;
        h.remote.add_record(remote_record(1, t, json!({"title": "Pruning"})));
        h.resolver.detect_pending_conflicts().await.unwrap();
        h.remote.push_failure(SubmitError::network("down"));

        let err = h
            .resolver
            .resolve_conflict(job.id, ResolutionStrategy::KeepLocal)
            .await
            .unwrap_err();

        assert!(matches!(err, ConflictError::Remote(SubmitError::Network(_))));
        assert!(h.resolver.get_conflict_by_id(job.id).is_some());
        let stored = h.store.get_job(job.id).await.unwrap().unwrap();
        assert!(stored.last_error.unwrap().contains("down"));

        let resolved = h
            .resolver
            .resolve_conflict(job.id, ResolutionStrategy::KeepLocal)
            .await
            .unwrap();
        assert!(resolved.job.unwrap().synced());
        assert_eq!(h.resolver.conflict_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detection_during_a_failing_resolution_keeps_the_conflict() {
        let h = harness_with(InMemoryRemote::new().with_delay(Duration::from_millis(100)));
        let t = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t).await;
        h.remote.add_record(remote_record(1, t, json!({"title": "Pruning"})));
        h.resolver.detect_pending_conflicts().await.unwrap();
        h.remote.push_failure(SubmitError::network("down"));

        let (resolution, detected) = tokio::join!(
            h.resolver.resolve_conflict(job.id, ResolutionStrategy::KeepLocal),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                h.resolver.detect_pending_conflicts().await
            }
        );

        assert!(matches!(resolution, Err(ConflictError::Remote(_))));
        assert!(detected.unwrap().is_empty());
        assert!(h.resolver.get_conflict_by_id(job.id).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn detection_during_a_successful_resolution_does_not_resurrect_it() {
        let h = harness_with(InMemoryRemote::new().with_delay(Duration::from_millis(100)));
        let t = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t).await;
        h.remote.add_record(remote_record(1, t, json!({"title": "Pruning"})));
        h.resolver.detect_pending_conflicts().await.unwrap();

        let (resolution, _) = tokio::join!(
            h.resolver.resolve_conflict(job.id, ResolutionStrategy::KeepLocal),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                h.resolver.detect_pending_conflicts().await
            }
        );

        assert!(resolution.unwrap().job.unwrap().synced());
        assert_eq!(h.resolver.conflict_count(), 0);
    }

    #[tokio::test]
    async fn merge_into_an_already_synced_job_is_refused() {
        let h = harness();
        let t = t0();
        let mut job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t).await;
        h.remote.add_record(remote_record(1, t, json!({"title": "Pruning"})));
        h.resolver.detect_pending_conflicts().await.unwrap();
        job.mark_synced(Some("r-1".into()), Utc::now());
        h.store.update(&job).await.unwrap();

        let merged = WorkSubmission::new("0xgarden", 1, "Pruning").into();
        assert!(matches!(
            h.resolver.resolve_conflict(job.id, ResolutionStrategy::Merge(merged)).await,
            Err(ConflictError::InvalidResolution(_))
        ));
        assert_eq!(h.remote.submission_count(), 0);
        assert_eq!(h.resolver.conflict_count(), 1);

        let resolved = h
            .resolver
            .resolve_conflict(job.id, ResolutionStrategy::KeepLocal)
            .await
            .unwrap();
        assert!(resolved.job.unwrap().synced());
        assert_eq!(h.resolver.conflict_count(), 0);
    }

    #[tokio::test]
    async fn merge_requires_matching_kind() {
        let h = harness();
        let t = t0();
        let job = queue_at(&h, WorkSubmission::new("0xgarden", 1, "Planting"), t).await;
        h.remote.add_record(remote_record(1, t, json!({"title": "Pruning"})));
        h.resolver.detect_pending_conflicts().await.unwrap();

        let wrong = fieldqueue_core::ApprovalSubmission::new("0xgarden", "w1", 1, true).into();
        assert!(matches!(
            h.resolver.resolve_conflict(job.id, ResolutionStrategy::Merge(wrong)).await,
            Err(ConflictError::InvalidResolution(_))
        ));
        assert_eq!(h.resolver.conflict_count(), 1);

        let merged = WorkSubmission::new("0xgarden", 1, "Pruning").into();
        let resolved = h
            .resolver
            .resolve_conflict(job.id, ResolutionStrategy::Merge(merged))
            .await
            .unwrap();
        let job = resolved.job.unwrap();
        assert!(job.synced());
        assert_eq!(job.payload, JobPayload::from(WorkSubmission::new("0xgarden", 1, "Pruning")));
    }

    #[tokio::test]
    async fn auto_resolution_handles_only_safe_conflicts() {
        let h = harness();
        let t = t0();
        let duplicate = queue_at(&h, WorkSubmission::new("0xgarden", 1, "a"), t).await;
        let mut legacy = WorkSubmission::new("0xgarden", 2, "b");
        legacy.schema_version = 1;
        let stale = queue_at(&h, legacy, t).await;
        let diverged = queue_at(&h, WorkSubmission::new("0xgarden", 3, "c"), t).await;
        h.remote.add_record(remote_record(1, t, json!({})));
        h.remote.add_record(remote_record(3, t, json!({"title": "x"})));
        h.resolver.detect_pending_conflicts().await.unwrap();

        let report = h.resolver.resolve_auto_resolvable().await;

        assert_eq!(report.failed, Vec::<JobId>::new());
        let mut resolved = report.resolved.clone();
        resolved.sort();
        let mut expected = vec![duplicate.id, stale.id];
        expected.sort();
        assert_eq!(resolved, expected);

        assert!(h.store.get_job(duplicate.id).await.unwrap().is_none());
        let migrated = h.store.get_job(stale.id).await.unwrap().unwrap();
        assert!(migrated.synced());
        assert!(migrated.payload.is_current_schema());
        assert_eq!(h.resolver.get_conflicts()[0].work_id, diverged.id);
    }
}
