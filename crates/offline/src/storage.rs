//! Storage manager: quota accounting, growth trend and priority eviction.
//!
//! Cleanup reclaims space in a fixed order and never touches an unsynced job or its
//! attachments, nor anything of a job currently being submitted.

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fieldqueue_events::SyncEvent;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::StorageConfig;
use crate::error::{StorageError, StoreError};
use crate::in_flight::InFlight;
use crate::store::{CacheEntry, CacheStore, JobStore, JobUsage, Namespace, Usage, timestamp};
use crate::worker::{WorkerHandle, spawn_periodic};
use crate::{SharedEventBus, publish};

/// Metadata key prefix of usage samples.
pub const SAMPLE_PREFIX: &str = "usage_sample/";

/// Days of projected headroom under which cleanup runs early.
const DAYS_UNTIL_FULL_THRESHOLD: f64 = 3.0;

/// Share of the quota held by unsynced work above which it is worth reviewing.
const STALE_PENDING_SHARE: f64 = 0.5;

/// Capacity available to the local store, in bytes.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn capacity(&self) -> Result<u64, StoreError>;
}

/// A configured, constant quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedQuota(pub u64);

#[async_trait]
impl QuotaProvider for FixedQuota {
    async fn capacity(&self) -> Result<u64, StoreError> {
        Ok(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaUsage {
    pub capacity: u64,
    pub used: u64,
    pub available: u64,
    /// `used` as a percentage of `capacity`.
    pub percentage: f64,
}

/// Bytes per storage category; they sum to [`QuotaUsage::used`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageBreakdown {
    pub work_records: u64,
    pub attachments: u64,
    pub cache: u64,
    pub metadata: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    SyncPendingWork,
    ClearSyncedMedia,
    ClearStaleCache,
    PruneMetadata,
    RemoveStalePending,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageTrend {
    /// Bytes per day; negative when usage shrinks.
    pub daily_growth: f64,
    pub days_until_full: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageAnalytics {
    pub quota: QuotaUsage,
    pub breakdown: StorageBreakdown,
    pub needs_cleanup: bool,
    pub recommended_actions: Vec<RecommendedAction>,
    /// `None` until enough samples cover at least an hour.
    pub trend: Option<StorageTrend>,
    pub measured_at: DateTime<Utc>,
}

/// Eviction categories, in the order cleanup visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupCategory {
    SyncedAttachments,
    StaleCache,
    StaleMetadata,
    SyncedJobs,
}

impl CleanupCategory {
    pub const ORDER: [CleanupCategory; 4] = [
        CleanupCategory::SyncedAttachments,
        CleanupCategory::StaleCache,
        CleanupCategory::StaleMetadata,
        CleanupCategory::SyncedJobs,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryCleanup {
    pub category: CleanupCategory,
    pub items_removed: u64,
    pub space_freed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResult {
    pub items_removed: u64,
    pub space_freed: u64,
    /// Categories that released something, in eviction order.
    pub categories: Vec<CategoryCleanup>,
}

#[derive(Debug, Clone, Copy)]
struct Measured {
    jobs: JobUsage,
    cache: Usage,
    metadata: Usage,
}

impl Measured {
    fn used(&self) -> u64 {
        self.jobs.records.bytes + self.jobs.attachments.bytes + self.cache.bytes + self.metadata.bytes
    }
}

#[derive(Clone)]
pub struct StorageManager {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    jobs: Arc<dyn JobStore>,
    cache: Arc<dyn CacheStore>,
    quota: Arc<dyn QuotaProvider>,
    in_flight: InFlight,
    events: SharedEventBus,
    config: StorageConfig,
    needs_cleanup: AtomicBool,
    maintenance: Mutex<Option<WorkerHandle>>,
}

impl StorageManager {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        cache: Arc<dyn CacheStore>,
        quota: Arc<dyn QuotaProvider>,
        in_flight: InFlight,
        events: SharedEventBus,
        config: StorageConfig,
    ) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                jobs,
                cache,
                quota,
                in_flight,
                events,
                config,
                needs_cleanup: AtomicBool::new(false),
                maintenance: Mutex::new(None),
            }),
        }
    }

    /// Current usage, recommendations and growth trend.
    ///
    /// Records a usage sample when the last one is older than the sampling interval.
    pub async fn get_analytics(&self) -> Result<StorageAnalytics, StorageError> {
        let inner = &*self.inner;
        let now = Utc::now();
        let capacity = inner.quota.capacity().await?;
        let mut measured = self.measure().await?;

        let mut samples = inner.cache.list(Namespace::Metadata, SAMPLE_PREFIX).await?;
        let sample_due = samples
            .last()
            .is_none_or(|last| now - last.updated_at >= to_chrono(inner.config.sample_interval));
        if sample_due {
            let key = format!("{SAMPLE_PREFIX}{}", timestamp(now));
            let value = json!({ "used": measured.used() });
            inner.cache.put_at(Namespace::Metadata, &key, &value, now).await?;
            samples.push(CacheEntry::new(key, value, now));
            measured = self.measure().await?;
        }

        let used = measured.used();
        let fraction = fraction_of(used, capacity);
        let needs_cleanup =
            fraction > inner.config.cleanup_threshold || inner.needs_cleanup.load(Ordering::SeqCst);

        let stale_cache = inner
            .cache
            .list(Namespace::Cache, "")
            .await?
            .iter()
            .any(|e| e.updated_at < now - to_chrono(inner.config.cache_max_age));
        let stale_samples = samples
            .iter()
            .any(|e| e.updated_at < now - to_chrono(inner.config.metadata_retention));

        let mut recommended_actions = Vec::new();
        if measured.jobs.pending_records.items > 0 {
            recommended_actions.push(RecommendedAction::SyncPendingWork);
        }
        if measured.jobs.synced_attachments.bytes > 0 {
            recommended_actions.push(RecommendedAction::ClearSyncedMedia);
        }
        if stale_cache {
            recommended_actions.push(RecommendedAction::ClearStaleCache);
        }
        if stale_samples {
            recommended_actions.push(RecommendedAction::PruneMetadata);
        }
        if fraction_of(measured.jobs.pending_bytes(), capacity) > STALE_PENDING_SHARE {
            recommended_actions.push(RecommendedAction::RemoveStalePending);
        }

        let horizon = now - to_chrono(inner.config.trend_horizon);
        let recent: Vec<&CacheEntry> = samples.iter().filter(|e| e.updated_at >= horizon).collect();
        let available = capacity.saturating_sub(used);

        Ok(StorageAnalytics {
            quota: QuotaUsage {
                capacity,
                used,
                available,
                percentage: fraction * 100.0,
            },
            breakdown: StorageBreakdown {
                work_records: measured.jobs.records.bytes,
                attachments: measured.jobs.attachments.bytes,
                cache: measured.cache.bytes,
                metadata: measured.metadata.bytes,
            },
            needs_cleanup,
            recommended_actions,
            trend: trend(&recent, available),
            measured_at: now,
        })
    }

    /// Whether cleanup is due now or the trend projects the quota full within days.
    pub async fn should_perform_cleanup(&self) -> Result<bool, StorageError> {
        let analytics = self.get_analytics().await?;
        let filling_up = analytics
            .trend
            .and_then(|t| t.days_until_full)
            .is_some_and(|days| days < DAYS_UNTIL_FULL_THRESHOLD);
        Ok(analytics.needs_cleanup || filling_up)
    }

    /// Evict reclaimable data by priority.
    ///
    /// When usage starts above the cleanup threshold, eviction stops after the first
    /// category that brings it under the target; otherwise every category runs.
    pub async fn perform_cleanup(&self) -> Result<CleanupResult, StorageError> {
        let inner = &*self.inner;
        let capacity = inner.quota.capacity().await?;
        let before = self.measure().await?.used();
        let pressured = fraction_of(before, capacity) > inner.config.cleanup_threshold;
        let exclude = inner.in_flight.snapshot();
        let now = Utc::now();

        let mut used = before;
        let mut result = CleanupResult::default();
        for category in CleanupCategory::ORDER {
            let evicted = match category {
                CleanupCategory::SyncedAttachments => {
                    inner.jobs.evict_synced_attachments(&exclude).await?
                }
                CleanupCategory::StaleCache => {
                    let cutoff = now - to_chrono(inner.config.cache_max_age);
                    inner.cache.evict_older_than(Namespace::Cache, "", cutoff).await?
                }
                CleanupCategory::StaleMetadata => {
                    let cutoff = now - to_chrono(inner.config.metadata_retention);
                    inner
                        .cache
                        .evict_older_than(Namespace::Metadata, SAMPLE_PREFIX, cutoff)
                        .await?
                }
                CleanupCategory::SyncedJobs => {
                    let cutoff = now - to_chrono(inner.config.synced_job_retention);
                    inner.jobs.purge_synced_jobs(cutoff, &exclude).await?
                }
            };

            used = used.saturating_sub(evicted.bytes);
            if evicted.items > 0 {
                tracing::debug!(?category, items = evicted.items, bytes = evicted.bytes, "evicted");
                result.items_removed += evicted.items;
                result.space_freed += evicted.bytes;
                result.categories.push(CategoryCleanup {
                    category,
                    items_removed: evicted.items,
                    space_freed: evicted.bytes,
                });
            }

            if pressured && fraction_of(used, capacity) <= inner.config.cleanup_target {
                break;
            }
        }

        inner.needs_cleanup.store(false, Ordering::SeqCst);
        tracing::info!(
            items_removed = result.items_removed,
            space_freed = result.space_freed,
            skipped_in_flight = exclude.len(),
            "storage cleanup complete"
        );
        publish(
            &inner.events,
            SyncEvent::CleanupCompleted {
                items_removed: result.items_removed,
                space_freed: result.space_freed,
            },
        );
        Ok(result)
    }

    /// Check that `bytes` more fit in the quota before writing them.
    ///
    /// A refusal raises the sticky `needs_cleanup` flag until the next cleanup.
    pub async fn reserve(&self, bytes: u64) -> Result<(), StorageError> {
        let inner = &*self.inner;
        let capacity = inner.quota.capacity().await?;
        let available = capacity.saturating_sub(self.measure().await?.used());
        if bytes <= available {
            return Ok(());
        }

        inner.needs_cleanup.store(true, Ordering::SeqCst);
        let message = format!("storage quota exceeded: {bytes} bytes requested, {available} available");
        tracing::warn!(requested = bytes, available, "storage quota exceeded");
        publish(&inner.events, SyncEvent::StorageWarning { message });
        Err(StorageError::QuotaExceeded {
            requested: bytes,
            available,
        })
    }

    pub fn needs_cleanup_flag(&self) -> bool {
        self.inner.needs_cleanup.load(Ordering::SeqCst)
    }

    /// Periodically clean up when [`StorageManager::should_perform_cleanup`] says so.
    ///
    /// Returns `false` when maintenance was already running.
    pub fn start_maintenance(&self) -> bool {
        let mut slot = lock(&self.inner.maintenance);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let period = self.inner.config.check_interval;
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(spawn_periodic("storage-maintenance", period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                let manager = StorageManager { inner };
                match manager.should_perform_cleanup().await {
                    Ok(true) => {
                        if let Err(err) = manager.perform_cleanup().await {
                            tracing::warn!(error = %err, "scheduled cleanup failed");
                        }
                    }
                    Ok(false) => {}
                    Err(err) => tracing::warn!(error = %err, "storage check failed"),
                }
                ControlFlow::Continue(())
            }
        }));
        true
    }

    pub async fn stop_maintenance(&self) {
        let handle = lock(&self.inner.maintenance).take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    async fn measure(&self) -> Result<Measured, StoreError> {
        let inner = &*self.inner;
        Ok(Measured {
            jobs: inner.jobs.usage().await?,
            cache: inner.cache.usage_in(Namespace::Cache).await?,
            metadata: inner.cache.usage_in(Namespace::Metadata).await?,
        })
    }
}

impl core::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StorageManager")
            .field("config", &self.inner.config)
            .field("needs_cleanup", &self.needs_cleanup_flag())
            .finish_non_exhaustive()
    }
}

/// Growth between the first and last sample, once they span at least an hour.
fn trend(samples: &[&CacheEntry], available: u64) -> Option<StorageTrend> {
    let (first, last) = (*samples.first()?, *samples.last()?);
    let span = last.updated_at - first.updated_at;
    if span < chrono::Duration::hours(1) {
        return None;
    }

    let used = |e: &CacheEntry| e.value.get("used").and_then(|v| v.as_u64()).unwrap_or(0) as f64;
    let days = span.num_seconds() as f64 / 86_400.0;
    let daily_growth = (used(last) - used(first)) / days;
    let days_until_full = (daily_growth > 0.0).then(|| available as f64 / daily_growth);

    Some(StorageTrend {
        daily_growth,
        days_until_full,
    })
}

fn fraction_of(bytes: u64, capacity: u64) -> f64 {
    if capacity == 0 {
        return if bytes == 0 { 0.0 } else { 1.0 };
    }
    bytes as f64 / capacity as f64
}

fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_default()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use fieldqueue_core::{NewAttachment, WorkSubmission};
    use fieldqueue_events::{EventBus, InMemoryEventBus};

    struct Harness {
        manager: StorageManager,
        store: Arc<InMemoryStore>,
        events: SharedEventBus,
        in_flight: InFlight,
    }

    fn harness(quota: u64) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let events: SharedEventBus = Arc::new(InMemoryEventBus::new());
        let in_flight = InFlight::new();
        let manager = StorageManager::new(
            store.clone(),
            store.clone(),
            Arc::new(FixedQuota(quota)),
            in_flight.clone(),
            events.clone(),
            StorageConfig::default(),
        );
        Harness {
            manager,
            store,
            events,
            in_flight,
        }
    }

    async fn add_with_photo(h: &Harness, action: u64, bytes: usize) -> fieldqueue_core::JobId {
        h.store
            .add_job(
                WorkSubmission::new("0xgarden", action, "t").into(),
                vec![NewAttachment::new("photo.jpg", "image/jpeg", vec![0; bytes])],
            )
            .await
            .unwrap()
    }

    async fn add_synced_with_photo(h: &Harness, action: u64, bytes: usize) -> fieldqueue_core::JobId {
        let id = add_with_photo(h, action, bytes).await;
        h.store.mark_synced(id, Some(format!("r{action}"))).await.unwrap();
        id
    }

    #[tokio::test]
    async fn analytics_breakdown_sums_to_used() {
        let h = harness(1_000_000);
        add_with_photo(&h, 1, 1_000).await;
        h.store
            .put(Namespace::Cache, "garden/0xgarden", &json!({"name": "north"}))
            .await
            .unwrap();

        let analytics = h.manager.get_analytics().await.unwrap();
        let b = analytics.breakdown;

        assert_eq!(b.work_records + b.attachments + b.cache + b.metadata, analytics.quota.used);
        assert_eq!(b.attachments, 1_000);
        assert!(b.metadata > 0);
        assert_eq!(analytics.quota.available, 1_000_000 - analytics.quota.used);
        assert!(!analytics.needs_cleanup);
        assert_eq!(analytics.recommended_actions, vec![RecommendedAction::SyncPendingWork]);
        assert!(analytics.trend.is_none());

        h.manager.get_analytics().await.unwrap();
        assert_eq!(h.store.list(Namespace::Metadata, SAMPLE_PREFIX).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn over_threshold_needs_cleanup() {
        let h = harness(10_000);
        add_synced_with_photo(&h, 1, 5_000).await;
        add_with_photo(&h, 2, 4_000).await;

        let analytics = h.manager.get_analytics().await.unwrap();

        assert!(analytics.quota.percentage > 80.0);
        assert!(analytics.needs_cleanup);
        assert!(analytics.recommended_actions.contains(&RecommendedAction::ClearSyncedMedia));
        assert!(h.manager.should_perform_cleanup().await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_keeps_unsynced_work() {
        let h = harness(10_000);
        let synced = add_synced_with_photo(&h, 1, 5_000).await;
        let pending = add_with_photo(&h, 2, 4_000).await;
        let before = h.manager.get_analytics().await.unwrap().quota.used;

        let result = h.manager.perform_cleanup().await.unwrap();

        let after = h.manager.get_analytics().await.unwrap().quota.used;
        assert_eq!(before - after, result.space_freed);
        assert_eq!(result.categories[0].category, CleanupCategory::SyncedAttachments);
        assert_eq!(result.categories[0].space_freed, 5_000);
        assert!(h.store.attachments(synced).await.unwrap().is_empty());
        assert_eq!(h.store.attachments(pending).await.unwrap().len(), 1);
        assert_eq!(h.store.pending_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pressured_cleanup_stops_at_target() {
        let h = harness(10_000);
        add_synced_with_photo(&h, 1, 8_500).await;
        let old = Utc::now() - chrono::Duration::days(30);
        h.store
            .put_at(Namespace::Cache, "garden/stale", &json!({"n": 1}), old)
            .await
            .unwrap();

        let result = h.manager.perform_cleanup().await.unwrap();

        assert_eq!(result.categories.len(), 1);
        assert!(h.store.get(Namespace::Cache, "garden/stale", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn relaxed_cleanup_visits_every_category() {
        let h = harness(1_000_000);
        let old = Utc::now() - chrono::Duration::days(30);
        h.store
            .put_at(Namespace::Cache, "garden/stale", &json!({"n": 1}), old)
            .await
            .unwrap();
        h.store
            .put_at(Namespace::Cache, "garden/fresh", &json!({"n": 2}), Utc::now())
            .await
            .unwrap();
        h.store
            .put_at(Namespace::Metadata, &format!("{SAMPLE_PREFIX}old"), &json!({"used": 1}), old)
            .await
            .unwrap();

        let result = h.manager.perform_cleanup().await.unwrap();

        let categories: Vec<_> = result.categories.iter().map(|c| c.category).collect();
        assert_eq!(categories, vec![CleanupCategory::StaleCache, CleanupCategory::StaleMetadata]);
        assert!(h.store.get(Namespace::Cache, "garden/fresh", None).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn in_flight_jobs_are_not_evicted() {
        let h = harness(10_000);
        let synced = add_synced_with_photo(&h, 1, 5_000).await;
        let _claim = h.in_flight.try_claim(synced).unwrap();

        let result = h.manager.perform_cleanup().await.unwrap();

        assert_eq!(result.space_freed, 0);
        assert_eq!(h.store.attachments(synced).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn refused_reservation_flags_cleanup() {
        let h = harness(10_000);
        let events = h.events.subscribe();
        add_synced_with_photo(&h, 1, 6_000).await;

        let err = h.manager.reserve(5_000).await.unwrap_err();

        assert!(matches!(err, StorageError::QuotaExceeded { requested: 5_000, .. }));
        assert!(h.manager.needs_cleanup_flag());
        assert!(h.manager.get_analytics().await.unwrap().needs_cleanup);
        assert!(events.drain().iter().any(|e| e.name() == "storage_warning"));

        h.manager.perform_cleanup().await.unwrap();
        assert!(!h.manager.needs_cleanup_flag());
        assert!(h.manager.reserve(5_000).await.is_ok());
    }

    #[tokio::test]
    async fn trend_projects_days_until_full() {
        let h = harness(100_000);
        let now = Utc::now();
        h.store
            .put_at(
                Namespace::Metadata,
                &format!("{SAMPLE_PREFIX}a"),
                &json!({"used": 1_000}),
                now - chrono::Duration::minutes(24 * 60 + 30),
            )
            .await
            .unwrap();
        h.store
            .put_at(
                Namespace::Metadata,
                &format!("{SAMPLE_PREFIX}b"),
                &json!({"used": 3_000}),
                now - chrono::Duration::minutes(30),
            )
            .await
            .unwrap();

        let trend = h.manager.get_analytics().await.unwrap().trend.unwrap();

        assert!((trend.daily_growth - 2_000.0).abs() < 1.0);
        let days = trend.days_until_full.unwrap();
        assert!(days > 45.0 && days < 50.0, "{days}");
        assert!(!h.manager.should_perform_cleanup().await.unwrap());
    }

    #[tokio::test]
    async fn fast_growth_triggers_cleanup() {
        let h = harness(1_000_000);
        let now = Utc::now();
        for (key, used, minutes) in [("a", 0, 24 * 60 + 30), ("b", 800_000, 30)] {
            h.store
                .put_at(
                    Namespace::Metadata,
                    &format!("{SAMPLE_PREFIX}{key}"),
                    &json!({"used": used}),
                    now - chrono::Duration::minutes(minutes),
                )
                .await
                .unwrap();
        }

        let analytics = h.manager.get_analytics().await.unwrap();

        assert!(!analytics.needs_cleanup);
        assert!(h.manager.should_perform_cleanup().await.unwrap());
    }
}
