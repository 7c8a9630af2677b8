//! `OfflineSync`: one handle wiring store, sync manager, conflict resolver and storage
//! manager around a shared event bus and in-flight registry.
//!
//! Construct it once at startup and hand it (or its components) to every consumer.

use std::sync::Arc;

use fieldqueue_core::{
    ConnectivityState, Job, JobFilter, JobId, JobPayload, NewAttachment, SyncStatus,
};
use fieldqueue_events::{EventBus, InMemoryEventBus, Subscription, SyncEvent};
use serde::Serialize;

use crate::config::OfflineConfig;
use crate::conflict::ConflictResolver;
use crate::error::{OfflineError, StoreError};
use crate::in_flight::InFlight;
use crate::offline::ConnectivityMonitor;
use crate::registry::KindRegistry;
use crate::remote::RemoteQuery;
use crate::storage::{FixedQuota, QuotaProvider, StorageManager};
use crate::store::{Stores, open_stores};
use crate::sync_manager::{FlushReport, SyncManager};
use crate::{SharedEventBus, publish};

/// Everything a status view needs, read in one call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending_count: usize,
    pub pending_work: Vec<Job>,
    pub sync_status: SyncStatus,
    pub connectivity: ConnectivityState,
    pub conflict_count: usize,
    pub needs_cleanup: bool,
    /// Queued work lives in memory only and will not survive a restart.
    pub storage_degraded: bool,
}

pub struct OfflineSync {
    stores: Stores,
    registry: KindRegistry,
    events: SharedEventBus,
    sync: SyncManager,
    conflicts: ConflictResolver,
    storage: StorageManager,
}

impl OfflineSync {
    /// Open the persistent store named by `config` and wire every component.
    ///
    /// An unusable database degrades to in-memory state instead of failing; see
    /// [`QueueStatus::storage_degraded`].
    pub async fn open(
        config: OfflineConfig,
        registry: KindRegistry,
        remote: Arc<dyn RemoteQuery>,
    ) -> Self {
        let stores = open_stores(&config).await;
        let quota = Arc::new(FixedQuota(config.storage.quota_bytes));
        Self::with_stores(config, stores, registry, remote, quota)
    }

    pub fn with_stores(
        config: OfflineConfig,
        stores: Stores,
        registry: KindRegistry,
        remote: Arc<dyn RemoteQuery>,
        quota: Arc<dyn QuotaProvider>,
    ) -> Self {
        let events: SharedEventBus = Arc::new(InMemoryEventBus::new());
        let in_flight = InFlight::new();
        let connectivity = ConnectivityMonitor::default();

        let sync = SyncManager::new(
            stores.jobs.clone(),
            registry.clone(),
            connectivity,
            in_flight.clone(),
            events.clone(),
            config.sync.clone(),
        );
        let conflicts = ConflictResolver::new(
            stores.jobs.clone(),
            registry.clone(),
            remote,
            in_flight.clone(),
            events.clone(),
        )
        .with_window(config.conflicts.window)
        .with_submit_timeout(config.sync.submit_timeout);
        let storage = StorageManager::new(
            stores.jobs.clone(),
            stores.cache.clone(),
            quota,
            in_flight,
            events.clone(),
            config.storage.clone(),
        );

        tracing::info!(
            kinds = ?registry.kinds(),
            degraded = stores.degraded,
            "offline sync initialized"
        );

        Self {
            stores,
            registry,
            events,
            sync,
            conflicts,
            storage,
        }
    }

    /// Queue a new job. Attachment bytes must fit in the storage quota.
    pub async fn enqueue(
        &self,
        payload: JobPayload,
        attachments: Vec<NewAttachment>,
    ) -> Result<JobId, OfflineError> {
        payload.validate()?;
        let kind = payload.kind();
        if !self.registry.contains(kind) {
            return Err(OfflineError::UnknownKind(kind));
        }

        let bytes: u64 = attachments.iter().map(NewAttachment::size).sum();
        if bytes > 0 {
            self.storage.reserve(bytes).await?;
        }

        let job_id = self.stores.jobs.add_job(payload, attachments).await?;
        tracing::info!(%job_id, %kind, attachment_bytes = bytes, "job queued");
        publish(&self.events, SyncEvent::JobQueued { job_id, kind });
        Ok(job_id)
    }

    pub async fn pending_count(&self) -> Result<usize, StoreError> {
        self.stores.jobs.pending_count().await
    }

    /// Unsynced jobs, oldest first.
    pub async fn pending_work(&self) -> Result<Vec<Job>, StoreError> {
        self.stores.jobs.get_jobs(JobFilter::unsynced()).await
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        self.sync.flush().await
    }

    pub async fn refetch(&self) -> Result<QueueStatus, OfflineError> {
        let pending_work = self.pending_work().await?;
        let needs_cleanup = self.storage.get_analytics().await?.needs_cleanup;

        Ok(QueueStatus {
            pending_count: pending_work.len(),
            pending_work,
            sync_status: self.sync.status(),
            connectivity: self.connectivity().state(),
            conflict_count: self.conflicts.conflict_count(),
            needs_cleanup,
            storage_degraded: self.stores.degraded,
        })
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn conflicts(&self) -> &ConflictResolver {
        &self.conflicts
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        self.sync.connectivity()
    }

    pub fn subscribe(&self) -> Subscription<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.stores.degraded
    }

    /// Start periodic sync, the connectivity watcher and storage maintenance.
    pub fn start(&self) {
        self.sync.start_periodic_sync(None);
        self.sync.watch_connectivity();
        self.storage.start_maintenance();
    }

    /// Stop every background task; work in progress finishes first.
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
        self.storage.stop_maintenance().await;
        tracing::info!("offline sync stopped");
    }
}

impl core::fmt::Debug for OfflineSync {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OfflineSync")
            .field("stores", &self.stores)
            .field("registry", &self.registry)
            .field("sync", &self.sync)
            .field("conflicts", &self.conflicts)
            .finish_non_exhaustive()
    }
}
