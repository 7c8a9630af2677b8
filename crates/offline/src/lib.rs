//! `fieldqueue-offline`: offline job queue and sync engine.
//!
//! Jobs created while disconnected are persisted by a [`JobStore`], drained against the
//! remote authority by the [`SyncManager`], compared with authoritative records by the
//! [`ConflictResolver`] and kept within quota by the [`StorageManager`]. [`OfflineSync`]
//! wires the four together behind one handle.

use std::sync::Arc;

use fieldqueue_events::{EventBus, InMemoryEventBus, SyncEvent};

pub mod config;
pub mod conflict;
pub mod error;
pub mod in_flight;
pub mod offline;
pub mod orchestrator;
pub mod registry;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync_manager;
pub mod worker;

#[cfg(feature = "http")]
pub mod http;

pub use config::{ConflictConfig, OfflineConfig, StorageConfig, SyncConfig};
pub use conflict::{
    AutoResolveReport, ConflictResolver, ResolutionStrategy, ResolvedRecord, nearest_match,
};
pub use error::{
    ConflictError, OfflineError, RejectionReason, StorageError, StoreError, SubmitError,
};
pub use in_flight::{InFlight, InFlightGuard};
pub use offline::ConnectivityMonitor;
pub use orchestrator::{OfflineSync, QueueStatus};
pub use registry::{ConflictComparator, FieldComparator, KindEntry, KindRegistry};
pub use remote::{
    InMemoryRemote, RecordQuery, RemoteQuery, RemoteReceipt, RemoteSnapshot, SubmitHandler,
};
pub use storage::{
    CategoryCleanup, CleanupCategory, CleanupResult, FixedQuota, QuotaProvider, QuotaUsage,
    RecommendedAction, StorageAnalytics, StorageBreakdown, StorageManager, StorageTrend,
};
pub use store::{
    CacheEntry, CacheStore, InMemoryStore, JobStore, JobUsage, Namespace, SqliteStore, Stores,
    Usage, open_stores,
};
pub use sync_manager::{FlushReport, SyncManager};

/// Event bus shared by every component of one queue.
pub type SharedEventBus = Arc<InMemoryEventBus<SyncEvent>>;

/// Publish without failing the caller; events are notifications, state is the truth.
pub(crate) fn publish(bus: &SharedEventBus, event: SyncEvent) {
    if let Err(err) = bus.publish(event) {
        tracing::warn!(error = ?err, "failed to publish sync event");
    }
}
