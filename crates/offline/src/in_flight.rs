//! Registry of jobs currently being submitted.
//!
//! Shared by the sync manager, the conflict resolver and the storage manager: whoever
//! holds the claim owns the job until the guard drops.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use fieldqueue_core::JobId;

#[derive(Debug, Clone, Default)]
pub struct InFlight {
    ids: Arc<Mutex<HashSet<JobId>>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id`; `None` when someone else already holds it.
    pub fn try_claim(&self, id: JobId) -> Option<InFlightGuard> {
        if self.lock().insert(id) {
            Some(InFlightGuard {
                id,
                ids: self.ids.clone(),
            })
        } else {
            None
        }
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.lock().contains(&id)
    }

    pub fn snapshot(&self) -> HashSet<JobId> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    id: JobId,
    ids: Arc<Mutex<HashSet<JobId>>>,
}

impl InFlightGuard {
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
