//! Connectivity state and change notification.

use std::sync::Arc;

use fieldqueue_core::ConnectivityState;
use tokio::sync::watch;

/// Platform connectivity signal.
///
/// Cloning yields another handle to the same state; the platform layer calls
/// `set_online`/`set_offline` and the sync manager reacts through `subscribe`.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<ConnectivityState>>,
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (state, _) = watch::channel(initial);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Mark the client as online. Returns whether the state changed.
    pub fn set_online(&self) -> bool {
        self.set(ConnectivityState::Online)
    }

    /// Mark the client as offline. Returns whether the state changed.
    pub fn set_offline(&self) -> bool {
        self.set(ConnectivityState::Offline)
    }

    pub fn set(&self, next: ConnectivityState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            tracing::info!(state = ?next, "connectivity changed");
        }
        changed
    }

    pub fn is_offline(&self) -> bool {
        self.state() == ConnectivityState::Offline
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::Online)
    }
}
