//! Background task primitive shared by periodic sync, the connectivity watcher and
//! storage maintenance.
//!
//! A worker loops on `tokio::select!` over its shutdown signal and its trigger. The body
//! of an iteration runs outside the select, so shutdown only prevents future iterations
//! and never interrupts one in progress.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub struct WorkerHandle {
    name: &'static str,
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `body` with the shutdown signal it must honor.
    pub fn spawn<F, Fut>(name: &'static str, body: F) -> Self
    where
        F: FnOnce(Arc<Notify>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let fut = body(shutdown.clone());
        let join = tokio::spawn(async move {
            tracing::debug!(worker = name, "worker started");
            fut.await;
            tracing::debug!(worker = name, "worker stopped");
        });

        Self {
            name,
            shutdown,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Request graceful shutdown without waiting for it.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Request shutdown and wait for the current iteration to finish.
    pub async fn stop(self) {
        self.shutdown();
        if let Err(err) = self.join.await {
            if err.is_panic() {
                tracing::error!(worker = self.name, "worker panicked: {err}");
            }
        }
    }
}

/// Run `tick` every `period`, starting immediately, until shutdown or until `tick`
/// breaks.
pub fn spawn_periodic<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ControlFlow<()>> + Send + 'static,
{
    WorkerHandle::spawn(name, move |shutdown| async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!(worker = name, "received shutdown signal");
                    break;
                }
                _ = interval.tick() => {}
            }

            if tick().await.is_break() {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_stopped() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let handle = spawn_periodic("test", Duration::from_secs(10), move || {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                ControlFlow::Continue(())
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        handle.stop().await;
        let ticks = count.load(Ordering::SeqCst);
        assert_eq!(ticks, 3);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), ticks);
    }

    #[tokio::test]
    async fn breaking_ends_the_worker() {
        let handle = spawn_periodic("once", Duration::from_millis(5), || async {
            ControlFlow::Break(())
        });

        for _ in 0..100 {
            if handle.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_finished());
    }
}
