//! Sync manager: drains the job store against the remote authority.
//!
//! A flush walks unsynced jobs in FIFO order and submits them one at a time:
//! - success marks the job synced,
//! - a structured rejection moves it to `rejected` and is never retried by flush,
//! - a network failure or timeout counts an attempt and schedules a backoff; once the
//!   retry budget is spent the job stalls and waits for a conflict resolution.
//!
//! Flushes are mutually exclusive. A caller arriving while one runs joins it and gets
//! the same report instead of starting a second pass.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use fieldqueue_core::{Job, JobFilter, JobId, JobStatus, SyncStatus};
use fieldqueue_events::SyncEvent;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::in_flight::InFlight;
use crate::offline::ConnectivityMonitor;
use crate::registry::KindRegistry;
use crate::remote::submit_with_timeout;
use crate::store::JobStore;
use crate::worker::{WorkerHandle, spawn_periodic};
use crate::{SharedEventBus, publish};

/// Outcome of one flush pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    /// Jobs newly confirmed by the remote.
    pub processed: usize,
    /// Jobs the remote rejected, or whose retry budget ran out; not retried by flush.
    pub failed: usize,
    /// Jobs not attempted: in flight, backing off, unhandled kind, or behind an open
    /// circuit breaker. When offline, every pending job.
    pub skipped: usize,
    /// Jobs that failed transiently and stay eligible for a later pass.
    pub deferred: usize,
}

#[derive(Debug, Clone)]
struct FlushRound {
    generation: u64,
    outcome: Result<FlushReport, StoreError>,
    /// The round found the client offline and attempted nothing.
    offline: bool,
}

/// Cheap to clone; clones drive the same queue.
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    store: Arc<dyn JobStore>,
    registry: KindRegistry,
    connectivity: ConnectivityMonitor,
    in_flight: InFlight,
    events: SharedEventBus,
    config: SyncConfig,
    status: watch::Sender<SyncStatus>,
    running: Mutex<bool>,
    rounds: watch::Sender<FlushRound>,
    periodic: Mutex<Option<WorkerHandle>>,
    watcher: Mutex<Option<WorkerHandle>>,
}

impl SyncManager {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: KindRegistry,
        connectivity: ConnectivityMonitor,
        in_flight: InFlight,
        events: SharedEventBus,
        config: SyncConfig,
    ) -> Self {
        let (status, _) = watch::channel(SyncStatus::Idle);
        let (rounds, _) = watch::channel(FlushRound {
            generation: 0,
            outcome: Ok(FlushReport::default()),
            offline: false,
        });

        Self {
            inner: Arc::new(SyncInner {
                store,
                registry,
                connectivity,
                in_flight,
                events,
                config,
                status,
                running: Mutex::new(false),
                rounds,
                periodic: Mutex::new(None),
                watcher: Mutex::new(None),
            }),
        }
    }

    /// Submit every eligible unsynced job.
    ///
    /// Coalesces with a flush already in progress. Per-job failures are recorded on the
    /// job and reflected in the report and in [`SyncManager::status`]; only a failing
    /// store makes the call itself fail.
    pub async fn flush(&self) -> Result<FlushReport, StoreError> {
        self.flush_round().await.0
    }

    /// Flush after connectivity returned. Joining a round that started while still
    /// offline would attempt nothing, so one fresh pass follows it.
    async fn flush_after_reconnect(&self) -> Result<FlushReport, StoreError> {
        let (outcome, ran_offline) = self.flush_round().await;
        if ran_offline && !self.inner.connectivity.is_offline() {
            tracing::debug!("joined an offline round; flushing again");
            return self.flush().await;
        }
        outcome
    }

    async fn flush_round(&self) -> (Result<FlushReport, StoreError>, bool) {
        let mut rounds = self.inner.rounds.subscribe();
        let join_target = {
            let mut running = lock(&self.inner.running);
            if *running {
                Some(rounds.borrow().generation + 1)
            } else {
                *running = true;
                None
            }
        };

        if let Some(target) = join_target {
            tracing::debug!("flush already in progress; joining it");
            return match rounds.wait_for(|round| round.generation >= target).await {
                Ok(round) => (round.outcome.clone(), round.offline),
                Err(_) => (
                    Err(StoreError::unavailable("sync manager dropped during flush")),
                    false,
                ),
            };
        }

        let round = RoundGuard {
            inner: &self.inner,
            finished: false,
        };
        let offline = self.inner.connectivity.is_offline();
        let outcome = if offline {
            self.skip_offline().await
        } else {
            self.run_pass().await
        };
        round.finish(outcome.clone(), offline);
        (outcome, offline)
    }

    pub fn is_sync_in_progress(&self) -> bool {
        *lock(&self.inner.running)
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status.subscribe()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.inner.connectivity
    }

    /// Put a rejected or stalled job back in line with a fresh retry budget.
    pub async fn retry_job(&self, id: JobId) -> Result<Job, StoreError> {
        let store = &self.inner.store;
        let mut job = store.get_job(id).await?.ok_or(StoreError::NotFound(id))?;

        if matches!(job.status, JobStatus::Rejected | JobStatus::Stalled) {
            job.requeue();
            store.update(&job).await?;
            tracing::info!(job_id = %id, "job requeued for sync");
        }
        Ok(job)
    }

    /// Flush every `interval` (default: the configured one) until stopped.
    ///
    /// Returns `false` when periodic sync was already running; at most one timer exists.
    pub fn start_periodic_sync(&self, interval: Option<Duration>) -> bool {
        let mut slot = lock(&self.inner.periodic);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            tracing::debug!("periodic sync already running");
            return false;
        }

        let period = interval.unwrap_or(self.inner.config.interval);
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(spawn_periodic("periodic-sync", period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    return ControlFlow::Break(());
                };
                if let Err(err) = (SyncManager { inner }).flush().await {
                    tracing::warn!(error = %err, "periodic flush failed");
                }
                ControlFlow::Continue(())
            }
        }));

        tracing::info!(interval_secs = period.as_secs_f64(), "periodic sync started");
        true
    }

    /// Stop scheduling flushes. A flush already running completes.
    pub async fn stop_periodic_sync(&self) {
        let handle = lock(&self.inner.periodic).take();
        if let Some(handle) = handle {
            handle.stop().await;
            tracing::info!("periodic sync stopped");
        }
    }

    /// React to connectivity changes: publish them, and flush on every return online.
    ///
    /// Returns `false` when the watcher was already running.
    pub fn watch_connectivity(&self) -> bool {
        let mut slot = lock(&self.inner.watcher);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        // Read the starting state here, so a change racing the spawn is still seen.
        let mut rx = self.inner.connectivity.subscribe();
        let mut previous = *rx.borrow_and_update();
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(WorkerHandle::spawn("connectivity-watcher", move |shutdown| async move {
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let current = *rx.borrow_and_update();
                if current == previous {
                    continue;
                }
                previous = current;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = SyncManager { inner };
                manager.emit(SyncEvent::ConnectivityChanged { state: current });

                if current.is_online() {
                    tokio::spawn(async move {
                        if let Err(err) = manager.flush_after_reconnect().await {
                            tracing::warn!(error = %err, "flush after reconnect failed");
                        }
                    });
                }
            }
        }));
        true
    }

    /// Stop periodic sync and the connectivity watcher.
    pub async fn shutdown(&self) {
        self.stop_periodic_sync().await;
        let watcher = lock(&self.inner.watcher).take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
    }

    /// Offline pass: nothing is submitted; jobs a pass would attempt count as skipped.
    async fn skip_offline(&self) -> Result<FlushReport, StoreError> {
        let skipped = self
            .inner
            .store
            .get_jobs(JobFilter::unsynced().with_status(JobStatus::Pending))
            .await?
            .len();
        tracing::debug!(skipped, "offline; flush deferred until connectivity returns");
        let report = FlushReport {
            skipped,
            ..FlushReport::default()
        };
        self.emit_report(&report);
        Ok(report)
    }

    async fn run_pass(&self) -> Result<FlushReport, StoreError> {
        self.set_status(SyncStatus::Syncing);
        match self.drain().await {
            Ok((report, last_error)) => {
                self.set_status(match last_error {
                    Some(message) => SyncStatus::Error { message },
                    None => SyncStatus::Idle,
                });
                tracing::info!(
                    processed = report.processed,
                    failed = report.failed,
                    skipped = report.skipped,
                    deferred = report.deferred,
                    "flush complete"
                );
                self.emit_report(&report);
                Ok(report)
            }
            Err(err) => {
                tracing::error!(error = %err, "flush aborted");
                self.set_status(SyncStatus::error(err.to_string()));
                Err(err)
            }
        }
    }

    /// One pass over the pending jobs. Returns the report and the last per-job error.
    async fn drain(&self) -> Result<(FlushReport, Option<String>), StoreError> {
        let inner = &*self.inner;
        let jobs = inner
            .store
            .get_jobs(JobFilter::unsynced().with_status(JobStatus::Pending))
            .await?;

        let mut report = FlushReport::default();
        let mut last_error = None;
        let mut consecutive_failures = 0u32;
        let mut breaker_open = false;

        for queued in jobs {
            if breaker_open || !queued.is_due(Utc::now()) {
                report.skipped += 1;
                continue;
            }
            let Some(entry) = inner.registry.get(queued.kind) else {
                tracing::warn!(job_id = %queued.id, kind = %queued.kind, "no submit handler registered; skipping");
                report.skipped += 1;
                continue;
            };
            let Some(_claim) = inner.in_flight.try_claim(queued.id) else {
                tracing::debug!(job_id = %queued.id, "job already in flight; skipping");
                report.skipped += 1;
                continue;
            };

            // The listing can be stale: a conflict resolution may have changed the job.
            let job = match inner.store.get_job(queued.id).await? {
                Some(job) if job.is_due(Utc::now()) => job,
                _ => {
                    report.skipped += 1;
                    continue;
                }
            };
            let attachments = inner.store.attachments(job.id).await?;

            let submitted = submit_with_timeout(
                entry.submitter.as_ref(),
                &job,
                &attachments,
                inner.config.submit_timeout,
            )
            .await;

            match submitted {
                Ok(receipt) => {
                    inner.store.mark_synced(job.id, receipt.remote_id.clone()).await?;
                    consecutive_failures = 0;
                    report.processed += 1;
                    tracing::info!(job_id = %job.id, kind = %job.kind, remote_id = ?receipt.remote_id, "job synced");
                    self.emit(SyncEvent::JobSynced {
                        job_id: job.id,
                        remote_id: receipt.remote_id,
                    });
                }
                Err(err) if err.is_transient() => {
                    let message = err.to_string();
                    let mut job = job;
                    job.record_failure(message.clone());
                    let stalled = job.schedule_retry(&inner.config.retry, Utc::now());
                    inner.store.update(&job).await?;

                    if stalled {
                        report.failed += 1;
                        tracing::warn!(job_id = %job.id, attempts = job.attempts, error = %message, "retry budget exhausted; job stalled");
                        self.emit(SyncEvent::JobStalled {
                            job_id: job.id,
                            attempts: job.attempts,
                        });
                    } else {
                        report.deferred += 1;
                        tracing::warn!(job_id = %job.id, attempts = job.attempts, next_attempt_at = ?job.next_attempt_at, error = %message, "submission failed; will retry");
                    }
                    self.emit(SyncEvent::JobFailed {
                        job_id: job.id,
                        error: message.clone(),
                        retryable: !stalled,
                    });
                    last_error = Some(message);

                    consecutive_failures += 1;
                    let threshold = inner.config.circuit_breaker_threshold;
                    if threshold > 0 && consecutive_failures >= threshold {
                        breaker_open = true;
                        tracing::warn!(consecutive_failures, "circuit breaker open; skipping the rest of this pass");
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    let mut job = job;
                    job.record_failure(message.clone());
                    job.mark_rejected(message.clone());
                    inner.store.update(&job).await?;

                    consecutive_failures = 0;
                    report.failed += 1;
                    tracing::warn!(job_id = %job.id, error = %message, "job rejected by remote");
                    self.emit(SyncEvent::JobFailed {
                        job_id: job.id,
                        error: message.clone(),
                        retryable: false,
                    });
                    last_error = Some(message);
                }
            }
        }

        Ok((report, last_error))
    }

    fn set_status(&self, next: SyncStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next.clone();
                true
            }
        });
        if changed {
            self.emit(SyncEvent::StatusChanged { status: next });
        }
    }

    fn emit_report(&self, report: &FlushReport) {
        self.emit(SyncEvent::FlushCompleted {
            processed: report.processed,
            failed: report.failed,
            skipped: report.skipped,
            deferred: report.deferred,
        });
    }

    fn emit(&self, event: SyncEvent) {
        publish(&self.inner.events, event);
    }
}

impl core::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManager")
            .field("status", &self.status())
            .field("in_progress", &self.is_sync_in_progress())
            .finish_non_exhaustive()
    }
}

/// Publishes the outcome of the running round and releases the flush slot, also when
/// the leading flush future is dropped mid-pass.
struct RoundGuard<'a> {
    inner: &'a SyncInner,
    finished: bool,
}

impl RoundGuard<'_> {
    fn finish(mut self, outcome: Result<FlushReport, StoreError>, offline: bool) {
        self.publish(outcome, offline);
        self.finished = true;
    }

    fn publish(&self, outcome: Result<FlushReport, StoreError>, offline: bool) {
        let mut running = lock(&self.inner.running);
        self.inner.rounds.send_modify(|round| {
            round.generation += 1;
            round.outcome = outcome;
            round.offline = offline;
        });
        *running = false;
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!("flush cancelled before completion");
            self.inner
                .status
                .send_replace(SyncStatus::error("flush cancelled"));
            self.publish(Err(StoreError::unavailable("flush cancelled")), false);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
