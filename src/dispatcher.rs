//! Entry point for background work: ad-hoc jobs and the "sync all" driver.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::jobs::{Job, JobKind, JobResult, JobTicket, WorkerPool};
use crate::progress::{ProgressTracker, SyncProgress};
use crate::sync::{SyncReport, SyncStatus};

/// One repository in a "sync all" run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub repo_id: String,
    pub name: String,
}

impl SyncTarget {
    pub fn new(repo_id: &str, name: &str) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncAllOptions {
    pub force_full: bool,
    pub sync_issues: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetFailure {
    pub repo_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncAllReport {
    /// Reports from targets that synced, in run order.
    pub reports: Vec<SyncReport>,
    pub failures: Vec<TargetFailure>,
    pub succeeded: u32,
    pub failed: u32,
    /// The run stopped early because a cancel was requested.
    pub cancelled: bool,
}

/// Read side of the dispatcher's progress. Cheap to clone; any number of
/// pollers may hold one.
#[derive(Clone)]
pub struct ProgressHandle {
    rx: watch::Receiver<SyncProgress>,
}

impl ProgressHandle {
    pub fn get(&self) -> SyncProgress {
        self.rx.borrow().clone()
    }

    /// Wait for the next published snapshot. `false` once the dispatcher is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

/// Requests that a "sync all" run stop after its in-flight target.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owns the worker pool and the progress tracker. The tracker is only ever
/// mutated here; everyone else sees published snapshots.
pub struct Dispatcher {
    pool: WorkerPool,
    tracker: ProgressTracker,
    progress_tx: watch::Sender<SyncProgress>,
    cancel: CancelHandle,
}

impl Dispatcher {
    pub fn new(pool: WorkerPool) -> Self {
        Self::with_tracker(pool, ProgressTracker::new())
    }

    pub fn with_tracker(pool: WorkerPool, tracker: ProgressTracker) -> Self {
        let (progress_tx, _) = watch::channel(tracker.snapshot());
        Self {
            pool,
            tracker,
            progress_tx,
            cancel: CancelHandle::default(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Dispatch an ad-hoc job. These run independently of any "sync all" run.
    pub fn submit(&self, kind: JobKind) -> JobTicket {
        self.pool.submit(Job::new(kind))
    }

    pub fn progress(&self) -> SyncProgress {
        self.progress_tx.borrow().clone()
    }

    pub fn progress_handle(&self) -> ProgressHandle {
        ProgressHandle {
            rx: self.progress_tx.subscribe(),
        }
    }

    /// A cancel requested while no run is active applies to the next run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Sync `targets` one at a time, in the order given.
    ///
    /// A failing target is recorded and the run moves on. Cancellation is
    /// checked between targets; the in-flight job is never interrupted.
    pub async fn sync_all(&mut self, targets: &[SyncTarget], options: SyncAllOptions) -> SyncAllReport {
        let mut report = SyncAllReport::default();
        self.tracker.start(targets.len() as u32);
        self.publish();

        for target in targets {
            if self.cancel.is_cancelled() {
                log::warn!("Sync run cancelled before {}", target.repo_id);
                self.tracker.cancel("requested by caller");
                self.publish();
                report.cancelled = true;
                break;
            }

            self.tracker.set_current_target(&target.repo_id, &target.name);
            self.publish();

            let ticket = self.pool.submit(Job::new(JobKind::SyncRepository {
                repo_id: target.repo_id.clone(),
                force_full: options.force_full,
                sync_issues: options.sync_issues,
            }));
            let outcome = ticket.await;

            let failure = match outcome.result {
                Ok(JobResult::Sync(sync)) if sync.status == SyncStatus::Failed => {
                    let message = sync.error.clone().unwrap_or_else(|| "sync failed".to_string());
                    report.reports.push(sync);
                    Some(message)
                }
                Ok(JobResult::Sync(sync)) => {
                    if let Some(warning) = &sync.error {
                        log::warn!("{} synced with errors: {warning}", target.repo_id);
                    }
                    report.reports.push(sync);
                    None
                }
                Ok(other) => Some(format!("unexpected job result {other:?}")),
                Err(e) => Some(e.to_string()),
            };

            match failure {
                None => {
                    report.succeeded += 1;
                    self.tracker.complete_target();
                }
                Some(message) => {
                    log::error!("Sync of {} failed: {message}", target.repo_id);
                    report.failed += 1;
                    self.tracker.fail_target(&message);
                    report.failures.push(TargetFailure {
                        repo_id: target.repo_id.clone(),
                        message,
                    });
                }
            }
            self.publish();
        }

        if !report.cancelled {
            self.tracker.complete_sync();
            self.publish();
        }
        self.cancel.reset();
        report
    }

    fn publish(&self) {
        self.progress_tx.send_replace(self.tracker.snapshot());
    }
}
