//! Live status of a multi-repository sync run.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Time source, injectable so estimates can be tested without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrentTarget {
    pub id: String,
    pub name: String,
}

/// Snapshot of a sync run. Always handed out by value.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncProgress {
    pub state: RunState,
    pub running: bool,
    pub total_repositories: u32,
    /// Targets attempted so far, successful or not.
    pub completed_repositories: u32,
    pub failed_repositories: u32,
    pub current_repository: Option<CurrentTarget>,
    pub start_time: Option<DateTime<Utc>>,
    pub estimated_end_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Default for SyncProgress {
    fn default() -> Self {
        Self {
            state: RunState::Idle,
            running: false,
            total_repositories: 0,
            completed_repositories: 0,
            failed_repositories: 0,
            current_repository: None,
            start_time: None,
            estimated_end_time: None,
            error: None,
        }
    }
}

/// State holder for one sync run: `idle -> running -> completed | failed`.
///
/// A failed target still counts as completed (attempted) and bumps
/// `failed_repositories`; the run finishes as `CompletedWithErrors`.
/// [`set_error`](Self::set_error) is terminal and stops the run.
pub struct ProgressTracker {
    progress: SyncProgress,
    clock: Arc<dyn Clock>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            progress: SyncProgress::default(),
            clock,
        }
    }

    pub fn start(&mut self, total: u32) {
        self.progress = SyncProgress {
            state: RunState::Running,
            running: true,
            total_repositories: total,
            start_time: Some(self.clock.now()),
            ..SyncProgress::default()
        };
        log::info!("Sync started: {total} repositories");
        if total == 0 {
            self.finish();
        }
    }

    pub fn set_current_target(&mut self, id: &str, name: &str) {
        if !self.progress.running {
            log::warn!("Ignoring current target {id} on a run that is not running");
            return;
        }
        self.progress.current_repository = Some(CurrentTarget {
            id: id.to_string(),
            name: name.to_string(),
        });
        self.update_estimate();
        log::debug!(
            "Syncing {name} ({}/{})",
            self.progress.completed_repositories + 1,
            self.progress.total_repositories
        );
    }

    /// Mark the current target done. Reaching the total ends the run.
    pub fn complete_target(&mut self) {
        self.advance();
    }

    /// Mark the current target done but failed; the run carries on.
    pub fn fail_target(&mut self, message: &str) {
        if !self.progress.running {
            return;
        }
        let label = self
            .progress
            .current_repository
            .as_ref()
            .map(|t| t.name.clone())
            .unwrap_or_else(|| "unknown".to_string());
        log::warn!("Target {label} failed: {message}");
        self.progress.failed_repositories += 1;
        let entry = format!("{label}: {message}");
        self.progress.error = Some(match self.progress.error.take() {
            Some(prev) => format!("{prev}; {entry}"),
            None => entry,
        });
        self.advance();
    }

    /// Record an unrecoverable error and stop the run.
    pub fn set_error(&mut self, message: &str) {
        log::error!("Sync failed: {message}");
        self.progress.error = Some(message.to_string());
        self.progress.running = false;
        self.progress.state = RunState::Failed;
        self.progress.current_repository = None;
        self.progress.estimated_end_time = None;
    }

    /// Forced termination, regardless of how many targets are left.
    pub fn complete_sync(&mut self) {
        if self.progress.running {
            self.finish();
        }
    }

    pub fn cancel(&mut self, reason: &str) {
        if self.progress.running {
            self.set_error(&format!("cancelled: {reason}"));
        }
    }

    pub fn snapshot(&self) -> SyncProgress {
        self.progress.clone()
    }

    fn advance(&mut self) {
        if !self.progress.running {
            log::warn!("Ignoring target completion on a run that is not running");
            return;
        }
        if self.progress.completed_repositories < self.progress.total_repositories {
            self.progress.completed_repositories += 1;
        }
        if self.progress.completed_repositories >= self.progress.total_repositories {
            self.finish();
        } else {
            self.update_estimate();
        }
    }

    fn finish(&mut self) {
        self.progress.running = false;
        self.progress.current_repository = None;
        self.progress.estimated_end_time = None;
        self.progress.state = if self.progress.failed_repositories > 0 {
            RunState::CompletedWithErrors
        } else {
            RunState::Completed
        };
        log::info!(
            "Sync finished: {}/{} repositories, {} failed",
            self.progress.completed_repositories,
            self.progress.total_repositories,
            self.progress.failed_repositories
        );
    }

    fn update_estimate(&mut self) {
        let completed = self.progress.completed_repositories;
        let (Some(start), true) = (self.progress.start_time, completed > 0) else {
            return;
        };
        let now = self.clock.now();
        let per_target = (now - start) / completed as i32;
        let remaining = self.progress.total_repositories.saturating_sub(completed);
        self.progress.estimated_end_time = Some(now + per_target * remaining as i32);
    }
}
