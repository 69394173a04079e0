//! Units of background work and what they resolve to.

pub mod handlers;
pub mod pool;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::adapter::{Issue, IssueFilter};
use crate::cache::MetricCache;
use crate::collector::CollectorFactory;
use crate::date_util::DateRange;
use crate::error::{Error, Result};
use crate::metrics::{RepositoryMetrics, TeamMetrics, UserMetrics};
use crate::storage::Database;
use crate::sync::SyncReport;

pub use pool::{JobTicket, WorkerPool};

/// Everything a worker needs. Cloned into each job.
#[derive(Clone)]
pub struct JobContext {
    pub db: Database,
    pub cache: MetricCache,
    /// How to reach the issue tracker; jobs that need it fail without one.
    pub collectors: Option<CollectorFactory>,
}

impl JobContext {
    pub fn new(db: Database, cache: MetricCache) -> Self {
        Self {
            db,
            cache,
            collectors: None,
        }
    }

    pub fn with_collectors(mut self, factory: CollectorFactory) -> Self {
        self.collectors = Some(factory);
        self
    }
}

/// Kinds of work the pool understands. On the wire a kind travels as a
/// kebab-case tag plus a JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum JobKind {
    SyncRepository {
        repo_id: String,
        force_full: bool,
        sync_issues: bool,
    },
    ComputeRepositoryMetrics {
        repo_id: String,
        range: DateRange,
    },
    ComputeUserMetrics {
        user_id: String,
        range: DateRange,
    },
    ComputeTeamMetrics {
        team_id: String,
        team_name: Option<String>,
        repo_ids: Vec<String>,
        range: DateRange,
    },
    CollectIssues {
        query: IssueFilter,
        /// Zero means no limit.
        page_size: usize,
        page_offset: usize,
    },
    /// A kind this build does not know. Handled by echoing the payload.
    #[serde(skip)]
    Unrecognized {
        kind: String,
        payload: serde_json::Value,
    },
}

const KNOWN_KINDS: &[&str] = &[
    "sync-repository",
    "compute-repository-metrics",
    "compute-user-metrics",
    "compute-team-metrics",
    "collect-issues",
];

impl JobKind {
    /// Decode a tagged payload. Unknown tags become [`JobKind::Unrecognized`];
    /// a known tag with a malformed payload is an error.
    pub fn from_parts(kind: &str, payload: serde_json::Value) -> Result<Self> {
        if !KNOWN_KINDS.contains(&kind) {
            return Ok(JobKind::Unrecognized {
                kind: kind.to_string(),
                payload,
            });
        }
        let tagged = serde_json::json!({ "kind": kind, "payload": payload });
        Ok(serde_json::from_value(tagged)?)
    }

    pub fn name(&self) -> &str {
        match self {
            JobKind::SyncRepository { .. } => "sync-repository",
            JobKind::ComputeRepositoryMetrics { .. } => "compute-repository-metrics",
            JobKind::ComputeUserMetrics { .. } => "compute-user-metrics",
            JobKind::ComputeTeamMetrics { .. } => "compute-team-metrics",
            JobKind::CollectIssues { .. } => "collect-issues",
            JobKind::Unrecognized { kind, .. } => kind,
        }
    }
}

/// A job with its correlation id.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
}

impl Job {
    pub fn new(kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobResult {
    Sync(SyncReport),
    RepositoryMetrics(RepositoryMetrics),
    UserMetrics(UserMetrics),
    TeamMetrics(TeamMetrics),
    Issues(Vec<Issue>),
    /// Payload handed back by the fallback handler.
    Echo(serde_json::Value),
}

/// Why a job produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error("worker panicked: {0}")]
    Panicked(String),

    #[error("timed out after {secs}s")]
    TimedOut { secs: u64 },

    #[error("worker went away before reporting")]
    Lost,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub result: std::result::Result<JobResult, JobError>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Fold the outcome into the crate error type.
    pub fn into_result(self) -> Result<JobResult> {
        let job_id = self.job_id.to_string();
        self.result.map_err(|e| match e {
            JobError::TimedOut { secs } => Error::Timeout { job_id, secs },
            other => Error::Job {
                job_id,
                message: other.to_string(),
            },
        })
    }
}
