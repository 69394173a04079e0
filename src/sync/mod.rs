pub mod git;
pub mod syncer;

use serde::{Deserialize, Serialize};

/// Options controlling a repository sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Re-read the whole history instead of starting at the last synced commit.
    pub force_full: bool,
    /// Also pull issues from the configured tracker.
    pub sync_issues: bool,
    /// How far back to collect issues; everything when unset.
    pub issue_days: Option<u32>,
}

/// Report returned after a repository sync completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub repo_id: String,
    pub status: SyncStatus,
    pub commits_synced: u64,
    pub issues_synced: u64,
    pub full_sync: bool,
    pub error: Option<String>,
}

impl SyncReport {
    /// Build a report whose status follows from what went wrong, if anything.
    pub fn from_counts(
        repo_id: String,
        commits_synced: u64,
        issues_synced: u64,
        full_sync: bool,
        error: Option<String>,
    ) -> Self {
        let status = match (&error, commits_synced + issues_synced) {
            (None, _) => SyncStatus::Success,
            (Some(_), 0) => SyncStatus::Failed,
            (Some(_), _) => SyncStatus::PartialFailure,
        };
        Self {
            repo_id,
            status,
            commits_synced,
            issues_synced,
            full_sync,
            error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Success,
    PartialFailure,
    Failed,
}

impl SyncStatus {
    /// The value stored in `sync_history.status`.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "completed",
            SyncStatus::PartialFailure => "partial_failure",
            SyncStatus::Failed => "failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        let ok = SyncReport::from_counts("r".into(), 5, 0, false, None);
        assert_eq!(ok.status, SyncStatus::Success);

        let partial = SyncReport::from_counts("r".into(), 5, 0, false, Some("issues".into()));
        assert_eq!(partial.status, SyncStatus::PartialFailure);

        let failed = SyncReport::from_counts("r".into(), 0, 0, true, Some("issues".into()));
        assert_eq!(failed.status, SyncStatus::Failed);
        assert_eq!(failed.status.as_str(), "failed");
    }

    #[test]
    fn test_empty_sync_is_success() {
        let report = SyncReport::from_counts("r".into(), 0, 0, false, None);
        assert_eq!(report.status, SyncStatus::Success);
    }
}
