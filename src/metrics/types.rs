use serde::{Deserialize, Serialize};

use crate::date_util::DateRange;

/// Commit activity: volume, authors, churn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityMetrics {
    pub commit_count: u64,
    pub active_authors: u64,
    pub additions: u64,
    pub deletions: u64,
    /// Distinct days with at least one commit.
    pub active_days: u64,
}

/// DORA-style delivery metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    /// Merge commits in the range, each treated as one deployment.
    pub deployment_count: u64,
    pub deployments_per_day: f64,
    /// Commits that revert, hotfix or roll back earlier work.
    pub change_failure_count: u64,
    /// Percentage of commits that are failure fixes.
    pub change_failure_rate: f64,
    /// Mean days from creation to resolution of referenced issues.
    pub lead_time_days: Option<f64>,
    pub lead_time_samples: u64,
    /// Mean days to resolve bugs in linked projects.
    pub mttr_days: Option<f64>,
    pub incidents_resolved: u64,
}

/// Aggregated metrics for a repository over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryMetrics {
    pub repo_id: String,
    pub repo_name: Option<String>,
    pub range: DateRange,
    pub activity: ActivityMetrics,
    pub delivery: DeliveryMetrics,
}

/// Aggregated metrics for one author over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMetrics {
    pub user_email: String,
    pub user_name: Option<String>,
    pub range: DateRange,
    pub activity: ActivityMetrics,
    pub repositories_touched: u64,
    pub issues_resolved: u64,
    pub avg_resolution_days: Option<f64>,
}

/// The repositories (and, when stored, the members) a team is measured over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamScope {
    pub team_id: String,
    pub team_name: Option<String>,
    pub repo_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryBreakdown {
    pub repo_id: String,
    pub activity: ActivityMetrics,
}

/// Aggregated metrics for a team over a date range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TeamMetrics {
    pub team_id: String,
    pub team_name: Option<String>,
    pub range: DateRange,
    /// Zero when the team has no stored members; commits from every author count then.
    pub member_count: u64,
    pub activity: ActivityMetrics,
    pub delivery: DeliveryMetrics,
    pub repositories: Vec<RepositoryBreakdown>,
}
