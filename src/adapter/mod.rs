//! Uniform access to external issue trackers.
//!
//! [`IssueAdapter`] is the capability surface the collector and the job
//! handlers depend on. Two implementations ship with the crate: the
//! network-backed [`jira::JiraAdapter`] and the deterministic
//! [`mock::MockAdapter`] used for tests and offline work. Both share the
//! filter and statistics code in this module so they stay substitutable.

pub mod jira;
pub mod mock;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AdapterConfig;
use crate::date_util::days_between;
use crate::error::Result;

/// Label used for issues without an assignee in the per-assignee breakdown.
pub const UNASSIGNED: &str = "Unassigned";

/// Statuses treated as terminal when no resolution category is available.
const TERMINAL_STATUSES: &[&str] = &["done", "closed", "resolved"];

/// One ticket as returned by an adapter. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub key: String,
    pub summary: String,
    pub issue_type: String,
    pub status: String,
    pub created: DateTime<Utc>,
    pub resolution_date: Option<DateTime<Utc>>,
    pub assignee: Option<String>,
    pub reporter: Option<String>,
}

impl Issue {
    /// The project prefix of the key (`CORE` for `CORE-123`).
    pub fn project_key(&self) -> &str {
        self.key
            .rsplit_once('-')
            .map(|(prefix, _)| prefix)
            .unwrap_or(&self.key)
    }

    pub fn has_terminal_status(&self) -> bool {
        is_terminal_status(&self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.has_terminal_status() || self.resolution_date.is_some()
    }

    /// Days from creation to resolution, if resolved.
    pub fn resolution_days(&self) -> Option<f64> {
        self.resolution_date
            .map(|resolved| days_between(self.created, resolved))
    }
}

pub fn is_terminal_status(status: &str) -> bool {
    let status = status.to_lowercase();
    TERMINAL_STATUSES.contains(&status.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub key: String,
    pub name: String,
    pub description: Option<String>,
}

impl Project {
    pub fn owns(&self, issue: &Issue) -> bool {
        issue.project_key() == self.key
    }
}

/// Optional constraints for issue queries. Date bounds are inclusive and
/// compared by calendar day; which timestamp they apply to depends on the
/// query (creation for created-issue queries, resolution for completed ones).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub project_key: Option<String>,
    pub assignee: Option<String>,
    pub issue_type: Option<String>,
    pub status: Option<String>,
}

impl IssueFilter {
    pub fn for_project(project_key: &str) -> Self {
        Self {
            project_key: Some(project_key.to_string()),
            ..Self::default()
        }
    }

    pub fn between(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    fn in_bounds(&self, ts: DateTime<Utc>) -> bool {
        let day = ts.date_naive();
        self.start_date.is_none_or(|start| day >= start)
            && self.end_date.is_none_or(|end| day <= end)
    }

    fn matches_common(&self, issue: &Issue) -> bool {
        if let Some(ref key) = self.project_key {
            if !issue.project_key().eq_ignore_ascii_case(key) {
                return false;
            }
        }
        if let Some(ref assignee) = self.assignee {
            if issue.assignee.as_deref() != Some(assignee.as_str()) {
                return false;
            }
        }
        if let Some(ref issue_type) = self.issue_type {
            if !issue.issue_type.eq_ignore_ascii_case(issue_type) {
                return false;
            }
        }
        true
    }

    /// Created-issue semantics: creation date bounds plus every other field.
    pub fn matches_created(&self, issue: &Issue) -> bool {
        if !self.matches_common(issue) || !self.in_bounds(issue.created) {
            return false;
        }
        match self.status {
            Some(ref status) => issue.status.eq_ignore_ascii_case(status),
            None => true,
        }
    }

    /// Completed-issue semantics: terminal status, a resolution date inside
    /// the bounds, plus project/assignee/type. The status field is ignored.
    pub fn matches_completed(&self, issue: &Issue) -> bool {
        let Some(resolved) = issue.resolution_date else {
            return false;
        };
        issue.has_terminal_status() && self.matches_common(issue) && self.in_bounds(resolved)
    }
}

/// Aggregate counts and timings over a set of issues.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IssueStats {
    pub total_issues: u64,
    pub completed_issues: u64,
    pub average_resolution_time_in_days: f64,
    pub issues_by_type: BTreeMap<String, u64>,
    pub issues_by_status: BTreeMap<String, u64>,
    pub issues_by_assignee: BTreeMap<String, u64>,
}

/// Compute statistics over `issues`. The mean resolution time only counts
/// issues with a resolution date and is `0.0` when there are none.
pub fn compute_issue_stats(issues: &[Issue]) -> IssueStats {
    let mut stats = IssueStats {
        total_issues: issues.len() as u64,
        ..IssueStats::default()
    };

    let mut resolution_sum = 0.0;
    let mut resolved = 0u64;
    for issue in issues {
        if issue.is_completed() {
            stats.completed_issues += 1;
        }
        if let Some(days) = issue.resolution_days() {
            resolution_sum += days;
            resolved += 1;
        }
        *stats.issues_by_type.entry(issue.issue_type.clone()).or_default() += 1;
        *stats.issues_by_status.entry(issue.status.clone()).or_default() += 1;
        let assignee = issue.assignee.as_deref().unwrap_or(UNASSIGNED);
        *stats.issues_by_assignee.entry(assignee.to_string()).or_default() += 1;
    }

    if resolved > 0 {
        stats.average_resolution_time_in_days = resolution_sum / resolved as f64;
    }
    stats
}

/// Capability set every issue-tracker backend provides.
///
/// Every method except [`initialize`](IssueAdapter::initialize) and
/// [`name`](IssueAdapter::name) fails with `Error::NotInitialized` until
/// `initialize` has succeeded.
#[async_trait]
pub trait IssueAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn initialize(&mut self, config: AdapterConfig) -> Result<()>;

    /// Lightweight reachability/auth check. Never errors.
    async fn test_connection(&self) -> bool;

    /// Projects whose key is configured (all projects when none are).
    async fn list_projects(&self) -> Result<Vec<Project>>;

    async fn find_completed_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>>;

    async fn find_created_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>>;

    fn compute_stats(&self, issues: &[Issue]) -> IssueStats {
        compute_issue_stats(issues)
    }
}

/// Which adapter a collector should be built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
    Jira,
    Mock,
}

impl AdapterKind {
    pub fn build(self) -> Box<dyn IssueAdapter> {
        match self {
            AdapterKind::Jira => Box::new(jira::JiraAdapter::new()),
            AdapterKind::Mock => Box::new(mock::MockAdapter::new()),
        }
    }
}

impl std::str::FromStr for AdapterKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "jira" => Ok(AdapterKind::Jira),
            "mock" => Ok(AdapterKind::Mock),
            other => Err(crate::error::Error::Config(format!(
                "unknown adapter '{other}' (expected jira or mock)"
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::date_util::parse_timestamp;

    pub(crate) fn issue(key: &str, status: &str, created: &str, resolved: Option<&str>) -> Issue {
        Issue {
            id: key.to_lowercase(),
            key: key.to_string(),
            summary: format!("{key} summary"),
            issue_type: "Task".to_string(),
            status: status.to_string(),
            created: parse_timestamp(created).unwrap(),
            resolution_date: resolved.map(|r| parse_timestamp(r).unwrap()),
            assignee: None,
            reporter: None,
        }
    }

    #[test]
    fn test_project_key() {
        let i = issue("CORE-12", "Done", "2024-01-01", None);
        assert_eq!(i.project_key(), "CORE");
        let i = issue("MY-APP-7", "Done", "2024-01-01", None);
        assert_eq!(i.project_key(), "MY-APP");
    }

    #[test]
    fn test_stats_single_resolved_issue() {
        let stats = compute_issue_stats(&[issue(
            "A-1",
            "Done",
            "2024-01-01",
            Some("2024-01-04"),
        )]);
        assert_eq!(stats.total_issues, 1);
        assert_eq!(stats.completed_issues, 1);
        assert_eq!(stats.average_resolution_time_in_days, 3.0);
    }

    #[test]
    fn test_stats_without_resolved_issues_is_zero() {
        let issues = vec![
            issue("A-1", "To Do", "2024-01-01", None),
            issue("A-2", "In Progress", "2024-01-02", None),
        ];
        let stats = compute_issue_stats(&issues);
        assert_eq!(stats.completed_issues, 0);
        assert_eq!(stats.average_resolution_time_in_days, 0.0);
        assert!(!stats.average_resolution_time_in_days.is_nan());
    }

    #[test]
    fn test_stats_empty() {
        let stats = compute_issue_stats(&[]);
        assert_eq!(stats, IssueStats::default());
    }

    #[test]
    fn test_stats_completed_never_exceeds_total() {
        let mut issues = Vec::new();
        for i in 0..25 {
            let status = ["Done", "Closed", "To Do", "Resolved", "Open"][i % 5];
            let resolved = if i % 2 == 0 { Some("2024-02-01") } else { None };
            issues.push(issue(&format!("A-{i}"), status, "2024-01-01", resolved));
            let stats = compute_issue_stats(&issues);
            assert!(stats.completed_issues <= stats.total_issues);
        }
    }

    #[test]
    fn test_stats_breakdowns() {
        let mut a = issue("A-1", "Done", "2024-01-01", Some("2024-01-03"));
        a.assignee = Some("alice".into());
        a.issue_type = "Bug".into();
        let b = issue("A-2", "To Do", "2024-01-01", None);
        let stats = compute_issue_stats(&[a, b]);
        assert_eq!(stats.issues_by_assignee.get("alice"), Some(&1));
        assert_eq!(stats.issues_by_assignee.get(UNASSIGNED), Some(&1));
        assert_eq!(stats.issues_by_type.get("Bug"), Some(&1));
        assert_eq!(stats.issues_by_type.get("Task"), Some(&1));
        assert_eq!(stats.issues_by_status.get("Done"), Some(&1));
    }

    #[test]
    fn test_filter_completed_requires_resolution_and_terminal_status() {
        let filter = IssueFilter::default();
        assert!(filter.matches_completed(&issue("A-1", "Done", "2024-01-01", Some("2024-01-02"))));
        assert!(!filter.matches_completed(&issue("A-2", "Done", "2024-01-01", None)));
        assert!(!filter.matches_completed(&issue("A-3", "Open", "2024-01-01", Some("2024-01-02"))));
    }

    #[test]
    fn test_filter_date_bounds_are_inclusive() {
        let filter = IssueFilter::default().between(
            NaiveDate::from_ymd_opt(2024, 1, 2),
            NaiveDate::from_ymd_opt(2024, 1, 3),
        );
        assert!(!filter.matches_created(&issue("A-1", "Open", "2024-01-01T23:59:00Z", None)));
        assert!(filter.matches_created(&issue("A-2", "Open", "2024-01-02T00:00:00Z", None)));
        assert!(filter.matches_created(&issue("A-3", "Open", "2024-01-03T23:00:00Z", None)));
        assert!(!filter.matches_created(&issue("A-4", "Open", "2024-01-04", None)));
    }

    #[test]
    fn test_filter_project_and_status() {
        let filter = IssueFilter {
            status: Some("done".into()),
            ..IssueFilter::for_project("A")
        };
        assert!(filter.matches_created(&issue("A-1", "Done", "2024-01-01", None)));
        assert!(!filter.matches_created(&issue("B-1", "Done", "2024-01-01", None)));
        assert!(!filter.matches_created(&issue("A-2", "Open", "2024-01-01", None)));
    }

    #[test]
    fn test_adapter_kind_from_str() {
        assert_eq!("MOCK".parse::<AdapterKind>().unwrap(), AdapterKind::Mock);
        assert!("github".parse::<AdapterKind>().is_err());
    }
}
