use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};

use super::{Issue, IssueAdapter, IssueFilter, Project};
use crate::config::AdapterConfig;
use crate::error::{Error, Result};

/// Project key used when the config names none.
pub const DEFAULT_MOCK_KEY: &str = "MOCK";
/// Number of issues generated per configured project.
pub const ISSUES_PER_PROJECT: u32 = 10;

const ASSIGNEES: &[&str] = &["alice", "bob", "carol"];
const ISSUE_TYPES: &[&str] = &["Story", "Bug", "Task"];

/// Synthetic adapter whose fixtures are derived from the configured project
/// keys alone, so results are identical across runs and machines.
#[derive(Debug)]
pub struct MockAdapter {
    state: Option<MockState>,
    reachable: bool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct MockState {
    projects: Vec<Project>,
    issues: Vec<Issue>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            state: None,
            reachable: true,
        }
    }

    /// A mock whose connection test always fails.
    pub fn unreachable() -> Self {
        Self {
            state: None,
            reachable: false,
        }
    }

    fn state(&self) -> Result<&MockState> {
        self.state.as_ref().ok_or(Error::NotInitialized("mock adapter"))
    }
}

/// A config that satisfies validation without pointing anywhere real.
pub fn mock_config(project_keys: &[&str]) -> AdapterConfig {
    AdapterConfig {
        base_url: "http://localhost".into(),
        username: "mock".into(),
        api_token: "mock".into(),
        project_keys: project_keys.iter().map(|k| k.to_string()).collect(),
    }
}

fn anchor() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
}

fn fixture_issues(project_index: usize, key: &str) -> Vec<Issue> {
    (1..=ISSUES_PER_PROJECT)
        .map(|i| {
            let created = anchor() + Duration::days(i as i64 - 1);
            let status = if i % 2 == 0 {
                "Done"
            } else if i % 3 == 0 {
                "In Progress"
            } else {
                "To Do"
            };
            let resolution_date = (status == "Done").then(|| created + Duration::days(i as i64));
            let assignee = (i % 4 != 0).then(|| ASSIGNEES[i as usize % ASSIGNEES.len()].to_string());
            Issue {
                id: format!("{}{:03}", project_index + 1, i),
                key: format!("{key}-{i}"),
                summary: format!("Synthetic issue {i} for {key}"),
                issue_type: ISSUE_TYPES[i as usize % ISSUE_TYPES.len()].to_string(),
                status: status.to_string(),
                created,
                resolution_date,
                assignee,
                reporter: Some("reporter".to_string()),
            }
        })
        .collect()
}

#[async_trait]
impl IssueAdapter for MockAdapter {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn initialize(&mut self, config: AdapterConfig) -> Result<()> {
        config.validate()?;
        let keys = if config.project_keys.is_empty() {
            vec![DEFAULT_MOCK_KEY.to_string()]
        } else {
            config.project_keys
        };

        let mut projects = Vec::with_capacity(keys.len());
        let mut issues = Vec::new();
        for (idx, key) in keys.iter().enumerate() {
            projects.push(Project {
                id: format!("{}", 10_000 + idx),
                key: key.clone(),
                name: format!("{key} Project"),
                description: Some(format!("Synthetic project {key}")),
            });
            issues.extend(fixture_issues(idx, key));
        }
        log::debug!(
            "Mock adapter initialized with {} projects, {} issues",
            projects.len(),
            issues.len()
        );
        self.state = Some(MockState { projects, issues });
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        self.state.is_some() && self.reachable
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        Ok(self.state()?.projects.clone())
    }

    async fn find_completed_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        Ok(self
            .state()?
            .issues
            .iter()
            .filter(|i| filter.matches_completed(i))
            .cloned()
            .collect())
    }

    async fn find_created_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        Ok(self
            .state()?
            .issues
            .iter()
            .filter(|i| filter.matches_created(i))
            .cloned()
            .collect())
    }
}
