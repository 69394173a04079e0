use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::{Issue, IssueAdapter, IssueFilter, Project};
use crate::config::AdapterConfig;
use crate::date_util::parse_timestamp;
use crate::error::{Error, Result};

const SEARCH_PAGE_SIZE: u32 = 100;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ISSUE_FIELDS: &str = "summary,issuetype,status,created,resolutiondate,assignee,reporter";

/// Adapter for the Jira REST API (v2), authenticated with basic auth
/// (username + API token).
#[derive(Default)]
pub struct JiraAdapter {
    state: Option<JiraState>,
}

struct JiraState {
    http: reqwest::Client,
    base: url::Url,
    config: AdapterConfig,
}

impl JiraAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<&JiraState> {
        self.state.as_ref().ok_or(Error::NotInitialized("jira adapter"))
    }
}

impl JiraState {
    fn endpoint(&self, path: &str) -> Result<url::Url> {
        self.base
            .join(path)
            .map_err(|e| Error::Config(format!("cannot build URL for {path}: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = self.endpoint(path)?;
        log::debug!("GET {url}");
        let response = self
            .http
            .get(url)
            .basic_auth(&self.config.username, Some(&self.config.api_token))
            .query(query)
            .send()
            .await
            .map_err(|e| Error::Connectivity(format!("{path}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Connectivity(format!(
                "{path} returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(response.json::<T>().await?)
    }

    async fn search(&self, jql: &str) -> Result<Vec<Issue>> {
        let mut issues = Vec::new();
        let mut start_at: u32 = 0;
        loop {
            let page: SearchResponse = self
                .get_json(
                    "rest/api/2/search",
                    &[
                        ("jql", jql.to_string()),
                        ("startAt", start_at.to_string()),
                        ("maxResults", SEARCH_PAGE_SIZE.to_string()),
                        ("fields", ISSUE_FIELDS.to_string()),
                    ],
                )
                .await?;
            let fetched = page.issues.len() as u32;
            for raw in page.issues {
                match raw.into_issue() {
                    Some(issue) => issues.push(issue),
                    None => log::warn!("Skipping issue with unparseable timestamps"),
                }
            }
            start_at += fetched;
            if fetched == 0 || start_at >= page.total {
                break;
            }
        }
        log::debug!("JQL '{jql}' returned {} issues", issues.len());
        Ok(issues)
    }
}

// ── Wire types ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: u32,
    #[serde(default)]
    issues: Vec<RawIssue>,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    id: String,
    key: String,
    fields: RawFields,
}

#[derive(Debug, Deserialize)]
struct RawFields {
    #[serde(default)]
    summary: String,
    issuetype: Option<Named>,
    status: Option<Named>,
    created: String,
    resolutiondate: Option<String>,
    assignee: Option<RawUser>,
    reporter: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct Named {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawUser {
    display_name: Option<String>,
    email_address: Option<String>,
}

impl RawUser {
    fn label(self) -> Option<String> {
        self.display_name.or(self.email_address)
    }
}

#[derive(Debug, Deserialize)]
struct RawProject {
    id: String,
    key: String,
    name: String,
    description: Option<String>,
}

impl RawIssue {
    fn into_issue(self) -> Option<Issue> {
        let created = parse_timestamp(&self.fields.created)?;
        let resolution_date = match self.fields.resolutiondate {
            Some(ref raw) => Some(parse_timestamp(raw)?),
            None => None,
        };
        Some(Issue {
            id: self.id,
            key: self.key,
            summary: self.fields.summary,
            issue_type: self.fields.issuetype.map(|t| t.name).unwrap_or_default(),
            status: self.fields.status.map(|s| s.name).unwrap_or_default(),
            created,
            resolution_date,
            assignee: self.fields.assignee.and_then(RawUser::label),
            reporter: self.fields.reporter.and_then(RawUser::label),
        })
    }
}

// ── JQL ────────────────────────────────────────────────────────────

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn day(d: NaiveDate) -> String {
    quote(&d.format("%Y-%m-%d").to_string())
}

/// Inclusive end bound: Jira compares against midnight, so use `< end + 1`.
fn day_after(d: NaiveDate) -> String {
    day(d.succ_opt().unwrap_or(d))
}

fn scope_clauses(filter: &IssueFilter, configured_keys: &[String]) -> Vec<String> {
    let mut clauses = Vec::new();
    if let Some(ref key) = filter.project_key {
        clauses.push(format!("project = {}", quote(key)));
    } else if !configured_keys.is_empty() {
        let keys: Vec<String> = configured_keys.iter().map(|k| quote(k)).collect();
        clauses.push(format!("project in ({})", keys.join(", ")));
    }
    if let Some(ref assignee) = filter.assignee {
        clauses.push(format!("assignee = {}", quote(assignee)));
    }
    if let Some(ref issue_type) = filter.issue_type {
        clauses.push(format!("issuetype = {}", quote(issue_type)));
    }
    clauses
}

pub(crate) fn completed_issues_jql(filter: &IssueFilter, configured_keys: &[String]) -> String {
    let mut clauses = scope_clauses(filter, configured_keys);
    clauses.push("statusCategory = Done".to_string());
    clauses.push("resolutiondate is not EMPTY".to_string());
    if let Some(start) = filter.start_date {
        clauses.push(format!("resolutiondate >= {}", day(start)));
    }
    if let Some(end) = filter.end_date {
        clauses.push(format!("resolutiondate < {}", day_after(end)));
    }
    format!("{} ORDER BY resolutiondate ASC", clauses.join(" AND "))
}

pub(crate) fn created_issues_jql(filter: &IssueFilter, configured_keys: &[String]) -> String {
    let mut clauses = scope_clauses(filter, configured_keys);
    if let Some(ref status) = filter.status {
        clauses.push(format!("status = {}", quote(status)));
    }
    if let Some(start) = filter.start_date {
        clauses.push(format!("created >= {}", day(start)));
    }
    if let Some(end) = filter.end_date {
        clauses.push(format!("created < {}", day_after(end)));
    }
    if clauses.is_empty() {
        "ORDER BY created ASC".to_string()
    } else {
        format!("{} ORDER BY created ASC", clauses.join(" AND "))
    }
}

fn normalize_base(raw: &str) -> Result<url::Url> {
    let mut base = url::Url::parse(raw).map_err(|e| Error::Config(format!("malformed baseUrl: {e}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

#[async_trait]
impl IssueAdapter for JiraAdapter {
    fn name(&self) -> &'static str {
        "jira"
    }

    async fn initialize(&mut self, config: AdapterConfig) -> Result<()> {
        config.validate()?;
        let base = normalize_base(&config.base_url)?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("doradw/", env!("CARGO_PKG_VERSION")))
            .build()?;
        log::info!("Jira adapter targeting {base} as {}", config.username);
        self.state = Some(JiraState { http, base, config });
        Ok(())
    }

    async fn test_connection(&self) -> bool {
        let Ok(state) = self.state() else {
            return false;
        };
        match state.get_json::<serde_json::Value>("rest/api/2/myself", &[]).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Jira connection test failed: {e}");
                false
            }
        }
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let state = self.state()?;
        let raw: Vec<RawProject> = state.get_json("rest/api/2/project", &[]).await?;
        let keys = &state.config.project_keys;
        Ok(raw
            .into_iter()
            .filter(|p| keys.is_empty() || keys.iter().any(|k| k.eq_ignore_ascii_case(&p.key)))
            .map(|p| Project {
                id: p.id,
                key: p.key,
                name: p.name,
                description: p.description.filter(|d| !d.is_empty()),
            })
            .collect())
    }

    async fn find_completed_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let state = self.state()?;
        let jql = completed_issues_jql(filter, &state.config.project_keys);
        let issues = state.search(&jql).await?;
        Ok(issues
            .into_iter()
            .filter(|i| i.resolution_date.is_some())
            .collect())
    }

    async fn find_created_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        let state = self.state()?;
        let jql = created_issues_jql(filter, &state.config.project_keys);
        state.search(&jql).await
    }
}
