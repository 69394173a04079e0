use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::Serialize;

use crate::adapter::{AdapterKind, Issue, IssueAdapter, IssueFilter, IssueStats, Project};
use crate::config::AdapterConfig;
use crate::error::{Error, Result};

/// Where the collector looks for adapter settings when no file is given.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Env,
    Inline(AdapterConfig),
}

/// Per-project line of a [`ProjectSummary`].
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatsEntry {
    pub key: String,
    pub name: String,
    pub stats: IssueStats,
}

/// Totals across every visible project for a date window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProjectSummary {
    pub total_projects: u64,
    pub total_issues: u64,
    pub completed_issues: u64,
    /// Unweighted mean of the per-project means, over projects that have at
    /// least one completed issue.
    pub average_resolution_time_in_days: f64,
    pub issues_by_type: BTreeMap<String, u64>,
    pub issues_by_status: BTreeMap<String, u64>,
    pub projects: Vec<ProjectStatsEntry>,
}

/// Recipe for building ready-to-use collectors, one per job.
#[derive(Debug, Clone)]
pub struct CollectorFactory {
    pub kind: AdapterKind,
    pub source: ConfigSource,
    pub config_path: Option<PathBuf>,
}

impl CollectorFactory {
    pub fn new(kind: AdapterKind, source: ConfigSource) -> Self {
        Self {
            kind,
            source,
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Build a fresh adapter and initialize it.
    pub async fn connect(&self) -> Result<DataCollector> {
        let mut collector = DataCollector::with_config_source(self.kind.build(), self.source.clone());
        collector.initialize(self.config_path.as_deref()).await?;
        Ok(collector)
    }
}

/// Owns one adapter and turns its raw results into issue statistics.
pub struct DataCollector {
    adapter: Box<dyn IssueAdapter>,
    source: ConfigSource,
    initialized: bool,
}

impl DataCollector {
    pub fn new(adapter: Box<dyn IssueAdapter>) -> Self {
        Self::with_config_source(adapter, ConfigSource::Env)
    }

    pub fn with_config_source(adapter: Box<dyn IssueAdapter>, source: ConfigSource) -> Self {
        Self {
            adapter,
            source,
            initialized: false,
        }
    }

    pub fn adapter_name(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Resolve config (a file path wins over the configured source),
    /// initialize the adapter and check connectivity.
    pub async fn initialize(&mut self, config_path: Option<&Path>) -> Result<()> {
        let config = match config_path {
            Some(path) => AdapterConfig::load_from_file(path)?,
            None => match &self.source {
                ConfigSource::Env => AdapterConfig::load_from_env()?,
                ConfigSource::Inline(config) => config.clone(),
            },
        };

        self.adapter.initialize(config).await?;
        if !self.adapter.test_connection().await {
            return Err(Error::Connectivity(format!(
                "{} adapter failed its connection test",
                self.adapter.name()
            )));
        }
        self.initialized = true;
        log::info!("Data collector ready ({} adapter)", self.adapter.name());
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<&dyn IssueAdapter> {
        if self.initialized {
            Ok(self.adapter.as_ref())
        } else {
            Err(Error::NotInitialized("data collector"))
        }
    }

    pub async fn get_projects(&self) -> Result<Vec<Project>> {
        self.ensure_initialized()?.list_projects().await
    }

    pub async fn get_completed_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        self.ensure_initialized()?.find_completed_issues(filter).await
    }

    pub async fn get_created_issues(&self, filter: &IssueFilter) -> Result<Vec<Issue>> {
        self.ensure_initialized()?.find_created_issues(filter).await
    }

    pub fn compute_stats(&self, issues: &[Issue]) -> Result<IssueStats> {
        Ok(self.ensure_initialized()?.compute_stats(issues))
    }

    pub async fn get_issue_stats(&self, filter: &IssueFilter) -> Result<IssueStats> {
        let issues = self.get_created_issues(filter).await?;
        if issues.is_empty() {
            log::warn!("No issues found for filter {filter:?}; returning empty statistics");
            return Ok(IssueStats::default());
        }
        self.compute_stats(&issues)
    }

    pub async fn get_project_summary(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<ProjectSummary> {
        let projects = self.get_projects().await?;
        let mut summary = ProjectSummary {
            total_projects: projects.len() as u64,
            ..ProjectSummary::default()
        };

        let mut mean_sum = 0.0;
        let mut projects_with_completed = 0u64;
        for project in projects {
            let filter = IssueFilter::for_project(&project.key).between(start, end);
            let stats = self.get_issue_stats(&filter).await?;

            summary.total_issues += stats.total_issues;
            summary.completed_issues += stats.completed_issues;
            for (issue_type, count) in &stats.issues_by_type {
                *summary.issues_by_type.entry(issue_type.clone()).or_default() += count;
            }
            for (status, count) in &stats.issues_by_status {
                *summary.issues_by_status.entry(status.clone()).or_default() += count;
            }
            if stats.completed_issues > 0 {
                mean_sum += stats.average_resolution_time_in_days;
                projects_with_completed += 1;
            }

            summary.projects.push(ProjectStatsEntry {
                key: project.key,
                name: project.name,
                stats,
            });
        }

        if projects_with_completed > 0 {
            summary.average_resolution_time_in_days = mean_sum / projects_with_completed as f64;
        }
        Ok(summary)
    }
}
