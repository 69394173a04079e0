pub mod adapter;
pub mod cache;
pub mod collector;
pub mod config;
pub mod date_util;
pub mod dispatcher;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod progress;
pub mod storage;
pub mod sync;

use std::path::Path;

pub use adapter::{AdapterKind, Issue, IssueAdapter, IssueFilter, IssueStats, Project};
pub use cache::{CacheKey, MetricCache, MetricType};
pub use collector::{CollectorFactory, ConfigSource, DataCollector, ProjectSummary};
pub use config::{AdapterConfig, PipelineOptions};
pub use date_util::DateRange;
pub use dispatcher::{CancelHandle, Dispatcher, ProgressHandle, SyncAllOptions, SyncAllReport, SyncTarget};
pub use error::{Error, Result};
pub use jobs::{Job, JobContext, JobError, JobKind, JobOutcome, JobResult, WorkerPool};
pub use metrics::{RepositoryMetrics, TeamMetrics, TeamScope, UserMetrics};
pub use progress::{ProgressTracker, RunState, SyncProgress};
pub use storage::Database;
pub use sync::{SyncOptions, SyncReport, SyncStatus};

// Re-export repository types needed by the binary crate, but not the module itself
pub use storage::repository::{SyncHistoryRow, Team, TrackedRepository};

use storage::repository;

fn job_context(db: &Database, options: &PipelineOptions, collectors: Option<&CollectorFactory>) -> JobContext {
    let ctx = JobContext::new(db.clone(), MetricCache::new(db.clone(), options.cache_ttl));
    match collectors {
        Some(factory) => ctx.with_collectors(factory.clone()),
        None => ctx,
    }
}

/// Counts shown by `doradw status`.
#[derive(Debug, Clone)]
pub struct WarehouseStatus {
    pub repositories: u64,
    pub commits: u64,
    pub issues: u64,
    pub teams: u64,
    pub recent_syncs: Vec<SyncHistoryRow>,
}

/// Main entry point for the engineering-metrics warehouse.
///
/// Every job goes through one shared [`WorkerPool`], so `options.workers`
/// bounds concurrency across all commands issued on this value.
pub struct DoraDW {
    db: Database,
    options: PipelineOptions,
    collectors: Option<CollectorFactory>,
    pool: WorkerPool,
}

impl DoraDW {
    pub fn new(db: Database, options: PipelineOptions) -> Self {
        let pool = WorkerPool::new(job_context(&db, &options, None), &options);
        Self {
            db,
            options,
            collectors: None,
            pool,
        }
    }

    /// Enable issue collection through the given tracker.
    pub fn with_collectors(mut self, factory: CollectorFactory) -> Self {
        self.pool = WorkerPool::new(job_context(&self.db, &self.options, Some(&factory)), &self.options);
        self.collectors = Some(factory);
        self
    }

    /// Access the database (for direct queries in the CLI).
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn cache(&self) -> MetricCache {
        MetricCache::new(self.db.clone(), self.options.cache_ttl)
    }

    /// A handle on the shared pool. Clones share its worker permits.
    pub fn pool(&self) -> WorkerPool {
        self.pool.clone()
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.pool.clone())
    }

    /// A connected collector for ad-hoc issue queries.
    pub async fn collector(&self) -> Result<DataCollector> {
        self.collectors
            .as_ref()
            .ok_or_else(|| Error::Config("no issue tracker configured".into()))?
            .connect()
            .await
    }

    async fn run(&self, kind: JobKind) -> Result<JobResult> {
        self.pool.run(Job::new(kind)).await.into_result()
    }

    // ── Repository commands ────────────────────────────────────────

    /// Track a local clone. The id and name default to the directory name.
    pub async fn add_repository(
        &self,
        path: &Path,
        repo_id: Option<&str>,
        name: Option<&str>,
        default_branch: Option<&str>,
    ) -> Result<TrackedRepository> {
        let path = std::fs::canonicalize(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        if !path.is_dir() {
            return Err(Error::Config(format!("{} is not a directory", path.display())));
        }
        let dir_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| Error::Config(format!("cannot name {}", path.display())))?;
        let repo_id = repo_id.unwrap_or(&dir_name).to_string();
        let name = name.unwrap_or(&dir_name).to_string();
        let path = path.to_string_lossy().to_string();
        let default_branch = default_branch.map(str::to_string);

        self.db
            .writer()
            .call(move |conn| {
                repository::add_repository(conn, &repo_id, &name, &path, default_branch.as_deref())?;
                repository::get_repository(conn, &repo_id)
            })
            .await?
            .ok_or_else(|| Error::Other("repository vanished after insert".into()))
    }

    pub async fn remove_repository(&self, repo_id: &str) -> Result<bool> {
        let removed = self
            .db
            .writer()
            .call({
                let repo_id = repo_id.to_string();
                move |conn| repository::remove_repository(conn, &repo_id)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        if removed {
            self.cache().invalidate_target(MetricType::Repository, repo_id).await?;
        }
        Ok(removed)
    }

    pub async fn list_repositories(&self) -> Result<Vec<TrackedRepository>> {
        self.db
            .reader()
            .call(|conn| repository::list_repositories(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Team commands ──────────────────────────────────────────────

    /// Create or extend a team. Every repository must already be tracked.
    pub async fn add_team(
        &self,
        team_id: &str,
        name: &str,
        members: &[String],
        repo_ids: &[String],
    ) -> Result<Team> {
        let known: Vec<String> = self
            .list_repositories()
            .await?
            .into_iter()
            .map(|r| r.repo_id)
            .collect();
        if let Some(missing) = repo_ids.iter().find(|id| !known.contains(id)) {
            return Err(Error::NotFound(format!("repository {missing}")));
        }

        let team_id = team_id.to_string();
        let name = name.to_string();
        let members = members.to_vec();
        let repo_ids = repo_ids.to_vec();
        let team = self
            .db
            .writer()
            .call({
                let team_id = team_id.clone();
                move |conn| {
                    repository::upsert_team(conn, &team_id, &name)?;
                    for member in &members {
                        repository::add_team_member(conn, &team_id, member)?;
                    }
                    for repo_id in &repo_ids {
                        repository::add_team_repository(conn, &team_id, repo_id)?;
                    }
                    repository::get_team(conn, &team_id)
                }
            })
            .await?
            .ok_or_else(|| Error::NotFound(format!("team {team_id}")))?;
        self.cache().invalidate_target(MetricType::Team, &team.team_id).await?;
        Ok(team)
    }

    pub async fn list_teams(&self) -> Result<Vec<Team>> {
        self.db
            .reader()
            .call(|conn| repository::list_teams(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn get_team(&self, team_id: &str) -> Result<Team> {
        self.db
            .reader()
            .call({
                let team_id = team_id.to_string();
                move |conn| repository::get_team(conn, &team_id)
            })
            .await?
            .ok_or_else(|| Error::NotFound(format!("team {team_id}")))
    }

    // ── Sync commands ──────────────────────────────────────────────

    /// Every tracked repository, in the order it was added.
    pub async fn sync_targets(&self) -> Result<Vec<SyncTarget>> {
        Ok(self
            .list_repositories()
            .await?
            .iter()
            .map(|r| SyncTarget::new(&r.repo_id, &r.name))
            .collect())
    }

    pub async fn sync_repository(&self, repo_id: &str, options: SyncAllOptions) -> Result<SyncReport> {
        let result = self
            .run(JobKind::SyncRepository {
                repo_id: repo_id.to_string(),
                force_full: options.force_full,
                sync_issues: options.sync_issues,
            })
            .await?;
        match result {
            JobResult::Sync(report) => Ok(report),
            other => Err(unexpected(other)),
        }
    }

    pub async fn sync_all(&self, options: SyncAllOptions) -> Result<SyncAllReport> {
        let targets = self.sync_targets().await?;
        let mut dispatcher = self.dispatcher();
        Ok(dispatcher.sync_all(&targets, options).await)
    }

    pub async fn recent_syncs(&self, limit: u32) -> Result<Vec<SyncHistoryRow>> {
        self.db
            .reader()
            .call(move |conn| repository::recent_sync_history(conn, limit))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Metrics commands ───────────────────────────────────────────

    pub async fn repository_metrics(&self, repo_id: &str, range: DateRange) -> Result<RepositoryMetrics> {
        match self
            .run(JobKind::ComputeRepositoryMetrics {
                repo_id: repo_id.to_string(),
                range,
            })
            .await?
        {
            JobResult::RepositoryMetrics(m) => Ok(m),
            other => Err(unexpected(other)),
        }
    }

    pub async fn user_metrics(&self, user_email: &str, range: DateRange) -> Result<UserMetrics> {
        match self
            .run(JobKind::ComputeUserMetrics {
                user_id: user_email.to_string(),
                range,
            })
            .await?
        {
            JobResult::UserMetrics(m) => Ok(m),
            other => Err(unexpected(other)),
        }
    }

    pub async fn team_metrics(&self, team_id: &str, range: DateRange) -> Result<TeamMetrics> {
        let team = self.get_team(team_id).await?;
        match self
            .run(JobKind::ComputeTeamMetrics {
                team_id: team.team_id,
                team_name: Some(team.name),
                repo_ids: team.repo_ids,
                range,
            })
            .await?
        {
            JobResult::TeamMetrics(m) => Ok(m),
            other => Err(unexpected(other)),
        }
    }

    // ── Status ─────────────────────────────────────────────────────

    pub async fn status(&self) -> Result<WarehouseStatus> {
        let purged = self.cache().purge_expired().await?;
        log::debug!("Purged {purged} expired cache entries");

        self.db
            .reader()
            .call(|conn| {
                let conn: &rusqlite::Connection = conn;
                let count = |sql: &str| conn.query_row(sql, [], |row| row.get::<_, i64>(0)).map(|n| n as u64);
                Ok::<WarehouseStatus, rusqlite::Error>(WarehouseStatus {
                    repositories: count("SELECT COUNT(*) FROM repositories")?,
                    commits: count("SELECT COUNT(*) FROM commits")?,
                    issues: repository::count_issues(conn)?,
                    teams: count("SELECT COUNT(*) FROM teams")?,
                    recent_syncs: repository::recent_sync_history(conn, 10)?,
                })
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    // ── Config commands ────────────────────────────────────────────

    pub async fn config_get(&self, key: &str) -> Result<Option<String>> {
        self.db
            .reader()
            .call({
                let key = key.to_string();
                move |conn| repository::get_config(conn, &key)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_set(&self, key: &str, value: &str) -> Result<()> {
        self.db
            .writer()
            .call({
                let key = key.to_string();
                let value = value.to_string();
                move |conn| repository::set_config(conn, &key, &value)
            })
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    pub async fn config_list(&self) -> Result<Vec<(String, String)>> {
        self.db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }
}

fn unexpected(result: JobResult) -> Error {
    Error::Other(format!("unexpected job result: {result:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::mock_config;

    async fn warehouse() -> DoraDW {
        let db = Database::open_memory().await.unwrap();
        DoraDW::new(db, PipelineOptions::default())
    }

    #[tokio::test]
    async fn test_add_repository_defaults_to_dir_name() {
        let dw = warehouse().await;
        let dir = tempfile::tempdir().unwrap();
        let repo = dw.add_repository(dir.path(), None, None, None).await.unwrap();
        let dir_name = dir.path().file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(repo.repo_id, dir_name);
        assert_eq!(repo.name, dir_name);
        assert_eq!(dw.sync_targets().await.unwrap().len(), 1);

        assert!(dw.remove_repository(&dir_name).await.unwrap());
        assert!(dw.list_repositories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_repository_missing_path() {
        let dw = warehouse().await;
        let err = dw
            .add_repository(Path::new("/no/such/dir"), None, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_add_team_requires_known_repositories() {
        let dw = warehouse().await;
        let dir = tempfile::tempdir().unwrap();
        dw.add_repository(dir.path(), Some("api"), None, None).await.unwrap();

        let err = dw
            .add_team("platform", "Platform", &[], &["api".into(), "web".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let team = dw
            .add_team("platform", "Platform", &["Dev@Example.com".into()], &["api".into()])
            .await
            .unwrap();
        assert_eq!(team.members, vec!["dev@example.com"]);
        assert_eq!(dw.list_teams().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_team_metrics_through_pool() {
        let dw = warehouse().await;
        let dir = tempfile::tempdir().unwrap();
        dw.add_repository(dir.path(), Some("api"), None, None).await.unwrap();
        dw.add_team("platform", "Platform", &[], &["api".into()]).await.unwrap();

        let range = DateRange::parse("2024-01", chrono::Utc::now().date_naive()).unwrap();
        let m = dw.team_metrics("platform", range).await.unwrap();
        assert_eq!(m.team_name.as_deref(), Some("Platform"));
        assert_eq!(m.activity.commit_count, 0);

        let err = dw.team_metrics("nope", range).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sync_all_reports_failures() {
        let dw = warehouse().await;
        let dir = tempfile::tempdir().unwrap();
        // Not a git repository, so the sync fails.
        dw.add_repository(dir.path(), Some("plain"), None, None).await.unwrap();

        let report = dw.sync_all(SyncAllOptions::default()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.failures[0].repo_id, "plain");

        let status = dw.status().await.unwrap();
        assert_eq!(status.repositories, 1);
        assert_eq!(status.recent_syncs[0].status, "failed");
    }

    #[tokio::test]
    async fn test_collector_requires_tracker() {
        let dw = warehouse().await;
        assert!(matches!(dw.collector().await, Err(Error::Config(_))));

        let dw = dw.with_collectors(CollectorFactory::new(
            AdapterKind::Mock,
            ConfigSource::Inline(mock_config(&["CORE"])),
        ));
        let projects = dw.collector().await.unwrap().get_projects().await.unwrap();
        assert_eq!(projects[0].key, "CORE");
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let dw = warehouse().await;
        dw.config_set("adapter", "mock").await.unwrap();
        assert_eq!(dw.config_get("adapter").await.unwrap().as_deref(), Some("mock"));
        assert_eq!(dw.config_list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_jobs_share_one_worker_limit() {
        let db = Database::open_memory().await.unwrap();
        let options = PipelineOptions {
            workers: 1,
            ..PipelineOptions::default()
        };
        let dw = DoraDW::new(db, options);
        let unknown = || JobKind::Unrecognized {
            kind: "mystery".into(),
            payload: serde_json::json!(null),
        };

        let started = std::time::Instant::now();
        let (a, b, c, d) = tokio::join!(dw.run(unknown()), dw.run(unknown()), dw.run(unknown()), dw.run(unknown()));
        for result in [a, b, c, d] {
            assert!(matches!(result, Ok(JobResult::Echo(_))));
        }
        assert!(started.elapsed() >= 4 * jobs::handlers::FALLBACK_DELAY);
    }
}
