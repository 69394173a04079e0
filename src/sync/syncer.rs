use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::Duration;

use crate::adapter::{Issue, IssueFilter};
use crate::cache::MetricType;
use crate::collector::CollectorFactory;
use crate::error::{Error, Result};
use crate::storage::repository::{self, TrackedRepository};
use crate::storage::Database;
use crate::sync::git::{self, CommitRecord, LogRange};
use crate::sync::{SyncOptions, SyncReport};

/// Sync one tracked repository: commits from its local clone and,
/// optionally, issues from the configured tracker.
///
/// Starts from the last synced commit when one is known. Falls back to a
/// full read when: (a) nothing has been synced yet, (b) `force_full` is set,
/// or (c) the incremental read fails (e.g. the old tip was rewritten away).
///
/// Issue collection failures do not fail the sync; they turn the report
/// into a partial failure. Anything else records a failed history row and
/// returns `Error::Sync`.
pub async fn sync_repository(
    db: &Database,
    collectors: Option<&CollectorFactory>,
    repo_id: &str,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let repo = db
        .reader()
        .call({
            let repo_id = repo_id.to_string();
            move |conn| repository::get_repository(conn, &repo_id)
        })
        .await?
        .ok_or_else(|| Error::NotFound(format!("repository {repo_id}")))?;

    let history_id = db
        .writer()
        .call({
            let repo_id = repo_id.to_string();
            move |conn| repository::insert_sync_history(conn, &repo_id)
        })
        .await?;

    match run_sync(db, collectors, &repo, options).await {
        Ok(report) => {
            db.writer()
                .call({
                    let report = report.clone();
                    move |conn| {
                        repository::finish_sync_history(
                            conn,
                            history_id,
                            report.status.as_str(),
                            report.commits_synced,
                            report.issues_synced,
                            report.error.as_deref(),
                        )
                    }
                })
                .await?;
            log::info!(
                "Synced {}: {} commits, {} issues ({:?})",
                repo.repo_id,
                report.commits_synced,
                report.issues_synced,
                report.status
            );
            Ok(report)
        }
        Err(e) => {
            let message = e.to_string();
            log::error!("Sync of {} failed: {message}", repo.repo_id);
            db.writer()
                .call({
                    let message = message.clone();
                    move |conn| {
                        repository::finish_sync_history(conn, history_id, "failed", 0, 0, Some(&message))
                    }
                })
                .await?;
            Err(Error::Sync {
                target: repo.repo_id.clone(),
                message,
            })
        }
    }
}

async fn run_sync(
    db: &Database,
    collectors: Option<&CollectorFactory>,
    repo: &TrackedRepository,
    options: &SyncOptions,
) -> Result<SyncReport> {
    let (commits, full_sync) = read_history(repo, options.force_full).await?;
    let newest_sha = commits.first().map(|c| c.sha.clone());
    let mut authors: BTreeSet<String> = commits.iter().map(|c| c.author_email.to_lowercase()).collect();

    let (commits_synced, replaced_authors) = db
        .writer()
        .call({
            let repo_id = repo.repo_id.clone();
            let reset = options.force_full;
            move |conn| {
                let tx = conn.transaction()?;
                let mut replaced = Vec::new();
                if reset {
                    replaced = repository::commit_authors(&tx, &repo_id)?;
                    let removed = repository::delete_commits(&tx, &repo_id)?;
                    log::debug!("Removed {removed} stored commits for {repo_id}");
                }
                let mut inserted = 0u64;
                for commit in &commits {
                    if repository::insert_commit(&tx, &repo_id, commit)? {
                        inserted += 1;
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>((inserted, replaced))
            }
        })
        .await?;
    authors.extend(replaced_authors);

    let mut issues_synced = 0u64;
    let mut issue_error = None;
    if options.sync_issues {
        match collect_issues(collectors, options).await {
            Ok(issues) => {
                issues_synced = issues.len() as u64;
                db.writer()
                    .call(move |conn| {
                        let tx = conn.transaction()?;
                        for issue in &issues {
                            repository::upsert_issue(&tx, issue)?;
                        }
                        tx.commit()?;
                        Ok::<(), rusqlite::Error>(())
                    })
                    .await?;
            }
            Err(e) => {
                log::warn!("Issue collection for {} failed: {e}", repo.repo_id);
                issue_error = Some(format!("issue collection failed: {e}"));
            }
        }
    }

    db.writer()
        .call({
            let repo_id = repo.repo_id.clone();
            let issues_changed = issues_synced > 0;
            move |conn| {
                repository::update_repository_sync(conn, &repo_id, newest_sha.as_deref())?;
                repository::delete_cache_for_target(conn, MetricType::Repository.as_str(), &repo_id)?;
                for team_id in repository::teams_for_repository(conn, &repo_id)? {
                    repository::delete_cache_for_target(conn, MetricType::Team.as_str(), &team_id)?;
                }
                // Issue stats can move for any assignee.
                if issues_changed {
                    repository::delete_cache_for_type(conn, MetricType::User.as_str())?;
                } else {
                    for email in &authors {
                        repository::delete_cache_for_target(conn, MetricType::User.as_str(), email)?;
                    }
                }
                Ok::<(), rusqlite::Error>(())
            }
        })
        .await?;

    Ok(SyncReport::from_counts(
        repo.repo_id.clone(),
        commits_synced,
        issues_synced,
        full_sync,
        issue_error,
    ))
}

/// Read new commits, returning them with whether a full read was done.
async fn read_history(repo: &TrackedRepository, force_full: bool) -> Result<(Vec<CommitRecord>, bool)> {
    let path = Path::new(&repo.path);
    let branch = repo.default_branch.as_deref();

    if let (false, Some(since)) = (force_full, repo.last_commit_sha.as_deref()) {
        let range = LogRange {
            branch,
            since_sha: Some(since),
        };
        match git::read_commits(path, &range).await {
            Ok(commits) => return Ok((commits, false)),
            Err(e) => log::warn!("Incremental read of {} failed, falling back to full: {e}", repo.repo_id),
        }
    }

    let range = LogRange {
        branch,
        since_sha: None,
    };
    Ok((git::read_commits(path, &range).await?, true))
}

/// Created and completed issues in the configured window, deduplicated by id.
async fn collect_issues(
    collectors: Option<&CollectorFactory>,
    options: &SyncOptions,
) -> Result<Vec<Issue>> {
    let factory = collectors.ok_or_else(|| Error::Config("no issue tracker configured".into()))?;
    let collector = factory.connect().await?;

    let today = chrono::Utc::now().date_naive();
    let start = options
        .issue_days
        .map(|days| today - Duration::days(i64::from(days)));
    let filter = IssueFilter::default().between(start, None);

    let mut by_id: BTreeMap<String, Issue> = BTreeMap::new();
    for issue in collector.get_created_issues(&filter).await? {
        by_id.insert(issue.id.clone(), issue);
    }
    for issue in collector.get_completed_issues(&filter).await? {
        by_id.insert(issue.id.clone(), issue);
    }
    log::debug!(
        "Collected {} issues through the {} adapter",
        by_id.len(),
        collector.adapter_name()
    );
    Ok(by_id.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::mock::mock_config;
    use crate::adapter::AdapterKind;
    use crate::collector::ConfigSource;
    use crate::sync::git::tests::{commit_file, git_available, init_repo};
    use crate::sync::SyncStatus;

    async fn tracked(db: &Database, dir: &Path) {
        let path = dir.to_string_lossy().to_string();
        db.writer()
            .call(move |conn| repository::add_repository(conn, "api", "API", &path, Some("main")))
            .await
            .unwrap();
    }

    async fn stored_commits(db: &Database) -> u64 {
        db.reader()
            .call(|conn| repository::count_commits(conn, "api"))
            .await
            .unwrap()
    }

    fn mock_factory() -> CollectorFactory {
        CollectorFactory::new(AdapterKind::Mock, ConfigSource::Inline(mock_config(&["CORE"])))
    }

    #[tokio::test]
    async fn test_unknown_repository() {
        let db = Database::open_memory().await.unwrap();
        let err = sync_repository(&db, None, "nope", &SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_full_then_incremental() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path(), 3);
        let db = Database::open_memory().await.unwrap();
        tracked(&db, dir.path()).await;

        let first = sync_repository(&db, None, "api", &SyncOptions::default()).await.unwrap();
        assert_eq!(first.status, SyncStatus::Success);
        assert_eq!(first.commits_synced, 3);
        assert!(first.full_sync);

        commit_file(dir.path(), "later.txt", "CORE-9 follow up");
        let second = sync_repository(&db, None, "api", &SyncOptions::default()).await.unwrap();
        assert_eq!(second.commits_synced, 1);
        assert!(!second.full_sync);
        assert_eq!(stored_commits(&db).await, 4);

        let history = db
            .reader()
            .call(|conn| repository::recent_sync_history(conn, 10))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.status == "completed"));
    }

    #[tokio::test]
    async fn test_force_full_reloads_history() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path(), 2);
        let db = Database::open_memory().await.unwrap();
        tracked(&db, dir.path()).await;

        sync_repository(&db, None, "api", &SyncOptions::default()).await.unwrap();
        let options = SyncOptions {
            force_full: true,
            ..SyncOptions::default()
        };
        let report = sync_repository(&db, None, "api", &options).await.unwrap();
        assert!(report.full_sync);
        assert_eq!(report.commits_synced, 2);
        assert_eq!(stored_commits(&db).await, 2);
    }

    #[tokio::test]
    async fn test_missing_clone_records_failure() {
        let db = Database::open_memory().await.unwrap();
        tracked(&db, Path::new("/no/such/clone")).await;

        let err = sync_repository(&db, None, "api", &SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Sync { .. }));

        let history = db
            .reader()
            .call(|conn| repository::recent_sync_history(conn, 1))
            .await
            .unwrap();
        assert_eq!(history[0].status, "failed");
        assert!(history[0].error_message.is_some());
    }

    #[tokio::test]
    async fn test_sync_with_issues() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path(), 1);
        let db = Database::open_memory().await.unwrap();
        tracked(&db, dir.path()).await;

        let options = SyncOptions {
            sync_issues: true,
            ..SyncOptions::default()
        };
        let report = sync_repository(&db, Some(&mock_factory()), "api", &options)
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::Success);
        assert_eq!(report.issues_synced, 10);
        let stored = db.reader().call(|conn| repository::count_issues(conn)).await.unwrap();
        assert_eq!(stored, 10);
    }

    #[tokio::test]
    async fn test_issue_failure_is_partial() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path(), 2);
        let db = Database::open_memory().await.unwrap();
        tracked(&db, dir.path()).await;

        let mut broken = mock_config(&["CORE"]);
        broken.base_url = String::new();
        let factory = CollectorFactory::new(AdapterKind::Mock, ConfigSource::Inline(broken));
        let options = SyncOptions {
            sync_issues: true,
            ..SyncOptions::default()
        };
        let report = sync_repository(&db, Some(&factory), "api", &options).await.unwrap();
        assert_eq!(report.status, SyncStatus::PartialFailure);
        assert_eq!(report.commits_synced, 2);
        assert!(report.error.unwrap().contains("issue collection failed"));
    }

    #[tokio::test]
    async fn test_sync_invalidates_cached_metrics() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path(), 1);
        let db = Database::open_memory().await.unwrap();
        tracked(&db, dir.path()).await;

        let cache = crate::cache::MetricCache::new(db.clone(), std::time::Duration::from_secs(60));
        let range = crate::date_util::DateRange::parse("2024-01", chrono::Utc::now().date_naive()).unwrap();
        let key = crate::cache::CacheKey::new(MetricType::Repository, "api", &range);
        cache.put(&key, &42u64).await.unwrap();

        sync_repository(&db, None, "api", &SyncOptions::default()).await.unwrap();
        assert_eq!(cache.get::<u64>(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_invalidates_author_metrics() {
        if !git_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path(), 1);
        let db = Database::open_memory().await.unwrap();
        tracked(&db, dir.path()).await;

        let cache = crate::cache::MetricCache::new(db.clone(), std::time::Duration::from_secs(60));
        let range = crate::date_util::DateRange::parse("2024-01", chrono::Utc::now().date_naive()).unwrap();
        let author = crate::cache::CacheKey::new(MetricType::User, "dev@example.com", &range);
        let bystander = crate::cache::CacheKey::new(MetricType::User, "someone@example.com", &range);
        cache.put(&author, &1u64).await.unwrap();
        cache.put(&bystander, &2u64).await.unwrap();

        sync_repository(&db, None, "api", &SyncOptions::default()).await.unwrap();
        assert_eq!(cache.get::<u64>(&author).await.unwrap(), None);
        assert_eq!(cache.get::<u64>(&bystander).await.unwrap(), Some(2));

        // Ingested issues can touch any assignee.
        let options = SyncOptions {
            sync_issues: true,
            ..SyncOptions::default()
        };
        sync_repository(&db, Some(&mock_factory()), "api", &options).await.unwrap();
        assert_eq!(cache.get::<u64>(&bystander).await.unwrap(), None);
    }
}
