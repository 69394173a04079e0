use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::adapter::Issue;
use crate::date_util::date_key;
use crate::sync::git::CommitRecord;

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now() -> String {
    timestamp(&Utc::now())
}

// ── Repositories ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRepository {
    pub repo_id: String,
    pub name: String,
    pub path: String,
    pub default_branch: Option<String>,
    pub added_at: String,
    pub last_sync_at: Option<String>,
    pub last_commit_sha: Option<String>,
}

pub fn add_repository(
    conn: &Connection,
    repo_id: &str,
    name: &str,
    path: &str,
    default_branch: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO repositories (repo_id, name, path, default_branch, added_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(repo_id) DO UPDATE SET
           name = excluded.name,
           path = excluded.path,
           default_branch = excluded.default_branch",
        params![repo_id, name, path, default_branch, now()],
    )?;
    Ok(())
}

pub fn remove_repository(conn: &Connection, repo_id: &str) -> Result<bool, rusqlite::Error> {
    let count = conn.execute(
        "DELETE FROM repositories WHERE repo_id = ?1",
        params![repo_id],
    )?;
    Ok(count > 0)
}

fn repository_from_row(row: &rusqlite::Row<'_>) -> Result<TrackedRepository, rusqlite::Error> {
    Ok(TrackedRepository {
        repo_id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        default_branch: row.get(3)?,
        added_at: row.get(4)?,
        last_sync_at: row.get(5)?,
        last_commit_sha: row.get(6)?,
    })
}

pub fn get_repository(
    conn: &Connection,
    repo_id: &str,
) -> Result<Option<TrackedRepository>, rusqlite::Error> {
    conn.query_row(
        "SELECT repo_id, name, path, default_branch, added_at, last_sync_at, last_commit_sha
         FROM repositories WHERE repo_id = ?1",
        params![repo_id],
        repository_from_row,
    )
    .optional()
}

pub fn list_repositories(conn: &Connection) -> Result<Vec<TrackedRepository>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT repo_id, name, path, default_branch, added_at, last_sync_at, last_commit_sha
         FROM repositories ORDER BY added_at, repo_id",
    )?;
    let rows = stmt.query_map([], repository_from_row)?;
    rows.collect()
}

pub fn update_repository_sync(
    conn: &Connection,
    repo_id: &str,
    last_commit_sha: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE repositories SET
            last_sync_at = ?2,
            last_commit_sha = COALESCE(?3, last_commit_sha)
         WHERE repo_id = ?1",
        params![repo_id, now(), last_commit_sha],
    )?;
    Ok(())
}

// ── Commits ────────────────────────────────────────────────────────

/// Insert a commit, ignoring ones already stored. Returns whether it was new.
pub fn insert_commit(
    conn: &Connection,
    repo_id: &str,
    commit: &CommitRecord,
) -> Result<bool, rusqlite::Error> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO commits (
            repo_id, sha, author_name, author_email, committed_at, date_key,
            message, additions, deletions, is_merge
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            repo_id,
            commit.sha,
            commit.author_name,
            commit.author_email.to_lowercase(),
            timestamp(&commit.committed_at),
            date_key(&commit.committed_at),
            commit.message,
            commit.additions as i64,
            commit.deletions as i64,
            commit.is_merge,
        ],
    )?;
    Ok(inserted > 0)
}

pub fn delete_commits(conn: &Connection, repo_id: &str) -> Result<usize, rusqlite::Error> {
    conn.execute("DELETE FROM commits WHERE repo_id = ?1", params![repo_id])
}

/// Distinct (lowercased) author emails of the stored commits for a repository.
pub fn commit_authors(conn: &Connection, repo_id: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT DISTINCT author_email FROM commits WHERE repo_id = ?1")?;
    let rows = stmt.query_map(params![repo_id], |row| row.get(0))?;
    rows.collect()
}

pub fn count_commits(conn: &Connection, repo_id: &str) -> Result<u64, rusqlite::Error> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM commits WHERE repo_id = ?1",
        params![repo_id],
        |row| row.get(0),
    )?;
    Ok(n as u64)
}

// ── Issues ─────────────────────────────────────────────────────────

pub fn upsert_issue(conn: &Connection, issue: &Issue) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO issues (
            issue_id, issue_key, project_key, summary, issue_type, status,
            created_at, resolved_at, resolved_date_key, assignee, reporter, cached_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(issue_id) DO UPDATE SET
            issue_key=excluded.issue_key, project_key=excluded.project_key,
            summary=excluded.summary, issue_type=excluded.issue_type,
            status=excluded.status, created_at=excluded.created_at,
            resolved_at=excluded.resolved_at, resolved_date_key=excluded.resolved_date_key,
            assignee=excluded.assignee, reporter=excluded.reporter,
            cached_at=excluded.cached_at",
        params![
            issue.id,
            issue.key,
            issue.project_key(),
            issue.summary,
            issue.issue_type,
            issue.status,
            timestamp(&issue.created),
            issue.resolution_date.as_ref().map(timestamp),
            issue.resolution_date.as_ref().map(date_key),
            issue.assignee,
            issue.reporter,
            now(),
        ],
    )?;
    Ok(())
}

pub fn count_issues(conn: &Connection) -> Result<u64, rusqlite::Error> {
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM issues", [], |row| row.get(0))?;
    Ok(n as u64)
}

// ── Teams ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub team_id: String,
    pub name: String,
    pub members: Vec<String>,
    pub repo_ids: Vec<String>,
}

pub fn upsert_team(conn: &Connection, team_id: &str, name: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO teams (team_id, name) VALUES (?1, ?2)
         ON CONFLICT(team_id) DO UPDATE SET name = excluded.name",
        params![team_id, name],
    )?;
    Ok(())
}

pub fn add_team_member(
    conn: &Connection,
    team_id: &str,
    user_email: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO team_members (team_id, user_email) VALUES (?1, ?2)",
        params![team_id, user_email.to_lowercase()],
    )?;
    Ok(())
}

pub fn add_team_repository(
    conn: &Connection,
    team_id: &str,
    repo_id: &str,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO team_repositories (team_id, repo_id) VALUES (?1, ?2)",
        params![team_id, repo_id],
    )?;
    Ok(())
}

fn column_list(conn: &Connection, sql: &str, id: &str) -> Result<Vec<String>, rusqlite::Error> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![id], |row| row.get(0))?;
    rows.collect()
}

pub fn get_team(conn: &Connection, team_id: &str) -> Result<Option<Team>, rusqlite::Error> {
    let name: Option<String> = conn
        .query_row(
            "SELECT name FROM teams WHERE team_id = ?1",
            params![team_id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(name) = name else {
        return Ok(None);
    };
    Ok(Some(Team {
        team_id: team_id.to_string(),
        name,
        members: column_list(
            conn,
            "SELECT user_email FROM team_members WHERE team_id = ?1 ORDER BY user_email",
            team_id,
        )?,
        repo_ids: column_list(
            conn,
            "SELECT repo_id FROM team_repositories WHERE team_id = ?1 ORDER BY repo_id",
            team_id,
        )?,
    }))
}

pub fn list_teams(conn: &Connection) -> Result<Vec<Team>, rusqlite::Error> {
    let ids = {
        let mut stmt = conn.prepare("SELECT team_id FROM teams ORDER BY team_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>()?
    };
    let mut teams = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(team) = get_team(conn, &id)? {
            teams.push(team);
        }
    }
    Ok(teams)
}

pub fn teams_for_repository(conn: &Connection, repo_id: &str) -> Result<Vec<String>, rusqlite::Error> {
    column_list(
        conn,
        "SELECT team_id FROM team_repositories WHERE repo_id = ?1 ORDER BY team_id",
        repo_id,
    )
}

// ── Sync History ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SyncHistoryRow {
    pub id: i64,
    pub repo_id: String,
    pub status: String,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub commits_synced: u64,
    pub issues_synced: u64,
    pub error_message: Option<String>,
}

pub fn insert_sync_history(conn: &Connection, repo_id: &str) -> Result<i64, rusqlite::Error> {
    conn.execute(
        "INSERT INTO sync_history (repo_id, status, started_at) VALUES (?1, 'running', ?2)",
        params![repo_id, now()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_sync_history(
    conn: &Connection,
    id: i64,
    status: &str,
    commits_synced: u64,
    issues_synced: u64,
    error_message: Option<&str>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "UPDATE sync_history SET
            status = ?2, completed_at = ?3,
            commits_synced = ?4, issues_synced = ?5,
            error_message = ?6
         WHERE id = ?1",
        params![
            id,
            status,
            now(),
            commits_synced as i64,
            issues_synced as i64,
            error_message,
        ],
    )?;
    Ok(())
}

pub fn recent_sync_history(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<SyncHistoryRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, repo_id, status, started_at, completed_at, commits_synced, issues_synced, error_message
         FROM sync_history ORDER BY id DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok(SyncHistoryRow {
            id: row.get(0)?,
            repo_id: row.get(1)?,
            status: row.get(2)?,
            started_at: row.get(3)?,
            completed_at: row.get(4)?,
            commits_synced: row.get::<_, i64>(5)? as u64,
            issues_synced: row.get::<_, i64>(6)? as u64,
            error_message: row.get(7)?,
        })
    })?;
    rows.collect()
}

// ── Metric Cache ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CacheRow {
    pub data: String,
    pub created_at: String,
    pub expires_at: String,
}

#[allow(clippy::too_many_arguments)]
pub fn put_cache_entry(
    conn: &Connection,
    cache_key: &str,
    metric_type: &str,
    target_id: &str,
    start_date: &str,
    end_date: &str,
    data: &str,
    expires_at: &DateTime<Utc>,
) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO metric_cache (
            cache_key, metric_type, target_id, start_date, end_date, data, created_at, expires_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            cache_key,
            metric_type,
            target_id,
            start_date,
            end_date,
            data,
            now(),
            timestamp(expires_at),
        ],
    )?;
    Ok(())
}

pub fn get_cache_entry(
    conn: &Connection,
    cache_key: &str,
) -> Result<Option<CacheRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT data, created_at, expires_at FROM metric_cache WHERE cache_key = ?1",
        params![cache_key],
        |row| {
            Ok(CacheRow {
                data: row.get(0)?,
                created_at: row.get(1)?,
                expires_at: row.get(2)?,
            })
        },
    )
    .optional()
}

pub fn delete_cache_for_target(
    conn: &Connection,
    metric_type: &str,
    target_id: &str,
) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM metric_cache WHERE metric_type = ?1 AND target_id = ?2",
        params![metric_type, target_id],
    )
}

pub fn delete_cache_for_type(conn: &Connection, metric_type: &str) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM metric_cache WHERE metric_type = ?1",
        params![metric_type],
    )
}

pub fn purge_expired_cache(conn: &Connection, now: &DateTime<Utc>) -> Result<usize, rusqlite::Error> {
    conn.execute(
        "DELETE FROM metric_cache WHERE expires_at < ?1",
        params![timestamp(now)],
    )
}

// ── Config ─────────────────────────────────────────────────────────

pub fn get_config(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row(
        "SELECT value FROM app_config WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_config(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value, updated_at)
         VALUES (?1, ?2, ?3)",
        params![key, value, now()],
    )?;
    Ok(())
}

pub fn list_config(conn: &Connection) -> Result<Vec<(String, String)>, rusqlite::Error> {
    let mut stmt = conn.prepare("SELECT key, value FROM app_config ORDER BY key")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::date_util::parse_timestamp;
    use crate::storage::Database;

    pub(crate) fn commit(sha: &str, email: &str, at: &str, message: &str) -> CommitRecord {
        CommitRecord {
            sha: sha.to_string(),
            author_name: email.split('@').next().unwrap_or(email).to_string(),
            author_email: email.to_string(),
            committed_at: parse_timestamp(at).unwrap(),
            message: message.to_string(),
            additions: 10,
            deletions: 2,
            is_merge: false,
        }
    }

    #[tokio::test]
    async fn test_config_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                set_config(conn, "adapter", "jira")?;
                assert_eq!(get_config(conn, "adapter")?, Some("jira".to_string()));
                assert_eq!(get_config(conn, "nonexistent")?, None);
                assert_eq!(list_config(conn)?.len(), 1);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_repository_crud() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                add_repository(conn, "api", "API", "/src/api", Some("main"))?;
                add_repository(conn, "web", "Web", "/src/web", None)?;
                assert_eq!(list_repositories(conn)?.len(), 2);

                // Re-adding updates in place
                add_repository(conn, "api", "API Server", "/src/api", Some("main"))?;
                let api = get_repository(conn, "api")?.unwrap();
                assert_eq!(api.name, "API Server");
                assert!(api.last_sync_at.is_none());

                update_repository_sync(conn, "api", Some("abc123"))?;
                update_repository_sync(conn, "api", None)?;
                let api = get_repository(conn, "api")?.unwrap();
                assert_eq!(api.last_commit_sha.as_deref(), Some("abc123"));
                assert!(api.last_sync_at.is_some());

                assert!(remove_repository(conn, "web")?);
                assert!(!remove_repository(conn, "web")?);
                assert!(get_repository(conn, "web")?.is_none());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_commit_insert_is_idempotent() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                add_repository(conn, "api", "API", "/src/api", None)?;
                let c = commit("a1", "Dev@Example.com", "2024-03-01T10:00:00Z", "init");
                assert!(insert_commit(conn, "api", &c)?);
                assert!(!insert_commit(conn, "api", &c)?);
                assert_eq!(count_commits(conn, "api")?, 1);

                let email: String = conn.query_row(
                    "SELECT author_email FROM commits WHERE sha = 'a1'",
                    [],
                    |row| row.get(0),
                )?;
                assert_eq!(email, "dev@example.com");
                insert_commit(conn, "api", &commit("a2", "dev@example.com", "2024-03-02T10:00:00Z", "more"))?;
                assert_eq!(commit_authors(conn, "api")?, vec!["dev@example.com".to_string()]);

                assert_eq!(delete_commits(conn, "api")?, 2);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_issue_upsert() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let mut issue = crate::adapter::tests::issue("CORE-1", "Open", "2024-01-01", None);
                upsert_issue(conn, &issue)?;
                issue.status = "Done".into();
                issue.resolution_date = parse_timestamp("2024-01-05");
                upsert_issue(conn, &issue)?;

                assert_eq!(count_issues(conn)?, 1);
                let (status, key, day): (String, String, Option<String>) = conn.query_row(
                    "SELECT status, project_key, resolved_date_key FROM issues",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;
                assert_eq!(status, "Done");
                assert_eq!(key, "CORE");
                assert_eq!(day.as_deref(), Some("2024-01-05"));
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_team_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                add_repository(conn, "api", "API", "/src/api", None)?;
                upsert_team(conn, "platform", "Platform")?;
                add_team_member(conn, "platform", "A@example.com")?;
                add_team_member(conn, "platform", "a@example.com")?;
                add_team_repository(conn, "platform", "api")?;

                let team = get_team(conn, "platform")?.unwrap();
                assert_eq!(team.members, vec!["a@example.com"]);
                assert_eq!(team.repo_ids, vec!["api"]);
                assert!(get_team(conn, "nope")?.is_none());
                assert_eq!(list_teams(conn)?.len(), 1);
                assert_eq!(teams_for_repository(conn, "api")?, vec!["platform"]);
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_history_round_trip() {
        let db = Database::open_memory().await.unwrap();

        db.writer()
            .call(|conn| {
                let id = insert_sync_history(conn, "api")?;
                assert!(id > 0);
                finish_sync_history(conn, id, "failed", 3, 0, Some("git exploded"))?;

                let rows = recent_sync_history(conn, 10)?;
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].status, "failed");
                assert_eq!(rows[0].commits_synced, 3);
                assert_eq!(rows[0].error_message.as_deref(), Some("git exploded"));
                assert!(rows[0].completed_at.is_some());
                Ok::<(), rusqlite::Error>(())
            })
            .await
            .unwrap();
    }

    #[test]
    fn test_timestamp_sorts_as_text() {
        let a = parse_timestamp("2024-01-01T09:00:00Z").unwrap();
        let b = parse_timestamp("2024-01-01T10:00:00Z").unwrap();
        assert!(timestamp(&a) < timestamp(&b));
        assert_eq!(timestamp(&a), "2024-01-01T09:00:00.000Z");
    }
}
