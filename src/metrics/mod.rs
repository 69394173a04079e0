pub mod types;

pub use types::*;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::LazyLock;

use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Statement};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::cache::{CacheKey, MetricCache, MetricType};
use crate::date_util::{days_between, parse_timestamp, DateRange};
use crate::error::{Error, Result};
use crate::storage::Database;

static RE_ISSUE_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z][A-Z0-9]+-\d+)\b").unwrap());

/// Compute metrics for a repository over a date range.
pub async fn compute_repository_metrics(
    db: &Database,
    repo_id: &str,
    range: &DateRange,
) -> Result<RepositoryMetrics> {
    let range = *range;
    let repo_id = repo_id.to_string();
    let missing = repo_id.clone();

    let metrics = db
        .reader()
        .call(move |conn| {
            let repo_name: Option<String> = conn
                .query_row(
                    "SELECT name FROM repositories WHERE repo_id = ?1",
                    [&repo_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(repo_name) = repo_name else {
                return Ok(None);
            };

            let repo_ids = [repo_id.clone()];
            let scope = CommitScope {
                repo_ids: Some(&repo_ids),
                emails: None,
            };
            let activity = compute_activity_sql(conn, &scope, &range)?;
            let delivery = compute_delivery_sql(conn, &scope, &range)?;

            Ok::<Option<RepositoryMetrics>, rusqlite::Error>(Some(RepositoryMetrics {
                repo_id,
                repo_name: Some(repo_name),
                range,
                activity,
                delivery,
            }))
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

    metrics.ok_or_else(|| Error::NotFound(format!("repository {missing}")))
}

/// Compute metrics for one author (by email) over a date range.
pub async fn compute_user_metrics(
    db: &Database,
    user_email: &str,
    range: &DateRange,
) -> Result<UserMetrics> {
    let range = *range;
    let user_email = user_email.trim().to_lowercase();

    db.reader()
        .call(move |conn| {
            let user_name: Option<String> = conn
                .query_row(
                    "SELECT author_name FROM commits WHERE author_email = ?1
                     ORDER BY committed_at DESC LIMIT 1",
                    [&user_email],
                    |row| row.get(0),
                )
                .optional()?;

            let emails = [user_email.clone()];
            let scope = CommitScope {
                repo_ids: None,
                emails: Some(&emails),
            };
            let activity = compute_activity_sql(conn, &scope, &range)?;

            let repositories_touched: i64 = conn.query_row(
                "SELECT COUNT(DISTINCT repo_id) FROM commits
                 WHERE author_email = ?1 AND date_key >= ?2 AND date_key <= ?3",
                [&user_email, &range.start_key(), &range.end_key()],
                |row| row.get(0),
            )?;

            // Trackers identify assignees by login or email; match either.
            let login = user_email.split('@').next().unwrap_or(&user_email).to_string();
            let mut stmt = conn.prepare(
                "SELECT created_at, resolved_at FROM issues
                 WHERE lower(assignee) IN (?1, ?2)
                   AND resolved_date_key >= ?3 AND resolved_date_key <= ?4",
            )?;
            stmt.raw_bind_parameter(1, &user_email)?;
            stmt.raw_bind_parameter(2, &login)?;
            stmt.raw_bind_parameter(3, range.start_key())?;
            stmt.raw_bind_parameter(4, range.end_key())?;
            let durations = collect_durations(&mut stmt)?;

            Ok::<UserMetrics, rusqlite::Error>(UserMetrics {
                user_email,
                user_name,
                range,
                activity,
                repositories_touched: repositories_touched as u64,
                issues_resolved: durations.len() as u64,
                avg_resolution_days: mean(&durations),
            })
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

/// Compute metrics for a team: its repositories, restricted to its stored
/// members when it has any.
pub async fn compute_team_metrics(
    db: &Database,
    team: &TeamScope,
    range: &DateRange,
) -> Result<TeamMetrics> {
    let range = *range;
    let team = team.clone();

    db.reader()
        .call(move |conn| {
            let team_name = match team.team_name {
                Some(name) => Some(name),
                None => conn
                    .query_row(
                        "SELECT name FROM teams WHERE team_id = ?1",
                        [&team.team_id],
                        |row| row.get(0),
                    )
                    .optional()?,
            };

            let mut stmt = conn
                .prepare("SELECT user_email FROM team_members WHERE team_id = ?1 ORDER BY user_email")?;
            let members: Vec<String> = stmt
                .query_map([&team.team_id], |row| row.get(0))?
                .filter_map(|r| r.ok())
                .collect();
            let emails = (!members.is_empty()).then_some(members.as_slice());

            let mut repositories = Vec::with_capacity(team.repo_ids.len());
            for repo_id in &team.repo_ids {
                let single = [repo_id.clone()];
                let scope = CommitScope {
                    repo_ids: Some(&single),
                    emails,
                };
                repositories.push(RepositoryBreakdown {
                    repo_id: repo_id.clone(),
                    activity: compute_activity_sql(conn, &scope, &range)?,
                });
            }

            let scope = CommitScope {
                repo_ids: Some(&team.repo_ids),
                emails,
            };
            let activity = compute_activity_sql(conn, &scope, &range)?;
            let delivery = compute_delivery_sql(conn, &scope, &range)?;

            Ok::<TeamMetrics, rusqlite::Error>(TeamMetrics {
                team_id: team.team_id,
                team_name,
                range,
                member_count: members.len() as u64,
                activity,
                delivery,
                repositories,
            })
        })
        .await
        .map_err(|e| Error::Database(e.to_string()))
}

// ── Cached variants ────────────────────────────────────────────────

pub async fn compute_repository_metrics_cached(
    db: &Database,
    cache: &MetricCache,
    repo_id: &str,
    range: &DateRange,
) -> Result<RepositoryMetrics> {
    let key = CacheKey::new(MetricType::Repository, repo_id, range);
    cached(cache, &key, compute_repository_metrics(db, repo_id, range)).await
}

pub async fn compute_user_metrics_cached(
    db: &Database,
    cache: &MetricCache,
    user_email: &str,
    range: &DateRange,
) -> Result<UserMetrics> {
    let key = CacheKey::new(MetricType::User, &user_email.trim().to_lowercase(), range);
    cached(cache, &key, compute_user_metrics(db, user_email, range)).await
}

pub async fn compute_team_metrics_cached(
    db: &Database,
    cache: &MetricCache,
    team: &TeamScope,
    range: &DateRange,
) -> Result<TeamMetrics> {
    let key = CacheKey::new(MetricType::Team, &team.team_id, range);
    cached(cache, &key, compute_team_metrics(db, team, range)).await
}

/// Serve `key` from the cache, or run `compute` and store its result.
/// Cache trouble never fails the computation.
async fn cached<T, F>(cache: &MetricCache, key: &CacheKey, compute: F) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: Future<Output = Result<T>>,
{
    match cache.get::<T>(key).await {
        Ok(Some(hit)) => return Ok(hit),
        Ok(None) => {}
        Err(e) => log::warn!("Cache lookup for {key} failed: {e}"),
    }
    let value = compute.await?;
    if let Err(e) = cache.put(key, &value).await {
        log::warn!("Failed to cache {key}: {e}");
    }
    Ok(value)
}

// ── Internal SQL helpers ───────────────────────────────────────────

/// Which commits a metric looks at. `None` means unrestricted; an empty
/// slice matches nothing.
struct CommitScope<'a> {
    repo_ids: Option<&'a [String]>,
    emails: Option<&'a [String]>,
}

impl CommitScope<'_> {
    fn clause(&self) -> String {
        let mut sql = String::new();
        for (column, values) in [("c.repo_id", self.repo_ids), ("c.author_email", self.emails)] {
            match values {
                None => {}
                Some([]) => sql.push_str(" AND 0"),
                Some(values) => {
                    let placeholders = vec!["?"; values.len()].join(",");
                    sql.push_str(&format!(" AND {column} IN ({placeholders})"));
                }
            }
        }
        sql
    }

    fn bind(&self, stmt: &mut Statement<'_>, mut idx: usize) -> rusqlite::Result<usize> {
        for values in [self.repo_ids, self.emails].into_iter().flatten() {
            for value in values {
                stmt.raw_bind_parameter(idx, value)?;
                idx += 1;
            }
        }
        Ok(idx)
    }
}

fn compute_activity_sql(
    conn: &Connection,
    scope: &CommitScope<'_>,
    range: &DateRange,
) -> std::result::Result<ActivityMetrics, rusqlite::Error> {
    let sql = format!(
        "SELECT COUNT(*), COUNT(DISTINCT c.author_email),
                COALESCE(SUM(c.additions), 0), COALESCE(SUM(c.deletions), 0),
                COUNT(DISTINCT c.date_key)
         FROM commits c
         WHERE c.date_key >= ? AND c.date_key <= ?{}",
        scope.clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.raw_bind_parameter(1, range.start_key())?;
    stmt.raw_bind_parameter(2, range.end_key())?;
    scope.bind(&mut stmt, 3)?;

    let mut rows = stmt.raw_query();
    let Some(row) = rows.next()? else {
        return Ok(ActivityMetrics::default());
    };
    Ok(ActivityMetrics {
        commit_count: row.get::<_, i64>(0)? as u64,
        active_authors: row.get::<_, i64>(1)? as u64,
        additions: row.get::<_, i64>(2)? as u64,
        deletions: row.get::<_, i64>(3)? as u64,
        active_days: row.get::<_, i64>(4)? as u64,
    })
}

fn compute_delivery_sql(
    conn: &Connection,
    scope: &CommitScope<'_>,
    range: &DateRange,
) -> std::result::Result<DeliveryMetrics, rusqlite::Error> {
    // Deployments and failure fixes come from commits inside the range.
    let sql = format!(
        "SELECT c.message, c.is_merge FROM commits c
         WHERE c.date_key >= ? AND c.date_key <= ?{}",
        scope.clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.raw_bind_parameter(1, range.start_key())?;
    stmt.raw_bind_parameter(2, range.end_key())?;
    scope.bind(&mut stmt, 3)?;

    let (mut commits, mut deployments, mut failures) = (0u64, 0u64, 0u64);
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let message: String = row.get(0)?;
        let is_merge: bool = row.get(1)?;
        commits += 1;
        if is_merge {
            deployments += 1;
        }
        if is_failure_fix(&message) {
            failures += 1;
        }
    }
    drop(rows);

    // Issue keys are linked from any commit in scope, not only recent ones.
    let sql = format!("SELECT c.message FROM commits c WHERE 1 = 1{}", scope.clause());
    let mut stmt = conn.prepare(&sql)?;
    scope.bind(&mut stmt, 1)?;
    let mut issue_keys = BTreeSet::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let message: String = row.get(0)?;
        issue_keys.extend(referenced_issue_keys(&message));
    }
    drop(rows);

    let project_keys: BTreeSet<String> = issue_keys
        .iter()
        .filter_map(|key| key.rsplit_once('-').map(|(project, _)| project.to_string()))
        .collect();

    let lead_times = resolved_issue_durations(conn, "issue_key", &issue_keys, range, false)?;
    let repairs = resolved_issue_durations(conn, "project_key", &project_keys, range, true)?;

    Ok(DeliveryMetrics {
        deployment_count: deployments,
        deployments_per_day: deployments as f64 / range.days() as f64,
        change_failure_count: failures,
        change_failure_rate: if commits > 0 {
            failures as f64 / commits as f64 * 100.0
        } else {
            0.0
        },
        lead_time_days: mean(&lead_times),
        lead_time_samples: lead_times.len() as u64,
        mttr_days: mean(&repairs),
        incidents_resolved: repairs.len() as u64,
    })
}

/// Creation-to-resolution days of issues resolved in `range` whose `column`
/// is one of `values`.
fn resolved_issue_durations(
    conn: &Connection,
    column: &str,
    values: &BTreeSet<String>,
    range: &DateRange,
    bugs_only: bool,
) -> std::result::Result<Vec<f64>, rusqlite::Error> {
    if values.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; values.len()].join(",");
    let bug_filter = if bugs_only { " AND lower(issue_type) = 'bug'" } else { "" };
    let sql = format!(
        "SELECT created_at, resolved_at FROM issues
         WHERE resolved_date_key >= ? AND resolved_date_key <= ?
           AND {column} IN ({placeholders}){bug_filter}"
    );
    let mut stmt = conn.prepare(&sql)?;
    stmt.raw_bind_parameter(1, range.start_key())?;
    stmt.raw_bind_parameter(2, range.end_key())?;
    for (i, value) in values.iter().enumerate() {
        stmt.raw_bind_parameter(i + 3, value)?;
    }
    collect_durations(&mut stmt)
}

/// Read `(created_at, resolved_at)` rows from a bound statement into day counts.
fn collect_durations(stmt: &mut Statement<'_>) -> std::result::Result<Vec<f64>, rusqlite::Error> {
    let mut days = Vec::new();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let created: String = row.get(0)?;
        let resolved: Option<String> = row.get(1)?;
        let (Some(created), Some(resolved)) = (
            parse_timestamp(&created),
            resolved.as_deref().and_then(parse_timestamp),
        ) else {
            continue;
        };
        days.push(days_between(created, resolved));
    }
    Ok(days)
}

/// Subjects that undo or patch a previous change.
pub fn is_failure_fix(message: &str) -> bool {
    let subject = message.trim().to_lowercase();
    subject.starts_with("revert") || subject.starts_with("hotfix") || subject.contains("rollback")
}

/// Tracker keys such as `CORE-42` mentioned in a commit message.
pub fn referenced_issue_keys(message: &str) -> impl Iterator<Item = String> + '_ {
    RE_ISSUE_KEY
        .captures_iter(message)
        .map(|caps| caps[1].to_string())
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
