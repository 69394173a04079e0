use std::time::Duration;

use super::{JobContext, JobKind, JobResult};
use crate::adapter::{Issue, IssueFilter};
use crate::error::{Error, Result};
use crate::metrics::{self, TeamScope};
use crate::sync::syncer;
use crate::sync::SyncOptions;

/// Delay before the fallback handler answers an unrecognized kind.
pub const FALLBACK_DELAY: Duration = Duration::from_millis(100);

/// Route a job to its handler.
pub async fn run_job(ctx: &JobContext, kind: JobKind) -> Result<JobResult> {
    match kind {
        JobKind::SyncRepository {
            repo_id,
            force_full,
            sync_issues,
        } => {
            let options = SyncOptions {
                force_full,
                sync_issues,
                issue_days: None,
            };
            let report =
                syncer::sync_repository(&ctx.db, ctx.collectors.as_ref(), &repo_id, &options).await?;
            Ok(JobResult::Sync(report))
        }
        JobKind::ComputeRepositoryMetrics { repo_id, range } => {
            let m = metrics::compute_repository_metrics_cached(&ctx.db, &ctx.cache, &repo_id, &range)
                .await?;
            Ok(JobResult::RepositoryMetrics(m))
        }
        JobKind::ComputeUserMetrics { user_id, range } => {
            let m = metrics::compute_user_metrics_cached(&ctx.db, &ctx.cache, &user_id, &range).await?;
            Ok(JobResult::UserMetrics(m))
        }
        JobKind::ComputeTeamMetrics {
            team_id,
            team_name,
            repo_ids,
            range,
        } => {
            let scope = TeamScope {
                team_id,
                team_name,
                repo_ids,
            };
            let m = metrics::compute_team_metrics_cached(&ctx.db, &ctx.cache, &scope, &range).await?;
            Ok(JobResult::TeamMetrics(m))
        }
        JobKind::CollectIssues {
            query,
            page_size,
            page_offset,
        } => collect_issues(ctx, &query, page_size, page_offset)
            .await
            .map(JobResult::Issues),
        JobKind::Unrecognized { kind, payload } => {
            log::warn!("Unrecognized job kind '{kind}'; echoing payload");
            tokio::time::sleep(FALLBACK_DELAY).await;
            Ok(JobResult::Echo(payload))
        }
    }
}

/// One page of issues created in the query window, through a fresh collector.
async fn collect_issues(
    ctx: &JobContext,
    query: &IssueFilter,
    page_size: usize,
    page_offset: usize,
) -> Result<Vec<Issue>> {
    let factory = ctx
        .collectors
        .as_ref()
        .ok_or_else(|| Error::Config("no issue tracker configured".into()))?;
    let collector = factory.connect().await?;
    let issues = collector.get_created_issues(query).await?;

    let limit = if page_size == 0 { usize::MAX } else { page_size };
    Ok(issues.into_iter().skip(page_offset).take(limit).collect())
}
