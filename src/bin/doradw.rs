use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use doradw::adapter::mock::mock_config;
use doradw::{
    AdapterKind, CollectorFactory, ConfigSource, DateRange, DoraDW, IssueFilter, PipelineOptions,
    SyncAllOptions,
};

#[derive(Parser)]
#[command(name = "doradw", about = "Engineering metrics warehouse CLI")]
struct Cli {
    /// Database path (default: ~/.doradw/doradw.db)
    #[arg(long)]
    db: Option<String>,

    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Maximum number of jobs running at once
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Per-job timeout in seconds
    #[arg(long, default_value = "300")]
    job_timeout: u64,

    /// Lifetime of cached metrics in seconds
    #[arg(long, default_value = "3600")]
    cache_ttl: u64,

    #[command(subcommand)]
    command: Commands,
}

/// Which issue tracker to talk to.
#[derive(Args, Clone)]
struct TrackerArgs {
    /// Use the synthetic tracker instead of Jira
    #[arg(long)]
    mock: bool,

    /// JSON file with tracker settings (default: DORADW_TRACKER_* env vars)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Project keys for the synthetic tracker
    #[arg(long = "project", value_name = "KEY")]
    projects: Vec<String>,
}

impl TrackerArgs {
    fn factory(&self) -> CollectorFactory {
        if self.mock {
            let keys: Vec<&str> = self.projects.iter().map(String::as_str).collect();
            return CollectorFactory::new(AdapterKind::Mock, ConfigSource::Inline(mock_config(&keys)));
        }
        let factory = CollectorFactory::new(AdapterKind::Jira, ConfigSource::Env);
        match &self.config {
            Some(path) => factory.with_config_path(path),
            None => factory,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tracked repositories
    Repo {
        #[command(subcommand)]
        action: RepoAction,
    },
    /// Manage teams
    Team {
        #[command(subcommand)]
        action: TeamAction,
    },
    /// Sync commits (and optionally issues) into the warehouse
    Sync {
        #[command(subcommand)]
        target: SyncCommand,
    },
    /// Compute metrics for a repository, user or team
    Metrics {
        #[command(subcommand)]
        target: MetricsTarget,
    },
    /// Query the issue tracker directly
    Issues {
        #[command(subcommand)]
        action: IssuesAction,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show warehouse status
    Status,
}

#[derive(Subcommand)]
enum RepoAction {
    /// Track a local clone
    Add {
        /// Path to the clone
        path: PathBuf,
        /// Repository id (default: directory name)
        #[arg(long)]
        id: Option<String>,
        /// Display name (default: directory name)
        #[arg(long)]
        name: Option<String>,
        /// Branch to read (default: HEAD)
        #[arg(long)]
        branch: Option<String>,
    },
    /// List tracked repositories
    List,
    /// Stop tracking a repository and drop its commits
    Remove { repo_id: String },
}

#[derive(Subcommand)]
enum TeamAction {
    /// Create a team or add members and repositories to it
    Add {
        team_id: String,
        #[arg(long)]
        name: Option<String>,
        /// Member email (repeatable)
        #[arg(long = "member", value_name = "EMAIL")]
        members: Vec<String>,
        /// Repository id (repeatable)
        #[arg(long = "repo", value_name = "REPO_ID")]
        repos: Vec<String>,
    },
    /// List teams
    List,
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Sync every tracked repository, in the order they were added
    All {
        #[command(flatten)]
        sync: SyncFlags,
    },
    /// Sync one repository
    Repo {
        repo_id: String,
        #[command(flatten)]
        sync: SyncFlags,
    },
}

#[derive(Args)]
struct SyncFlags {
    /// Re-read the whole history instead of continuing from the last commit
    #[arg(long)]
    full: bool,

    /// Also collect issues from the tracker
    #[arg(long)]
    issues: bool,

    #[command(flatten)]
    tracker: TrackerArgs,
}

impl SyncFlags {
    fn options(&self) -> SyncAllOptions {
        SyncAllOptions {
            force_full: self.full,
            sync_issues: self.issues,
        }
    }
}

#[derive(Subcommand)]
enum MetricsTarget {
    /// Metrics for a repository
    Repo {
        repo_id: String,
        /// Range (e.g. 2025-Q1, 2025-03, 30d, 2025-01-01..2025-01-31)
        #[arg(long, default_value = "30d")]
        range: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Metrics for a commit author
    User {
        email: String,
        #[arg(long, default_value = "30d")]
        range: String,
        #[arg(long)]
        json: bool,
    },
    /// Metrics for a team
    Team {
        team_id: String,
        #[arg(long, default_value = "30d")]
        range: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum IssuesAction {
    /// Statistics for issues created in a window
    Stats {
        #[command(flatten)]
        tracker: TrackerArgs,
        /// Restrict to one project key
        #[arg(long = "key")]
        project_key: Option<String>,
        /// Range (default: all time)
        #[arg(long)]
        range: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Totals across every visible project
    Summary {
        #[command(flatten)]
        tracker: TrackerArgs,
        #[arg(long)]
        range: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List visible projects
    Projects {
        #[command(flatten)]
        tracker: TrackerArgs,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
}

fn parse_range(range: &str) -> anyhow::Result<DateRange> {
    Ok(DateRange::parse(range, chrono::Local::now().date_naive())?)
}

fn parse_window(range: Option<&str>) -> anyhow::Result<(Option<chrono::NaiveDate>, Option<chrono::NaiveDate>)> {
    match range {
        Some(r) => {
            let r = parse_range(r)?;
            Ok((Some(r.start), Some(r.end)))
        }
        None => Ok((None, None)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let db = match &cli.db {
        Some(path) => doradw::Database::open_at(path).await?,
        None => doradw::Database::open().await?,
    };
    let options = PipelineOptions {
        workers: cli.workers,
        job_timeout: Duration::from_secs(cli.job_timeout),
        cache_ttl: Duration::from_secs(cli.cache_ttl),
    };
    let dw = DoraDW::new(db, options);

    match cli.command {
        Commands::Status => print_status(&dw).await?,
        Commands::Config { action } => handle_config(&dw, action).await?,
        Commands::Repo { action } => handle_repo(&dw, action).await?,
        Commands::Team { action } => handle_team(&dw, action).await?,
        Commands::Metrics { target } => handle_metrics(&dw, target).await?,
        Commands::Sync { target } => handle_sync(dw, target).await?,
        Commands::Issues { action } => handle_issues(dw, action).await?,
    }

    Ok(())
}

async fn print_status(dw: &DoraDW) -> anyhow::Result<()> {
    let status = dw.status().await?;
    println!("Warehouse Status");
    println!("  Repositories: {}", status.repositories);
    println!("  Commits:      {}", status.commits);
    println!("  Issues:       {}", status.issues);
    println!("  Teams:        {}", status.teams);
    match status.recent_syncs.first() {
        Some(last) => println!(
            "  Last sync:    {} {} ({})",
            last.repo_id,
            last.status,
            last.completed_at.as_deref().unwrap_or("in progress")
        ),
        None => println!("  Last sync:    never"),
    }
    Ok(())
}

async fn handle_config(dw: &DoraDW, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match dw.config_get(&key).await? {
            Some(v) => println!("{key} = {v}"),
            None => println!("{key} is not set"),
        },
        ConfigAction::Set { key, value } => {
            dw.config_set(&key, &value).await?;
            println!("Config updated.");
        }
        ConfigAction::List => {
            let items = dw.config_list().await?;
            if items.is_empty() {
                println!("No configuration set.");
            } else {
                for (k, v) in items {
                    println!("{k} = {v}");
                }
            }
        }
    }
    Ok(())
}

async fn handle_repo(dw: &DoraDW, action: RepoAction) -> anyhow::Result<()> {
    match action {
        RepoAction::Add {
            path,
            id,
            name,
            branch,
        } => {
            let repo = dw
                .add_repository(&path, id.as_deref(), name.as_deref(), branch.as_deref())
                .await?;
            println!("Added: {} ({})", repo.repo_id, repo.path);
        }
        RepoAction::List => {
            let repos = dw.list_repositories().await?;
            if repos.is_empty() {
                println!("No tracked repositories.");
            }
            for r in repos {
                let last = r.last_sync_at.as_deref().unwrap_or("never");
                println!("{} {} {} (last sync: {})", r.repo_id, r.name, r.path, last);
            }
        }
        RepoAction::Remove { repo_id } => {
            if dw.remove_repository(&repo_id).await? {
                println!("Removed: {repo_id}");
            } else {
                println!("Not found: {repo_id}");
            }
        }
    }
    Ok(())
}

async fn handle_team(dw: &DoraDW, action: TeamAction) -> anyhow::Result<()> {
    match action {
        TeamAction::Add {
            team_id,
            name,
            members,
            repos,
        } => {
            let name = name.unwrap_or_else(|| team_id.clone());
            let team = dw.add_team(&team_id, &name, &members, &repos).await?;
            println!(
                "Team {}: {} members, {} repositories",
                team.team_id,
                team.members.len(),
                team.repo_ids.len()
            );
        }
        TeamAction::List => {
            let teams = dw.list_teams().await?;
            if teams.is_empty() {
                println!("No teams.");
            }
            for t in teams {
                println!("{} {}", t.team_id, t.name);
                println!("  Members: {}", t.members.join(", "));
                println!("  Repos:   {}", t.repo_ids.join(", "));
            }
        }
    }
    Ok(())
}

async fn handle_sync(dw: DoraDW, target: SyncCommand) -> anyhow::Result<()> {
    match target {
        SyncCommand::Repo { repo_id, sync } => {
            let dw = with_tracker(dw, &sync);
            let report = dw.sync_repository(&repo_id, sync.options()).await?;
            print_sync_report(&report);
        }
        SyncCommand::All { sync } => {
            let dw = with_tracker(dw, &sync);
            let targets = dw.sync_targets().await?;
            if targets.is_empty() {
                println!("No tracked repositories to sync. Use 'repo add' first.");
                return Ok(());
            }

            let mut dispatcher = dw.dispatcher();
            let reporter = tokio::spawn(report_progress(dispatcher.progress_handle()));
            let cancel = dispatcher.cancel_handle();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("Interrupted; stopping after the current repository...");
                    cancel.cancel();
                }
            });

            let summary = dispatcher.sync_all(&targets, sync.options()).await;
            interrupt.abort();
            drop(dispatcher);
            let _ = reporter.await;

            for report in &summary.reports {
                print_sync_report(report);
                println!();
            }
            for failure in &summary.failures {
                println!("Failed: {} ({})", failure.repo_id, failure.message);
            }
            println!(
                "{} succeeded, {} failed{}",
                summary.succeeded,
                summary.failed,
                if summary.cancelled { ", cancelled" } else { "" }
            );
        }
    }
    Ok(())
}

fn with_tracker(dw: DoraDW, sync: &SyncFlags) -> DoraDW {
    if sync.issues {
        dw.with_collectors(sync.tracker.factory())
    } else {
        dw
    }
}

/// Print a line to stderr each time the run moves to another repository.
async fn report_progress(mut handle: doradw::ProgressHandle) {
    let mut last_seen = None;
    while handle.changed().await {
        let p = handle.get();
        let Some(current) = p.current_repository else {
            continue;
        };
        if last_seen.as_ref() == Some(&current.id) {
            continue;
        }
        eprintln!(
            "[{}/{}] Syncing {}...",
            p.completed_repositories + 1,
            p.total_repositories,
            current.name
        );
        last_seen = Some(current.id);
    }
}

async fn handle_metrics(dw: &DoraDW, target: MetricsTarget) -> anyhow::Result<()> {
    match target {
        MetricsTarget::Repo {
            repo_id,
            range,
            json,
        } => {
            let m = dw.repository_metrics(&repo_id, parse_range(&range)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&m)?);
            } else {
                println!(
                    "Repository Metrics: {} ({})",
                    m.repo_name.as_deref().unwrap_or(&m.repo_id),
                    m.range
                );
                print_activity(&m.activity);
                print_delivery(&m.delivery);
            }
        }
        MetricsTarget::User { email, range, json } => {
            let m = dw.user_metrics(&email, parse_range(&range)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&m)?);
            } else {
                println!(
                    "User Metrics: {} ({})",
                    m.user_name.as_deref().unwrap_or(&m.user_email),
                    m.range
                );
                print_activity(&m.activity);
                println!("  Repositories:    {}", m.repositories_touched);
                println!("  Issues resolved: {}", m.issues_resolved);
                if let Some(avg) = m.avg_resolution_days {
                    println!("  Avg resolution:  {avg:.1} days");
                }
            }
        }
        MetricsTarget::Team {
            team_id,
            range,
            json,
        } => {
            let m = dw.team_metrics(&team_id, parse_range(&range)?).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&m)?);
            } else {
                println!(
                    "Team Metrics: {} ({})",
                    m.team_name.as_deref().unwrap_or(&m.team_id),
                    m.range
                );
                println!("  Members: {}", m.member_count);
                print_activity(&m.activity);
                print_delivery(&m.delivery);
                for r in &m.repositories {
                    println!("  {}: {} commits", r.repo_id, r.activity.commit_count);
                }
            }
        }
    }
    Ok(())
}

async fn handle_issues(dw: DoraDW, action: IssuesAction) -> anyhow::Result<()> {
    match action {
        IssuesAction::Stats {
            tracker,
            project_key,
            range,
            json,
        } => {
            let collector = dw.with_collectors(tracker.factory()).collector().await?;
            let (start, end) = parse_window(range.as_deref())?;
            let filter = IssueFilter {
                project_key,
                ..IssueFilter::default()
            }
            .between(start, end);
            let stats = collector.get_issue_stats(&filter).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_issue_stats(&stats);
            }
        }
        IssuesAction::Summary {
            tracker,
            range,
            json,
        } => {
            let collector = dw.with_collectors(tracker.factory()).collector().await?;
            let (start, end) = parse_window(range.as_deref())?;
            let summary = collector.get_project_summary(start, end).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Projects: {}", summary.total_projects);
                println!("Issues:   {} ({} completed)", summary.total_issues, summary.completed_issues);
                println!("Avg resolution: {:.1} days", summary.average_resolution_time_in_days);
                for p in &summary.projects {
                    println!();
                    println!("{} {}", p.key, p.name);
                    print_issue_stats(&p.stats);
                }
            }
        }
        IssuesAction::Projects { tracker } => {
            let collector = dw.with_collectors(tracker.factory()).collector().await?;
            for p in collector.get_projects().await? {
                println!("{} {}", p.key, p.name);
            }
        }
    }
    Ok(())
}

fn print_activity(a: &doradw::metrics::ActivityMetrics) {
    println!("  Activity:");
    println!("    Commits:     {}", a.commit_count);
    println!("    Authors:     {}", a.active_authors);
    println!("    Lines:       +{} -{}", a.additions, a.deletions);
    println!("    Active days: {}", a.active_days);
}

fn print_delivery(d: &doradw::metrics::DeliveryMetrics) {
    println!("  Delivery:");
    println!(
        "    Deployments:    {} ({:.2}/day)",
        d.deployment_count, d.deployments_per_day
    );
    println!(
        "    Change failure: {} ({:.1}%)",
        d.change_failure_count, d.change_failure_rate
    );
    match d.lead_time_days {
        Some(lt) => println!("    Lead time:      {lt:.1} days ({} issues)", d.lead_time_samples),
        None => println!("    Lead time:      no linked issues resolved"),
    }
    match d.mttr_days {
        Some(mttr) => println!("    MTTR:           {mttr:.1} days ({} incidents)", d.incidents_resolved),
        None => println!("    MTTR:           no incidents resolved"),
    }
}

fn print_issue_stats(s: &doradw::IssueStats) {
    println!("  Total:     {}", s.total_issues);
    println!("  Completed: {}", s.completed_issues);
    println!("  Avg resolution: {:.1} days", s.average_resolution_time_in_days);
    for (t, n) in &s.issues_by_type {
        println!("  {t}: {n}");
    }
}

fn print_sync_report(report: &doradw::SyncReport) {
    println!("Sync: {}", report.repo_id);
    println!("  Status:  {}", report.status.as_str());
    println!("  Commits: {}", report.commits_synced);
    println!("  Issues:  {}", report.issues_synced);
    if report.full_sync {
        println!("  Mode:    full");
    }
    if let Some(ref err) = report.error {
        println!("  Error:   {err}");
    }
}
