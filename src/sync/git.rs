//! Reads commit history from a local clone through the `git` CLI.

use std::path::Path;

use chrono::{DateTime, Utc};
use tokio::process::Command;

use crate::date_util::parse_timestamp;
use crate::error::{Error, Result};

const RECORD_SEP: char = '\x1e';
const FIELD_SEP: char = '\x1f';
const LOG_FORMAT: &str = "--format=%x1e%H%x1f%an%x1f%ae%x1f%cI%x1f%P%x1f%s";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub sha: String,
    pub author_name: String,
    pub author_email: String,
    pub committed_at: DateTime<Utc>,
    /// Subject line only.
    pub message: String,
    pub additions: u64,
    pub deletions: u64,
    pub is_merge: bool,
}

/// Which slice of history to read.
#[derive(Debug, Clone, Default)]
pub struct LogRange<'a> {
    /// Branch or ref to walk; `HEAD` when unset.
    pub branch: Option<&'a str>,
    /// Only commits after this one (exclusive).
    pub since_sha: Option<&'a str>,
}

impl LogRange<'_> {
    fn revision(&self) -> String {
        let tip = self.branch.unwrap_or("HEAD");
        match self.since_sha {
            Some(since) => format!("{since}..{tip}"),
            None => tip.to_string(),
        }
    }
}

/// Newest-first commits in `range` for the repository at `path`.
pub async fn read_commits(path: &Path, range: &LogRange<'_>) -> Result<Vec<CommitRecord>> {
    if !path.exists() {
        return Err(Error::Git(format!("{} does not exist", path.display())));
    }
    let revision = range.revision();
    log::debug!("git log {revision} in {}", path.display());

    let output = Command::new("git")
        .arg("-C")
        .arg(path)
        .args(["log", "--no-color", "--numstat", LOG_FORMAT, &revision, "--"])
        .output()
        .await
        .map_err(|e| Error::Git(format!("failed to run git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // An empty repository has no HEAD yet; that is just an empty history.
        if stderr.contains("does not have any commits yet") {
            return Ok(Vec::new());
        }
        return Err(Error::Git(format!(
            "git log {revision} failed in {}: {}",
            path.display(),
            stderr.trim()
        )));
    }

    parse_log(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `git log --numstat` output produced with [`LOG_FORMAT`].
pub fn parse_log(raw: &str) -> Result<Vec<CommitRecord>> {
    let mut commits = Vec::new();
    for record in raw.split(RECORD_SEP) {
        let record = record.trim_matches('\n');
        if record.is_empty() {
            continue;
        }
        let mut lines = record.lines();
        let header = lines.next().unwrap_or_default();
        let fields: Vec<&str> = header.split(FIELD_SEP).collect();
        if fields.len() < 6 {
            return Err(Error::Git(format!("unexpected log header: {header}")));
        }
        let committed_at = parse_timestamp(fields[3])
            .ok_or_else(|| Error::Git(format!("bad commit date '{}'", fields[3])))?;

        let (mut additions, mut deletions) = (0u64, 0u64);
        for line in lines {
            let mut cols = line.split('\t');
            let (Some(add), Some(del)) = (cols.next(), cols.next()) else {
                continue;
            };
            // Binary files show "-" for both counts.
            additions += add.parse::<u64>().unwrap_or(0);
            deletions += del.parse::<u64>().unwrap_or(0);
        }

        commits.push(CommitRecord {
            sha: fields[0].to_string(),
            author_name: fields[1].to_string(),
            author_email: fields[2].to_string(),
            committed_at,
            is_merge: fields[4].split_whitespace().count() > 1,
            // A subject may itself contain the separator; keep the rest verbatim.
            message: fields[5..].join(&FIELD_SEP.to_string()),
            additions,
            deletions,
        });
    }
    Ok(commits)
}
