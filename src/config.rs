use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_TRACKER_URL: &str = "DORADW_TRACKER_URL";
pub const ENV_TRACKER_USER: &str = "DORADW_TRACKER_USER";
pub const ENV_TRACKER_TOKEN: &str = "DORADW_TRACKER_TOKEN";
pub const ENV_TRACKER_PROJECTS: &str = "DORADW_TRACKER_PROJECTS";

/// Connection settings for an issue-tracker adapter.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(alias = "base_url")]
    pub base_url: String,
    pub username: String,
    #[serde(alias = "api_token")]
    pub api_token: String,
    #[serde(default, alias = "project_keys")]
    pub project_keys: Vec<String>,
}

// The token never shows up in logs.
impl std::fmt::Debug for AdapterConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("api_token", &"<redacted>")
            .field("project_keys", &self.project_keys)
            .finish()
    }
}

impl AdapterConfig {
    /// Build a config from `DORADW_TRACKER_*` environment variables.
    pub fn load_from_env() -> Result<Self> {
        Self::load_from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`load_from_env`](Self::load_from_env) but with an injectable
    /// variable lookup, so callers (and tests) never touch process state.
    pub fn load_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::Config(format!("missing environment variable {key}")))
        };

        let config = Self {
            base_url: required(ENV_TRACKER_URL)?,
            username: required(ENV_TRACKER_USER)?,
            api_token: required(ENV_TRACKER_TOKEN)?,
            project_keys: lookup(ENV_TRACKER_PROJECTS)
                .map(|v| parse_project_keys(&v))
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file (`baseUrl`, `username`, `apiToken`, `projectKeys`).
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let mut config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config file {}: {e}", path.display())))?;
        config.project_keys = normalize_keys(config.project_keys);
        config.validate()?;
        Ok(config)
    }

    /// Reject empty required fields and URLs that are not absolute http(s).
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(Error::Config("baseUrl is required".into()));
        }
        if self.username.trim().is_empty() {
            return Err(Error::Config("username is required".into()));
        }
        if self.api_token.trim().is_empty() {
            return Err(Error::Config("apiToken is required".into()));
        }
        let parsed = url::Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("malformed baseUrl '{}': {e}", self.base_url)))?;
        match parsed.scheme() {
            "http" | "https" => Ok(()),
            other => Err(Error::Config(format!(
                "unsupported baseUrl scheme '{other}' (expected http or https)"
            ))),
        }
    }
}

fn parse_project_keys(raw: &str) -> Vec<String> {
    normalize_keys(raw.split(',').map(|s| s.to_string()).collect())
}

fn normalize_keys(keys: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for key in keys {
        let key = key.trim().to_uppercase();
        if !key.is_empty() && !out.contains(&key) {
            out.push(key);
        }
    }
    out
}

/// Knobs for the background job pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Maximum number of jobs running at once.
    pub workers: usize,
    /// Hard per-job timeout; the worker task is aborted when it elapses.
    pub job_timeout: Duration,
    /// Lifetime of a metric cache entry.
    pub cache_ttl: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            job_timeout: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(3600),
        }
    }
}
