//! # Pipeline Configuration
//!
//! Tunables for a pipeline run plus the credentials the external workers
//! need. Configuration is layered: defaults, then `.apiary/config.json`,
//! then whatever the CLI passes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ApiaryError;
use crate::state::io::get_runtime_path;

/// Environment variables every run needs, besides the per-key Gemini keys
pub const REQUIRED_ENV_VARS: &[&str] = &[
    "GITHUB_PAT",
    "ANTHROPIC_API_KEY",
    "PARALLEL_API_KEY",
    "BROWSER_USE_API_KEY",
];

/// Which durable store backs the run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Json,
    Sqlite,
}

impl std::str::FromStr for StateBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown state backend '{}'", other)),
        }
    }
}

/// Configuration for a pipeline run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// GitHub account that owns knowledge-base repositories
    pub owner: String,
    /// Concurrent research workers
    pub research_workers: usize,
    /// Concurrent review workers
    pub review_workers: usize,
    /// Budget for a single research or review call
    pub task_timeout_secs: u64,
    /// Budget for the orchestrator call
    pub orchestrator_timeout_secs: u64,
    /// How long a review worker waits on the queue before rechecking
    pub review_poll_interval_ms: u64,
    /// Number of `GEMINI_API_KEY_<n>` keys tasks are spread across
    pub api_key_count: usize,
    /// Durable store for run state
    pub state_backend: StateBackend,
    /// Directory holding the `orchestrator/`, `researcher/` and `reviewer/` agent dirs
    pub agent_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            owner: "workerbee-gbt".to_string(),
            research_workers: 5,
            review_workers: 2,
            task_timeout_secs: 15 * 60,
            orchestrator_timeout_secs: 30 * 60,
            review_poll_interval_ms: 2000,
            api_key_count: 5,
            state_backend: StateBackend::Json,
            agent_dir: PathBuf::from("agents"),
        }
    }
}

impl PipelineConfig {
    /// Load defaults overlaid with `<runtime dir>/config.json` if present
    pub fn load() -> Self {
        Self::load_from(&get_runtime_path().join("config.json"))
    }

    /// Load from a specific file, falling back to defaults on any problem
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!("Ignoring malformed config {:?}: {}", path, e);
                Self::default()
            }),
            Err(e) => {
                tracing::warn!("Failed to read config {:?}: {}", path, e);
                Self::default()
            }
        }
    }

    /// Per-call timeout budget
    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Orchestrator call timeout budget
    pub fn orchestrator_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator_timeout_secs)
    }

    /// Review queue poll interval
    pub fn review_poll_interval(&self) -> Duration {
        Duration::from_millis(self.review_poll_interval_ms)
    }

    /// Fully qualified `owner/repo`
    pub fn full_repo(&self, repo: &str) -> String {
        if repo.contains('/') {
            repo.to_string()
        } else {
            format!("{}/{}", self.owner, repo)
        }
    }

    /// Every environment variable a run with this config requires
    pub fn required_env_vars(&self) -> Vec<String> {
        let mut vars: Vec<String> = (0..self.api_key_count.max(1))
            .map(gemini_key_var)
            .collect();
        vars.extend(REQUIRED_ENV_VARS.iter().map(|v| v.to_string()));
        vars
    }
}

/// Name of the Gemini key variable for a key index
pub fn gemini_key_var(index: usize) -> String {
    format!("GEMINI_API_KEY_{}", index)
}

/// Secrets handed to external workers
#[derive(Clone)]
pub struct Credentials {
    pub gemini_keys: Vec<String>,
    pub github_pat: String,
    pub anthropic_api_key: String,
    pub parallel_api_key: String,
    pub browser_use_api_key: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("gemini_keys", &self.gemini_keys.len())
            .finish_non_exhaustive()
    }
}

impl Credentials {
    /// Read credentials from the process environment
    pub fn from_env(config: &PipelineConfig) -> Result<Self, ApiaryError> {
        Self::from_lookup(config, |name| std::env::var(name).ok())
    }

    /// Read credentials through an arbitrary lookup, reporting every missing var at once
    pub fn from_lookup<F>(config: &PipelineConfig, lookup: F) -> Result<Self, ApiaryError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let missing: Vec<String> = config
            .required_env_vars()
            .into_iter()
            .filter(|name| get(name).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ApiaryError::MissingCredentials(missing));
        }

        let required = |name: &str| get(name).unwrap_or_default();
        Ok(Self {
            gemini_keys: (0..config.api_key_count.max(1))
                .map(|i| required(&gemini_key_var(i)))
                .collect(),
            github_pat: required("GITHUB_PAT"),
            anthropic_api_key: required("ANTHROPIC_API_KEY"),
            parallel_api_key: required("PARALLEL_API_KEY"),
            browser_use_api_key: required("BROWSER_USE_API_KEY"),
        })
    }

    /// Gemini key for a task's key index
    pub fn gemini_key(&self, key_index: usize) -> &str {
        let keys = &self.gemini_keys;
        keys.get(key_index % keys.len().max(1))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_pipeline_config_default() {
        let config = PipelineConfig::default();
        assert_eq!(config.research_workers, 5);
        assert_eq!(config.review_workers, 2);
        assert_eq!(config.task_timeout(), Duration::from_secs(900));
        assert_eq!(config.full_repo("kb"), "workerbee-gbt/kb");
        assert_eq!(config.full_repo("me/kb"), "me/kb");
    }

    #[test]
    fn test_missing_credentials_reported_together() {
        let config = PipelineConfig {
            api_key_count: 2,
            ..PipelineConfig::default()
        };
        let env: HashMap<&str, &str> =
            [("GEMINI_API_KEY_0", "g0"), ("ANTHROPIC_API_KEY", "a")].into();

        let err = Credentials::from_lookup(&config, |k| env.get(k).map(|v| v.to_string()))
            .unwrap_err();
        match err {
            ApiaryError::MissingCredentials(missing) => assert_eq!(
                missing,
                vec![
                    "GEMINI_API_KEY_1",
                    "GITHUB_PAT",
                    "PARALLEL_API_KEY",
                    "BROWSER_USE_API_KEY"
                ]
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_credentials_complete() {
        let config = PipelineConfig {
            api_key_count: 2,
            ..PipelineConfig::default()
        };
        let creds = Credentials::from_lookup(&config, |k| Some(format!("{}-value", k))).unwrap();
        assert_eq!(creds.gemini_key(1), "GEMINI_API_KEY_1-value");
        assert_eq!(creds.gemini_key(3), "GEMINI_API_KEY_1-value");
        assert_eq!(creds.github_pat, "GITHUB_PAT-value");
    }

    #[test]
    fn test_config_file_overlays_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"review_workers": 4, "state_backend": "sqlite"}"#).unwrap();

        let config = PipelineConfig::load_from(&path);
        assert_eq!(config.review_workers, 4);
        assert_eq!(config.state_backend, StateBackend::Sqlite);
        assert_eq!(config.research_workers, 5);
    }
}
