//! # Apiary Skills
//!
//! The three external worker capabilities the pipeline schedules, and the
//! sandboxed coding-agent implementations behind them.
//!
//! ## Architecture
//!
//! ```text
//! Coordinator
//!   └── Orchestrator / Researcher / Reviewer (traits)
//!         └── Skills (sandbox + coding agent + gh)
//! ```
//!
//! Every call is blocking and may run for many minutes; the schedulers run
//! each one on its own thread under a timeout.

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Credentials;
use crate::task::{PullRequest, ResearchTaskDraft, ReviewItem, TaskDescriptor};

pub mod orchestrator_skill;
pub mod researcher_skill;
pub mod reviewer_skill;

pub use orchestrator_skill::OrchestratorSkill;
pub use researcher_skill::ResearcherSkill;
pub use reviewer_skill::ReviewerSkill;

/// Plans the research topics for a knowledge-base repository
pub trait Orchestrator: Send + Sync {
    /// Returns one draft per topic, in the order they should be researched
    fn orchestrate(&self, repo: &str, project_spec: &str) -> Result<Vec<ResearchTaskDraft>>;
}

/// Researches one topic and opens a pull request with the result
pub trait Researcher: Send + Sync {
    /// `Ok(None)` means the task succeeded without producing a pull request
    fn research(&self, repo: &str, task: &TaskDescriptor) -> Result<Option<PullRequest>>;
}

/// Reviews and merges one pull request
pub trait Reviewer: Send + Sync {
    fn review(&self, repo: &str, item: &ReviewItem) -> Result<()>;
}

/// The worker implementations a run uses
#[derive(Clone)]
pub struct Workers {
    pub orchestrator: Arc<dyn Orchestrator>,
    pub researcher: Arc<dyn Researcher>,
    pub reviewer: Arc<dyn Reviewer>,
}

impl Workers {
    pub fn new(
        orchestrator: impl Orchestrator + 'static,
        researcher: impl Researcher + 'static,
        reviewer: impl Reviewer + 'static,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            researcher: Arc::new(researcher),
            reviewer: Arc::new(reviewer),
        }
    }
}

/// Sandbox lifetime for the orchestrator agent
pub const ORCHESTRATOR_SANDBOX_LIFETIME: Duration = Duration::from_secs(10 * 60);
/// Sandbox lifetime for researcher and reviewer agents
pub const WORKER_SANDBOX_LIFETIME: Duration = Duration::from_secs(20 * 60);

/// Secrets a researcher or reviewer sandbox gets
pub(crate) fn worker_secrets(credentials: &Credentials, key_index: usize) -> BTreeMap<String, String> {
    [
        (
            "GOOGLE_GENERATIVE_AI_API_KEY",
            credentials.gemini_key(key_index),
        ),
        ("GITHUB_PAT", credentials.github_pat.as_str()),
        ("GH_TOKEN", credentials.github_pat.as_str()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// `PATH` with the directory of the running binary first
///
/// Lets agents call `apiary tool ...` from inside their sandbox.
pub(crate) fn path_with_current_exe() -> Option<String> {
    let exe_dir: PathBuf = std::env::current_exe().ok()?.parent()?.to_path_buf();
    let path = std::env::var("PATH").unwrap_or_default();
    Some(format!("{}:{}", exe_dir.display(), path))
}
