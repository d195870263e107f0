//! # Reviewer Skill
//!
//! Reviews one research pull request with the coding agent. The agent
//! decides whether to merge, request changes or fix the PR itself; a
//! non-zero exit is a failed review.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{worker_secrets, Reviewer, WORKER_SANDBOX_LIFETIME};
use crate::config::{Credentials, PipelineConfig};
use crate::task::{PullRequest, ReviewItem};
use crate::telemetry::Telemetry;
use crate::tools::agent::{read_model_id, run_agent};
use crate::tools::github;
use crate::tools::sandbox::{LocalSandboxProvider, Sandbox, SandboxHandle, SandboxProvider, SandboxSpec};

pub fn reviewer_prompt(repo: &str, pr: PullRequest) -> String {
    format!(
        "Review PR {} on repo {}. Follow the instructions in AGENTS.md.",
        pr, repo
    )
}

/// Reviewer backed by a sandboxed coding agent
pub struct ReviewerSkill {
    config: PipelineConfig,
    agent_dir: PathBuf,
    credentials: Credentials,
    telemetry: Telemetry,
    provider: Arc<dyn SandboxProvider>,
}

impl ReviewerSkill {
    pub fn new(
        config: &PipelineConfig,
        agent_dir: &Path,
        credentials: Credentials,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            config: config.clone(),
            agent_dir: agent_dir.join("reviewer"),
            credentials,
            telemetry,
            provider: Arc::new(LocalSandboxProvider),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.provider = provider;
        self
    }
}

impl Reviewer for ReviewerSkill {
    fn review(&self, repo: &str, item: &ReviewItem) -> Result<()> {
        let repo = self.config.full_repo(repo);
        let tag = format!("reviewer:{}", item.task_id);

        let spec = SandboxSpec {
            name: format!("reviewer-{}", item.task_id),
            agent_dir: self.agent_dir.clone(),
            secrets: worker_secrets(&self.credentials, item.key_index),
            lifetime: WORKER_SANDBOX_LIFETIME,
        };
        let sandbox = SandboxHandle::provision(self.provider.as_ref(), spec)
            .context("Failed to provision reviewer sandbox")?;
        let sb: &dyn Sandbox = &*sandbox;

        github::clone_repo(sb, &repo)?;
        github::configure_identity(sb)?;

        let model = read_model_id(&self.agent_dir);
        tracing::info!("[{}] Reviewing PR {}", tag, item.pull_request);
        let run = run_agent(
            sb,
            "reviewer",
            &model,
            &reviewer_prompt(&repo, item.pull_request),
            &self.telemetry,
            &tag,
        )?;
        if !run.success() {
            anyhow::bail!(
                "reviewer agent exited with {} on PR {}",
                run.exit_code,
                item.pull_request
            );
        }
        Ok(())
    }
}
