//! # Researcher Skill
//!
//! Researches one topic end to end: a hosted browser agent gathers sourced
//! material, then the coding agent folds it into the target file of the
//! knowledge base and the change goes up as a pull request.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{worker_secrets, Researcher, WORKER_SANDBOX_LIFETIME};
use crate::config::{Credentials, PipelineConfig};
use crate::task::{PullRequest, TaskDescriptor};
use crate::telemetry::Telemetry;
use crate::tools::agent::{read_model_id, run_agent};
use crate::tools::browser::BrowserAgent;
use crate::tools::github;
use crate::tools::sandbox::{LocalSandboxProvider, Sandbox, SandboxHandle, SandboxProvider, SandboxSpec};

/// Where browser results land inside the sandbox
pub const BROWSER_RESULT_DIR: &str = "browser_agent_output";

/// Prompt handed to the researcher agent
pub fn researcher_prompt(task: &TaskDescriptor) -> String {
    format!(
        "Topic: {}\n\
         Your task: {}\n\
         Target file: {}\n\
         Browser research output is at {dir}/research.md\n\
         Full browser results (with steps/URLs) are at {dir}/result.json if needed.\n\
         Follow the instructions in AGENTS.md.",
        task.topic,
        task.prompt,
        task.file_path,
        dir = BROWSER_RESULT_DIR
    )
}

/// Researcher backed by the browser agent and a sandboxed coding agent
pub struct ResearcherSkill {
    config: PipelineConfig,
    agent_dir: PathBuf,
    credentials: Credentials,
    telemetry: Telemetry,
    browser: BrowserAgent,
    provider: Arc<dyn SandboxProvider>,
}

impl ResearcherSkill {
    pub fn new(
        config: &PipelineConfig,
        agent_dir: &Path,
        credentials: Credentials,
        telemetry: Telemetry,
    ) -> Self {
        let browser = BrowserAgent::new(&credentials.browser_use_api_key);
        Self {
            config: config.clone(),
            agent_dir: agent_dir.join("researcher"),
            credentials,
            telemetry,
            browser,
            provider: Arc::new(LocalSandboxProvider),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.provider = provider;
        self
    }

    fn sandbox_spec(&self, task: &TaskDescriptor) -> SandboxSpec {
        SandboxSpec {
            name: format!("researcher-{}", task.id),
            agent_dir: self.agent_dir.clone(),
            secrets: worker_secrets(&self.credentials, task.key_index),
            lifetime: WORKER_SANDBOX_LIFETIME,
        }
    }
}

impl Researcher for ResearcherSkill {
    fn research(&self, repo: &str, task: &TaskDescriptor) -> Result<Option<PullRequest>> {
        let repo = self.config.full_repo(repo);
        let tag = format!("researcher:{}", task.id);

        tracing::info!("[{}] Running browser agent for {}", tag, task.websites);
        let website = Some(task.websites.as_str()).filter(|w| !w.trim().is_empty());
        let browser_result = self
            .browser
            .run(&task.prompt, website, &task.id, &self.telemetry)
            .context("Browser agent failed")?;
        tracing::info!(
            "[{}] Browser agent finished (status: {})",
            tag,
            browser_result["status"].as_str().unwrap_or("unknown")
        );

        let sandbox = SandboxHandle::provision(self.provider.as_ref(), self.sandbox_spec(task))
            .context("Failed to provision researcher sandbox")?;
        let sb: &dyn Sandbox = &*sandbox;

        github::clone_repo(sb, &repo)?;
        github::configure_identity(sb)?;

        sb.write_file(
            &format!("{}/result.json", BROWSER_RESULT_DIR),
            &serde_json::to_vec_pretty(&browser_result)?,
        )?;
        let output = browser_result["output"].as_str().unwrap_or_default();
        sb.write_file(&format!("{}/research.md", BROWSER_RESULT_DIR), output.as_bytes())?;

        let model = read_model_id(&self.agent_dir);
        let run = run_agent(
            sb,
            "researcher",
            &model,
            &researcher_prompt(task),
            &self.telemetry,
            &tag,
        )?;
        if !run.success() {
            tracing::warn!("[{}] Agent exited with {}", tag, run.exit_code);
        }

        let pr = github::commit_and_open_pr(sb, &task.id, &task.topic)?;
        match pr {
            Some(pr) => tracing::info!("[{}] Opened PR {}", tag, pr),
            None => tracing::warn!("[{}] No pull request was opened", tag),
        }
        Ok(pr)
    }
}
