//! # Orchestrator Skill
//!
//! Plans the research for a knowledge-base repository. Runs the coding
//! agent in a sandbox holding the project document and a checkout of the
//! repository; the agent lays out the knowledge base and records one
//! research task per topic with `apiary tool create-task`.
//!
//! ## Flow
//!
//! 1. Provision the sandbox, create or clone the repo
//! 2. Write `project.md`, run the agent
//! 3. Collect `research_tasks/*.json`
//! 4. Commit and push whatever the agent wrote to the repo

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{path_with_current_exe, Orchestrator, ORCHESTRATOR_SANDBOX_LIFETIME};
use crate::config::{Credentials, PipelineConfig};
use crate::task::ResearchTaskDraft;
use crate::telemetry::Telemetry;
use crate::tools::agent::{read_model_id, run_agent};
use crate::tools::github;
use crate::tools::research_tasks::{parse_task_files, RESEARCH_TASKS_DIR};
use crate::tools::sandbox::{LocalSandboxProvider, Sandbox, SandboxHandle, SandboxProvider, SandboxSpec};

/// File the project document is written to inside the sandbox
pub const PROJECT_FILE: &str = "project.md";
/// Scratch directory for search results, outside the repo checkout
pub const WEB_SEARCHES_DIR: &str = "web_searches";

/// Prompt handed to the orchestrator agent
pub fn orchestrator_prompt(repo: &str) -> String {
    format!(
        "The project document is at {}.\n\
         The knowledge base repository {} is checked out at {}/.\n\
         Save web search results under {}/.\n\
         Follow the instructions in AGENTS.md.",
        PROJECT_FILE,
        repo,
        github::KB_DIR,
        WEB_SEARCHES_DIR
    )
}

/// Orchestrator backed by a sandboxed coding agent
pub struct OrchestratorSkill {
    config: PipelineConfig,
    agent_dir: PathBuf,
    credentials: Credentials,
    telemetry: Telemetry,
    provider: Arc<dyn SandboxProvider>,
}

impl OrchestratorSkill {
    pub fn new(
        config: &PipelineConfig,
        agent_dir: &Path,
        credentials: Credentials,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            config: config.clone(),
            agent_dir: agent_dir.join("orchestrator"),
            credentials,
            telemetry,
            provider: Arc::new(LocalSandboxProvider),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn SandboxProvider>) -> Self {
        self.provider = provider;
        self
    }

    fn sandbox_spec(&self) -> SandboxSpec {
        let creds = &self.credentials;
        let mut secrets: std::collections::BTreeMap<String, String> = [
            ("ANTHROPIC_API_KEY", creds.anthropic_api_key.as_str()),
            ("GOOGLE_GENERATIVE_AI_API_KEY", creds.gemini_key(0)),
            ("GITHUB_PAT", creds.github_pat.as_str()),
            ("GH_TOKEN", creds.github_pat.as_str()),
            ("PARALLEL_API_KEY", creds.parallel_api_key.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        if let Some(path) = path_with_current_exe() {
            secrets.insert("PATH".to_string(), path);
        }
        SandboxSpec {
            name: "orchestrator".to_string(),
            agent_dir: self.agent_dir.clone(),
            secrets,
            lifetime: ORCHESTRATOR_SANDBOX_LIFETIME,
        }
    }

    fn collect_tasks(sandbox: &dyn Sandbox) -> Result<Vec<ResearchTaskDraft>> {
        let mut files = Vec::new();
        for name in sandbox.list_dir(RESEARCH_TASKS_DIR)? {
            let content = sandbox.read_file(&format!("{}/{}", RESEARCH_TASKS_DIR, name))?;
            files.push((name, content));
        }
        Ok(parse_task_files(files))
    }
}

impl Orchestrator for OrchestratorSkill {
    fn orchestrate(&self, repo: &str, project_spec: &str) -> Result<Vec<ResearchTaskDraft>> {
        let repo = self.config.full_repo(repo);
        let sandbox = SandboxHandle::provision(self.provider.as_ref(), self.sandbox_spec())
            .context("Failed to provision orchestrator sandbox")?;
        let sb: &dyn Sandbox = &*sandbox;

        github::ensure_repo(sb, &repo).context("Failed to create or clone knowledge base")?;
        github::configure_identity(sb)?;
        github::set_authenticated_remote(sb, &repo)?;
        sb.exec(&format!("mkdir -p {}", WEB_SEARCHES_DIR))?;
        sb.write_file(PROJECT_FILE, project_spec.as_bytes())?;

        let model = read_model_id(&self.agent_dir);
        let run = run_agent(
            sb,
            "orchestrator",
            &model,
            &orchestrator_prompt(&repo),
            &self.telemetry,
            "orchestrator",
        )?;

        let tasks = Self::collect_tasks(sb)?;
        tracing::info!("Collected {} research task(s)", tasks.len());
        self.telemetry
            .log(format!("[orchestrator] collected {} research task(s)", tasks.len()));

        if let Err(e) = github::commit_and_push(sb, "Agent run") {
            tracing::warn!("Failed to push orchestrator changes: {:#}", e);
        }

        if !run.success() {
            if tasks.is_empty() {
                anyhow::bail!("orchestrator agent exited with {} and created no tasks", run.exit_code);
            }
            tracing::warn!(
                "Orchestrator agent exited with {}; using the {} task(s) it created",
                run.exit_code,
                tasks.len()
            );
        }
        Ok(tasks)
    }
}
