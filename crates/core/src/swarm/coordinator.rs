//! # Pipeline Coordinator
//!
//! Drives one run from project document to reviewed pull requests:
//! orchestrate once, then research and review concurrently, recording every
//! transition in the run ledger so an interrupted run picks up where it
//! stopped.
//!
//! ```text
//! Orchestrator ─► research queue ─► R researchers ─► review queue ─► V reviewers
//!                                                        ▲
//!                               stored PRs (resume) ─────┘
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

use super::events::PipelineEventKind;
use super::locks::FileLockRegistry;
use super::pipeline::{apply_start_from, PipelineStage};
use super::research::{run_research_pool, PoolReport, ResearchContext};
use super::review::{run_review_pool, ReviewContext};
use super::timeout::{run_with_timeout, Guarded};
use crate::config::{Credentials, PipelineConfig};
use crate::skills::{OrchestratorSkill, ResearcherSkill, ReviewerSkill, Workers};
use crate::state::ledger::RunLedger;
use crate::state::run_state::StageStatus;
use crate::state::store::StateStore;
use crate::task::{assign_descriptors, TaskDescriptor};
use crate::telemetry::Telemetry;

/// What to run
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Knowledge-base repository name (or `owner/name`)
    pub repo: String,
    /// Contents of the project/requirements document
    pub project_spec: String,
    /// Key the run state is stored under; defaults to `repo`
    pub run_key: Option<String>,
    /// Stage to restart from
    pub start_from: PipelineStage,
}

impl RunRequest {
    pub fn new(repo: &str, project_spec: &str) -> Self {
        Self {
            repo: repo.to_string(),
            project_spec: project_spec.to_string(),
            run_key: None,
            start_from: PipelineStage::Orchestrator,
        }
    }

    pub fn run_key(&self) -> &str {
        self.run_key.as_deref().unwrap_or(&self.repo)
    }
}

/// How a run ended
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_key: String,
    pub repo: String,
    /// False if any stage ended failed
    pub success: bool,
    pub tasks: usize,
    pub research: PoolReport,
    pub review: PoolReport,
    pub stages: BTreeMap<PipelineStage, StageStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_secs: f64,
}

/// The pipeline coordinator
pub struct Coordinator {
    config: PipelineConfig,
    workers: Workers,
    store: Arc<dyn StateStore>,
    telemetry: Telemetry,
    locks: FileLockRegistry,
}

impl Coordinator {
    /// Create a coordinator over injected workers and a state store
    pub fn new(config: PipelineConfig, workers: Workers, store: Arc<dyn StateStore>) -> Self {
        Self {
            telemetry: Telemetry::disabled("local"),
            config,
            workers,
            store,
            locks: FileLockRegistry::new(),
        }
    }

    /// Report lifecycle events through `telemetry`
    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Run (or resume) the pipeline
    ///
    /// Configuration problems (an impossible `--start-from`, an unreadable
    /// state record) are returned as errors before any worker is called.
    /// Worker failures end up in the summary instead.
    #[tracing::instrument(skip_all, fields(repo = %request.repo, run_key = %request.run_key()))]
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary> {
        let started = Instant::now();
        let run_key = request.run_key().to_string();

        let mut state = self
            .store
            .load(&run_key)
            .with_context(|| format!("Failed to load run state for '{}'", run_key))?;
        apply_start_from(&mut state, request.start_from)?;
        state.repo = Some(request.repo.clone());
        let ledger = RunLedger::new(self.store.clone(), state);
        ledger.update(|_| ())?;

        tracing::info!(
            "Starting pipeline for '{}' ({} researchers, {} reviewers, from {})",
            request.repo,
            self.config.research_workers,
            self.config.review_workers,
            request.start_from
        );
        self.telemetry.status("running");
        self.telemetry.event(
            PipelineEventKind::PipelineStarted,
            json!({
                "repo": request.repo,
                "run_key": run_key,
                "research_workers": self.config.research_workers,
                "review_workers": self.config.review_workers,
                "start_from": request.start_from,
            }),
        );

        let tasks = match self.orchestrate(&ledger, &request).await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Orchestrator failed: {:#}", e);
                let summary = self.summarize(
                    &ledger,
                    &request,
                    0,
                    PoolReport::default(),
                    PoolReport::default(),
                    Some(format!("{:#}", e)),
                    started,
                )?;
                self.finish(&summary);
                return Ok(summary);
            }
        };
        self.telemetry.event(
            PipelineEventKind::OrchestratorDone,
            json!({
                "tasks": tasks.len(),
                "topics": tasks.iter().map(|t| t.topic.as_str()).collect::<Vec<_>>(),
            }),
        );

        let task_ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        ledger.register_tasks(PipelineStage::Research, &task_ids)?;
        let plan = ledger.snapshot()?.plan_resume(&tasks);
        let seed_ids: Vec<String> = plan.review.iter().map(|i| i.task_id.clone()).collect();
        ledger.register_tasks(PipelineStage::Review, &seed_ids)?;
        tracing::info!(
            "{} tasks: {} to research, {} already researched awaiting review",
            tasks.len(),
            plan.research.len(),
            plan.review.len()
        );

        ledger.open_stage(PipelineStage::Research)?;
        ledger.open_stage(PipelineStage::Review)?;

        let (review_tx, review_rx) = mpsc::unbounded_channel();
        for item in plan.review {
            let _ = review_tx.send(item);
        }

        let review_ctx = ReviewContext {
            repo: request.repo.clone(),
            reviewer: self.workers.reviewer.clone(),
            ledger: ledger.clone(),
            telemetry: self.telemetry.clone(),
            locks: self.locks.clone(),
            timeout: self.config.task_timeout(),
            poll_interval: self.config.review_poll_interval(),
        };
        let review_pool = tokio::spawn(run_review_pool(
            review_ctx,
            self.config.review_workers,
            review_rx,
        ));

        let research_ctx = ResearchContext {
            repo: request.repo.clone(),
            researcher: self.workers.researcher.clone(),
            ledger: ledger.clone(),
            telemetry: self.telemetry.clone(),
            timeout: self.config.task_timeout(),
        };
        let research = run_research_pool(
            research_ctx,
            self.config.research_workers,
            plan.research,
            review_tx,
        )
        .await;
        let research_status = ledger.finalize_stage(PipelineStage::Research)?;
        tracing::info!("Research stage {:?}", research_status);

        let review = review_pool
            .await
            .context("Review pool task failed")?;
        let review_status = ledger.finalize_stage(PipelineStage::Review)?;
        tracing::info!("Review stage {:?}", review_status);

        let summary =
            self.summarize(&ledger, &request, tasks.len(), research, review, None, started)?;
        self.finish(&summary);
        Ok(summary)
    }

    /// Run the orchestrator once per run and assign task ids
    async fn orchestrate(
        &self,
        ledger: &RunLedger,
        request: &RunRequest,
    ) -> Result<Vec<TaskDescriptor>> {
        let orchestrator = self.workers.orchestrator.clone();
        let repo = request.repo.clone();
        let project_spec = request.project_spec.clone();
        let timeout = self.config.orchestrator_timeout();
        let key_count = self.config.api_key_count;

        ledger
            .track_stage(PipelineStage::Orchestrator, || async move {
                let guarded = run_with_timeout("orchestrator", timeout, move || {
                    orchestrator.orchestrate(&repo, &project_spec)
                })
                .await?;
                match guarded {
                    Guarded::Completed(drafts) => Ok(assign_descriptors(drafts, key_count)),
                    Guarded::TimedOut => {
                        anyhow::bail!("orchestrator timed out after {:?}", timeout)
                    }
                }
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn summarize(
        &self,
        ledger: &RunLedger,
        request: &RunRequest,
        tasks: usize,
        research: PoolReport,
        review: PoolReport,
        error: Option<String>,
        started: Instant,
    ) -> Result<RunSummary> {
        let state = ledger.snapshot()?;
        let stages = PipelineStage::all()
            .into_iter()
            .map(|s| (s, state.stage_status(s)))
            .collect();
        Ok(RunSummary {
            run_key: state.run_key.clone(),
            repo: request.repo.clone(),
            success: error.is_none() && !state.any_failed(),
            tasks,
            research,
            review,
            stages,
            error,
            duration_secs: started.elapsed().as_secs_f64(),
        })
    }

    fn finish(&self, summary: &RunSummary) {
        if summary.success {
            tracing::info!(
                "Pipeline for '{}' completed in {:.1}s",
                summary.repo,
                summary.duration_secs
            );
        } else {
            tracing::error!(
                "Pipeline for '{}' finished with failures ({:?})",
                summary.repo,
                summary.stages
            );
        }
        self.telemetry.event(
            PipelineEventKind::PipelineDone,
            json!({
                "success": summary.success,
                "tasks": summary.tasks,
                "research": summary.research,
                "review": summary.review,
                "error": summary.error,
            }),
        );
        self.telemetry
            .status(if summary.success { "completed" } else { "failed" });
    }
}

/// Run the pipeline with the sandboxed agent workers
///
/// Credentials are checked before anything else, so a missing variable
/// fails the run without touching the network.
pub async fn run_pipeline(
    config: PipelineConfig,
    store: Arc<dyn StateStore>,
    request: RunRequest,
    telemetry: Telemetry,
) -> Result<RunSummary> {
    let credentials = Credentials::from_env(&config)?;
    let agent_dir: &Path = &config.agent_dir;
    let workers = Workers::new(
        OrchestratorSkill::new(&config, agent_dir, credentials.clone(), telemetry.clone()),
        ResearcherSkill::new(&config, agent_dir, credentials.clone(), telemetry.clone()),
        ReviewerSkill::new(&config, agent_dir, credentials, telemetry.clone()),
    );
    Coordinator::new(config, workers, store)
        .with_telemetry(telemetry)
        .run(request)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::{Orchestrator, Researcher, Reviewer};
    use crate::state::store::JsonFileStore;
    use crate::task::{PullRequest, ResearchTaskDraft, ReviewItem};

    struct TwoTopics;

    impl Orchestrator for TwoTopics {
        fn orchestrate(&self, _repo: &str, _spec: &str) -> Result<Vec<ResearchTaskDraft>> {
            Ok(["Caching", "Queues"]
                .iter()
                .map(|t| ResearchTaskDraft {
                    topic: t.to_string(),
                    prompt: format!("Research {}", t),
                    file_path: format!("docs/{}.md", t.to_lowercase()),
                    websites: String::new(),
                })
                .collect())
        }
    }

    struct FailingOrchestrator;

    impl Orchestrator for FailingOrchestrator {
        fn orchestrate(&self, _repo: &str, _spec: &str) -> Result<Vec<ResearchTaskDraft>> {
            anyhow::bail!("sandbox quota exceeded")
        }
    }

    struct NumberedResearcher;

    impl Researcher for NumberedResearcher {
        fn research(&self, _repo: &str, task: &TaskDescriptor) -> Result<Option<PullRequest>> {
            Ok(Some(PullRequest(task.key_index as u64 + 1)))
        }
    }

    struct ApprovingReviewer;

    impl Reviewer for ApprovingReviewer {
        fn review(&self, _repo: &str, _item: &ReviewItem) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            review_poll_interval_ms: 20,
            ..PipelineConfig::default()
        }
    }

    #[tokio::test]
    async fn test_run_reports_lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let (telemetry, recorder) = Telemetry::recording("s1");
        let coordinator = Coordinator::new(
            test_config(),
            Workers::new(TwoTopics, NumberedResearcher, ApprovingReviewer),
            store,
        )
        .with_telemetry(telemetry);

        let summary = coordinator.run(RunRequest::new("kb", "# Project")).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.tasks, 2);
        assert_eq!(summary.review.completed, 2);

        let kinds = recorder.event_kinds();
        assert_eq!(kinds.first(), Some(&PipelineEventKind::PipelineStarted));
        assert_eq!(kinds.get(1), Some(&PipelineEventKind::OrchestratorDone));
        assert_eq!(kinds.last(), Some(&PipelineEventKind::PipelineDone));
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == PipelineEventKind::ReviewerDone)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_orchestrator_failure_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let coordinator = Coordinator::new(
            test_config(),
            Workers::new(FailingOrchestrator, NumberedResearcher, ApprovingReviewer),
            store.clone(),
        );

        let summary = coordinator.run(RunRequest::new("kb", "# Project")).await.unwrap();
        assert!(!summary.success);
        assert!(summary.error.unwrap().contains("quota"));
        assert_eq!(
            summary.stages[&PipelineStage::Orchestrator],
            StageStatus::Failed
        );
        assert_eq!(
            store.load("kb").unwrap().stage_status(PipelineStage::Research),
            StageStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_invalid_start_from_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let coordinator = Coordinator::new(
            test_config(),
            Workers::new(TwoTopics, NumberedResearcher, ApprovingReviewer),
            store,
        );

        let mut request = RunRequest::new("kb", "# Project");
        request.start_from = PipelineStage::Research;
        let err = coordinator.run(request).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::ApiaryError>(),
            Some(crate::error::ApiaryError::InvalidStartFrom { .. })
        ));
    }
}
