//! # Run State
//!
//! The durable record of one pipeline run: a status per stage and, inside
//! the research and review stages, a status per task. This record is the
//! sole source of truth for resumption.
//!
//! Transitions only move forward within an attempt
//! (`pending → in_progress → completed | failed | timeout`) and `completed`
//! is sticky. A failed or timed-out unit may start a new attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::swarm::pipeline::PipelineStage;
use crate::task::{PullRequest, ReviewItem, TaskDescriptor};

/// Status of a pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Status of a single task within a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
    /// The guarded call was abandoned at its deadline
    Timeout,
}

/// How a task attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Success, optionally carrying the pull request it produced
    Completed(Option<PullRequest>),
    Failed(String),
    TimedOut,
}

impl TaskOutcome {
    /// Status name the outcome is recorded under
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed(_) => TaskStatus::Completed,
            TaskOutcome::Failed(_) => TaskStatus::Failed,
            TaskOutcome::TimedOut => TaskStatus::Timeout,
        }
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
        }
    }
}

/// Per-task record inside a stage
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for TaskRecord {
    fn default() -> Self {
        Self {
            status: TaskStatus::Pending,
            pull_request: None,
            error: None,
            attempts: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Record for one stage
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StageRecord {
    pub status: StageStatus,
    /// Cached output, returned instead of re-running a completed stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<String, TaskRecord>,
}

/// Work that is still outstanding for a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResumePlan {
    /// Tasks that need a research call
    pub research: Vec<TaskDescriptor>,
    /// Tasks already researched whose pull request still needs review
    pub review: Vec<ReviewItem>,
}

/// The durable record of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunState {
    pub run_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub stages: BTreeMap<PipelineStage, StageRecord>,
}

impl RunState {
    /// Fresh state with every stage pending
    pub fn new(run_key: &str) -> Self {
        let now = Utc::now();
        let mut state = Self {
            run_key: run_key.to_string(),
            repo: None,
            created_at: now,
            updated_at: now,
            stages: BTreeMap::new(),
        };
        state.normalize();
        state
    }

    /// Make sure every stage has a record (older files may lack some)
    pub fn normalize(&mut self) {
        for stage in PipelineStage::all() {
            self.stages.entry(stage).or_default();
        }
    }

    pub fn stage(&self, stage: PipelineStage) -> Option<&StageRecord> {
        self.stages.get(&stage)
    }

    fn stage_mut(&mut self, stage: PipelineStage) -> &mut StageRecord {
        self.stages.entry(stage).or_default()
    }

    pub fn stage_status(&self, stage: PipelineStage) -> StageStatus {
        self.stage(stage).map(|s| s.status).unwrap_or_default()
    }

    pub fn task(&self, stage: PipelineStage, task_id: &str) -> Option<&TaskRecord> {
        self.stage(stage).and_then(|s| s.tasks.get(task_id))
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Mark a stage in progress. Returns false if it was already completed.
    pub fn begin_stage(&mut self, stage: PipelineStage) -> bool {
        let record = self.stage_mut(stage);
        if record.status == StageStatus::Completed {
            return false;
        }
        record.status = StageStatus::InProgress;
        record.error = None;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        self.touch();
        true
    }

    /// Mark a stage completed, caching its result
    pub fn complete_stage(&mut self, stage: PipelineStage, result: Option<serde_json::Value>) {
        let record = self.stage_mut(stage);
        record.status = StageStatus::Completed;
        if result.is_some() {
            record.result = result;
        }
        record.error = None;
        record.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Open a task-pool stage for this run's work
    ///
    /// Unlike [`Self::begin_stage`] this reopens a stage an earlier run
    /// completed, since a resumed run can add tasks to it.
    pub fn open_stage(&mut self, stage: PipelineStage) {
        let record = self.stage_mut(stage);
        record.status = StageStatus::InProgress;
        record.error = None;
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        self.touch();
    }

    /// Close a task-pool stage from its task records
    ///
    /// Completed iff every registered task completed, failed otherwise,
    /// whatever the stage said before.
    pub fn settle_stage(&mut self, stage: PipelineStage) -> StageStatus {
        let unfinished = self.unfinished_tasks(stage);
        let record = self.stage_mut(stage);
        if unfinished.is_empty() {
            record.status = StageStatus::Completed;
            record.error = None;
        } else {
            record.status = StageStatus::Failed;
            record.error = Some(format!("unfinished tasks: {}", unfinished.join(", ")));
        }
        record.finished_at = Some(Utc::now());
        let status = record.status;
        self.touch();
        status
    }

    /// Mark a stage failed. A completed stage stays completed.
    pub fn fail_stage(&mut self, stage: PipelineStage, error: &str) {
        let record = self.stage_mut(stage);
        if record.status == StageStatus::Completed {
            return;
        }
        record.status = StageStatus::Failed;
        record.error = Some(error.to_string());
        record.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Register tasks in a stage as pending without touching existing records
    pub fn register_tasks<'a>(
        &mut self,
        stage: PipelineStage,
        task_ids: impl IntoIterator<Item = &'a str>,
    ) {
        let record = self.stage_mut(stage);
        for id in task_ids {
            record.tasks.entry(id.to_string()).or_default();
        }
        self.touch();
    }

    /// Start a task attempt. Returns false if the task is already completed.
    pub fn begin_task(&mut self, stage: PipelineStage, task_id: &str) -> bool {
        let record = self.stage_mut(stage).tasks.entry(task_id.to_string()).or_default();
        if record.status == TaskStatus::Completed {
            return false;
        }
        record.status = TaskStatus::InProgress;
        record.attempts += 1;
        record.error = None;
        record.updated_at = Utc::now();
        self.touch();
        true
    }

    /// Record how a task attempt ended. Completed tasks are never downgraded.
    pub fn finish_task(&mut self, stage: PipelineStage, task_id: &str, outcome: TaskOutcome) {
        let record = self.stage_mut(stage).tasks.entry(task_id.to_string()).or_default();
        if record.status == TaskStatus::Completed {
            tracing::warn!(
                "Ignoring late outcome for completed task {} in {:?}",
                task_id,
                stage
            );
            return;
        }
        match outcome {
            TaskOutcome::Completed(pr) => {
                record.status = TaskStatus::Completed;
                if pr.is_some() {
                    record.pull_request = pr;
                }
                record.error = None;
            }
            TaskOutcome::Failed(error) => {
                record.status = TaskStatus::Failed;
                record.error = Some(error);
            }
            TaskOutcome::TimedOut => {
                record.status = TaskStatus::Timeout;
                record.error = Some("timed out".to_string());
            }
        }
        record.updated_at = Utc::now();
        self.touch();
    }

    /// Work still outstanding for these tasks
    ///
    /// A task whose research completed with a pull request goes straight to
    /// review using the stored handle. A task whose research completed
    /// without one needs nothing further.
    pub fn plan_resume(&self, tasks: &[TaskDescriptor]) -> ResumePlan {
        let mut plan = ResumePlan::default();
        for task in tasks {
            match self.task(PipelineStage::Research, &task.id) {
                Some(rec) if rec.status == TaskStatus::Completed => {
                    if let Some(pr) = rec.pull_request {
                        let reviewed = self
                            .task(PipelineStage::Review, &task.id)
                            .is_some_and(|r| r.status == TaskStatus::Completed);
                        if !reviewed {
                            plan.review.push(ReviewItem::for_task(task, pr));
                        }
                    }
                }
                _ => plan.research.push(task.clone()),
            }
        }
        plan
    }

    /// Task ids in a stage that did not complete
    pub fn unfinished_tasks(&self, stage: PipelineStage) -> Vec<String> {
        self.stage(stage)
            .map(|s| {
                s.tasks
                    .iter()
                    .filter(|(_, t)| t.status != TaskStatus::Completed)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Reset a stage and its tasks to pending
    pub fn reset_stage(&mut self, stage: PipelineStage) {
        self.stages.insert(stage, StageRecord::default());
        self.touch();
    }

    /// True if any stage ended failed
    pub fn any_failed(&self) -> bool {
        self.stages.values().any(|s| s.status == StageStatus::Failed)
    }

    /// True if every stage completed
    pub fn is_complete(&self) -> bool {
        PipelineStage::all()
            .into_iter()
            .all(|s| self.stage_status(s) == StageStatus::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> TaskDescriptor {
        TaskDescriptor {
            id: id.to_string(),
            topic: id.to_string(),
            prompt: String::new(),
            file_path: format!("docs/{}.md", id),
            websites: String::new(),
            key_index: 0,
        }
    }

    #[test]
    fn test_new_state_has_all_stages_pending() {
        let state = RunState::new("run-1");
        for stage in PipelineStage::all() {
            assert_eq!(state.stage_status(stage), StageStatus::Pending);
        }
        assert!(!state.is_complete());
    }

    #[test]
    fn test_completed_stage_is_sticky() {
        let mut state = RunState::new("run-1");
        assert!(state.begin_stage(PipelineStage::Orchestrator));
        state.complete_stage(PipelineStage::Orchestrator, Some(serde_json::json!([])));

        assert!(!state.begin_stage(PipelineStage::Orchestrator));
        state.fail_stage(PipelineStage::Orchestrator, "late failure");
        assert_eq!(
            state.stage_status(PipelineStage::Orchestrator),
            StageStatus::Completed
        );
    }

    #[test]
    fn test_settle_stage_reopens_completed_pool_stage() {
        let mut state = RunState::new("run-1");
        state.open_stage(PipelineStage::Review);
        assert_eq!(state.settle_stage(PipelineStage::Review), StageStatus::Completed);

        // a later run adds a review that fails
        state.open_stage(PipelineStage::Review);
        assert_eq!(state.stage_status(PipelineStage::Review), StageStatus::InProgress);
        state.finish_task(PipelineStage::Review, "slow", TaskOutcome::Failed("bail".into()));
        assert_eq!(state.settle_stage(PipelineStage::Review), StageStatus::Failed);
        assert!(state.any_failed());
        assert_eq!(
            state.stage(PipelineStage::Review).unwrap().error.as_deref(),
            Some("unfinished tasks: slow")
        );

        state.open_stage(PipelineStage::Review);
        state.finish_task(PipelineStage::Review, "slow", TaskOutcome::Completed(None));
        assert_eq!(state.settle_stage(PipelineStage::Review), StageStatus::Completed);
        assert!(!state.any_failed());
    }

    #[test]
    fn test_task_transitions() {
        let mut state = RunState::new("run-1");
        assert!(state.begin_task(PipelineStage::Research, "a"));
        state.finish_task(PipelineStage::Research, "a", TaskOutcome::TimedOut);
        assert_eq!(
            state.task(PipelineStage::Research, "a").unwrap().status,
            TaskStatus::Timeout
        );

        assert!(state.begin_task(PipelineStage::Research, "a"));
        state.finish_task(
            PipelineStage::Research,
            "a",
            TaskOutcome::Completed(Some(PullRequest(3))),
        );
        let rec = state.task(PipelineStage::Research, "a").unwrap();
        assert_eq!(rec.status, TaskStatus::Completed);
        assert_eq!(rec.pull_request, Some(PullRequest(3)));
        assert_eq!(rec.attempts, 2);

        assert!(!state.begin_task(PipelineStage::Research, "a"));
        state.finish_task(PipelineStage::Research, "a", TaskOutcome::Failed("x".into()));
        assert_eq!(
            state.task(PipelineStage::Research, "a").unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_plan_resume() {
        let mut state = RunState::new("run-1");
        // a: fully done
        state.finish_task(PipelineStage::Research, "a", TaskOutcome::Completed(Some(PullRequest(1))));
        state.finish_task(PipelineStage::Review, "a", TaskOutcome::Completed(None));
        // b: researched, review pending
        state.finish_task(PipelineStage::Research, "b", TaskOutcome::Completed(Some(PullRequest(7))));
        // c: research failed
        state.finish_task(PipelineStage::Research, "c", TaskOutcome::Failed("boom".into()));
        // d: researched, no PR produced
        state.finish_task(PipelineStage::Research, "d", TaskOutcome::Completed(None));

        let plan = state.plan_resume(&[task("a"), task("b"), task("c"), task("d"), task("e")]);
        let research: Vec<_> = plan.research.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(research, vec!["c", "e"]);
        assert_eq!(plan.review.len(), 1);
        assert_eq!(plan.review[0].task_id, "b");
        assert_eq!(plan.review[0].pull_request, PullRequest(7));
    }

    #[test]
    fn test_json_record_is_readable() {
        let mut state = RunState::new("run-1");
        state.finish_task(PipelineStage::Research, "a", TaskOutcome::Completed(Some(PullRequest(5))));
        let json = serde_json::to_value(&state).unwrap();

        assert_eq!(json["stages"]["research"]["tasks"]["a"]["status"], "completed");
        assert_eq!(json["stages"]["research"]["tasks"]["a"]["pull_request"], 5);
        assert_eq!(json["stages"]["orchestrator"]["status"], "pending");

        let back: RunState = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }
}
