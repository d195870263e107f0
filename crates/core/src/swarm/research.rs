//! # Research Scheduler
//!
//! A fixed pool of research workers draining one shared job queue. The
//! queue is filled up front with every pending task followed by one `Stop`
//! per worker, so each worker exits after the real work runs out.
//!
//! A research call that produces a pull request is recorded first and then
//! handed to the review queue. When the last worker exits, its clone of the
//! review sender is dropped and reviewers see the queue close.

use serde::Serialize;
use serde_json::json;
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::pipeline::PipelineStage;
use super::timeout::{run_with_timeout, Guarded};
use crate::skills::Researcher;
use crate::state::ledger::RunLedger;
use crate::state::run_state::TaskOutcome;
use crate::swarm::events::PipelineEventKind;
use crate::task::{ReviewItem, TaskDescriptor};
use crate::telemetry::Telemetry;

/// One entry in the research queue
#[derive(Debug, Clone)]
pub enum ResearchJob {
    Run(TaskDescriptor),
    /// Tells exactly one worker to exit
    Stop,
}

/// Tally of how a pool's work ended
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Items skipped because their record was already completed
    pub skipped: usize,
}

impl PoolReport {
    pub(crate) fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Completed(_) => self.completed += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

impl AddAssign for PoolReport {
    fn add_assign(&mut self, other: Self) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.skipped += other.skipped;
    }
}

/// Everything a research worker needs
#[derive(Clone)]
pub struct ResearchContext {
    pub repo: String,
    pub researcher: Arc<dyn Researcher>,
    pub ledger: RunLedger,
    pub telemetry: Telemetry,
    pub timeout: Duration,
}

/// Run `jobs` across `workers` concurrent workers and wait for all of them
///
/// Every pull request produced is sent on `review_tx`. The sender is
/// consumed, so once this returns no research-side sender remains.
pub async fn run_research_pool(
    ctx: ResearchContext,
    workers: usize,
    jobs: Vec<TaskDescriptor>,
    review_tx: mpsc::UnboundedSender<ReviewItem>,
) -> PoolReport {
    let workers = workers.max(1);
    let (job_tx, job_rx) = mpsc::unbounded_channel();
    for task in jobs {
        let _ = job_tx.send(ResearchJob::Run(task));
    }
    for _ in 0..workers {
        let _ = job_tx.send(ResearchJob::Stop);
    }
    drop(job_tx);

    let queue = Arc::new(Mutex::new(job_rx));
    let handles: Vec<_> = (0..workers)
        .map(|n| {
            let ctx = ctx.clone();
            let queue = queue.clone();
            let review_tx = review_tx.clone();
            tokio::spawn(research_worker(n, ctx, queue, review_tx))
        })
        .collect();
    drop(review_tx);

    let mut report = PoolReport::default();
    for handle in handles {
        match handle.await {
            Ok(worker_report) => report += worker_report,
            Err(e) => tracing::error!("Research worker task failed: {}", e),
        }
    }
    tracing::info!(
        "Research pool finished: {} completed, {} failed, {} timed out",
        report.completed,
        report.failed,
        report.timed_out
    );
    report
}

async fn research_worker(
    n: usize,
    ctx: ResearchContext,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<ResearchJob>>>,
    review_tx: mpsc::UnboundedSender<ReviewItem>,
) -> PoolReport {
    let mut report = PoolReport::default();
    loop {
        let job = queue.lock().await.recv().await;
        match job {
            Some(ResearchJob::Run(task)) => research_one(n, &ctx, task, &review_tx, &mut report).await,
            Some(ResearchJob::Stop) | None => break,
        }
    }
    tracing::debug!("Research worker {} exiting", n);
    report
}

async fn research_one(
    n: usize,
    ctx: &ResearchContext,
    task: TaskDescriptor,
    review_tx: &mpsc::UnboundedSender<ReviewItem>,
    report: &mut PoolReport,
) {
    match ctx.ledger.begin_task(PipelineStage::Research, &task.id) {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!("Research for '{}' already completed, skipping", task.id);
            report.skipped += 1;
            return;
        }
        Err(e) => {
            tracing::error!("Failed to start research for '{}': {:#}", task.id, e);
            report.failed += 1;
            return;
        }
    }

    tracing::info!("[researcher-{}] Researching '{}' ({})", n, task.topic, task.file_path);
    ctx.telemetry
        .log(format!("[researcher:{}] started: {}", task.id, task.topic));
    ctx.telemetry.event(
        PipelineEventKind::ResearcherStarted,
        json!({
            "worker": n,
            "task": task.id,
            "topic": task.topic,
            "file_path": task.file_path,
        }),
    );

    let researcher = ctx.researcher.clone();
    let repo = ctx.repo.clone();
    let call_task = task.clone();
    let result = run_with_timeout(&format!("research-{}", task.id), ctx.timeout, move || {
        researcher.research(&repo, &call_task)
    })
    .await;

    let outcome = match result {
        Ok(Guarded::Completed(pr)) => TaskOutcome::Completed(pr),
        Ok(Guarded::TimedOut) => TaskOutcome::TimedOut,
        Err(e) => TaskOutcome::Failed(format!("{:#}", e)),
    };
    report.record(&outcome);

    let pull_request = match &outcome {
        TaskOutcome::Completed(pr) => *pr,
        _ => None,
    };
    let recorded = ctx.ledger.update(|s| {
        s.finish_task(PipelineStage::Research, &task.id, outcome.clone());
        if pull_request.is_some() {
            s.register_tasks(PipelineStage::Review, [task.id.as_str()]);
        }
    });
    if let Err(e) = recorded {
        tracing::error!("Failed to record research for '{}': {:#}", task.id, e);
    }

    let status = outcome.status().as_str();
    match &outcome {
        TaskOutcome::Failed(e) => tracing::warn!("Research for '{}' failed: {}", task.id, e),
        TaskOutcome::TimedOut => tracing::warn!("Research for '{}' timed out", task.id),
        TaskOutcome::Completed(_) => tracing::info!("Research for '{}' completed", task.id),
    }
    ctx.telemetry
        .log(format!("[researcher:{}] {}", task.id, status));
    ctx.telemetry.event(
        PipelineEventKind::ResearcherDone,
        json!({
            "worker": n,
            "task": task.id,
            "status": status,
            "pull_request": pull_request,
        }),
    );

    if let Some(pr) = pull_request {
        if review_tx.send(ReviewItem::for_task(&task, pr)).is_err() {
            tracing::warn!(
                "Review queue closed; PR {} for '{}' stays recorded for the next run",
                pr,
                task.id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run_state::{RunState, TaskStatus};
    use crate::state::store::JsonFileStore;
    use crate::task::PullRequest;

    struct ScriptedResearcher;

    impl Researcher for ScriptedResearcher {
        fn research(&self, _repo: &str, task: &TaskDescriptor) -> anyhow::Result<Option<PullRequest>> {
            match task.id.as_str() {
                "fails" => anyhow::bail!("browser agent crashed"),
                "empty" => Ok(None),
                "hangs" => {
                    std::thread::sleep(Duration::from_secs(30));
                    Ok(None)
                }
                _ => Ok(Some(PullRequest(task.key_index as u64 + 100))),
            }
        }
    }

    fn task(id: &str, key_index: usize) -> TaskDescriptor {
        TaskDescriptor {
            id: id.to_string(),
            topic: id.to_string(),
            prompt: String::new(),
            file_path: format!("docs/{}.md", id),
            websites: String::new(),
            key_index,
        }
    }

    #[tokio::test]
    async fn test_outcomes_are_recorded_and_prs_queued() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let ledger = RunLedger::new(store, RunState::new("run"));
        let ctx = ResearchContext {
            repo: "kb".to_string(),
            researcher: Arc::new(ScriptedResearcher),
            ledger: ledger.clone(),
            telemetry: Telemetry::disabled("test"),
            timeout: Duration::from_millis(200),
        };
        let (review_tx, mut review_rx) = mpsc::unbounded_channel();

        let jobs = vec![task("ok", 1), task("fails", 2), task("empty", 3), task("hangs", 4)];
        let report = run_research_pool(ctx, 2, jobs, review_tx).await;

        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.timed_out, 1);

        let item = review_rx.recv().await.unwrap();
        assert_eq!(item.task_id, "ok");
        assert_eq!(item.pull_request, PullRequest(101));
        // Every research sender is gone once the pool returns
        assert!(review_rx.recv().await.is_none());

        let state = ledger.snapshot().unwrap();
        let status = |id: &str| state.task(PipelineStage::Research, id).unwrap().status;
        assert_eq!(status("ok"), TaskStatus::Completed);
        assert_eq!(status("fails"), TaskStatus::Failed);
        assert_eq!(status("empty"), TaskStatus::Completed);
        assert_eq!(status("hangs"), TaskStatus::Timeout);
        assert!(state.task(PipelineStage::Review, "ok").is_some());
        assert!(state.task(PipelineStage::Review, "empty").is_none());
    }

    #[tokio::test]
    async fn test_more_workers_than_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(JsonFileStore::new(dir.path()));
        let ctx = ResearchContext {
            repo: "kb".to_string(),
            researcher: Arc::new(ScriptedResearcher),
            ledger: RunLedger::new(store, RunState::new("run")),
            telemetry: Telemetry::disabled("test"),
            timeout: Duration::from_secs(5),
        };
        let (review_tx, _review_rx) = mpsc::unbounded_channel();

        let report = run_research_pool(ctx, 5, vec![task("ok", 0)], review_tx).await;
        assert_eq!(report.completed, 1);
    }
}
