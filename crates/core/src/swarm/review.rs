//! # Review Scheduler
//!
//! A pool of review workers sharing the review queue. Before reviewing a
//! pull request a worker must hold the lease on its target file; an item
//! whose file is busy goes onto that worker's private deferred list, which
//! is retried before any fresh work is pulled.
//!
//! The queue closing (every research worker has exited) is the signal that
//! no more work is coming. A worker exits once the queue is closed and its
//! deferred list is empty.

use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::locks::{FileLease, FileLockRegistry};
use super::pipeline::PipelineStage;
use super::research::PoolReport;
use super::timeout::{run_with_timeout, Guarded};
use crate::skills::Reviewer;
use crate::state::ledger::RunLedger;
use crate::state::run_state::TaskOutcome;
use crate::swarm::events::PipelineEventKind;
use crate::task::ReviewItem;
use crate::telemetry::Telemetry;

/// Default wait on the review queue before rechecking deferred items
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Everything a review worker needs
#[derive(Clone)]
pub struct ReviewContext {
    pub repo: String,
    pub reviewer: Arc<dyn Reviewer>,
    pub ledger: RunLedger,
    pub telemetry: Telemetry,
    pub locks: FileLockRegistry,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Take the first deferred item whose file can be locked, with its lease
///
/// Items are scanned in arrival order; the lease is acquired as part of the
/// scan so nobody can grab the file in between.
pub fn take_unlocked(
    deferred: &mut VecDeque<ReviewItem>,
    locks: &FileLockRegistry,
) -> Option<(ReviewItem, FileLease)> {
    let position = deferred
        .iter()
        .enumerate()
        .find_map(|(i, item)| locks.try_acquire(&item.file_path).map(|lease| (i, lease)));
    let (i, lease) = position?;
    deferred.remove(i).map(|item| (item, lease))
}

/// Drain `queue` with `workers` concurrent reviewers and wait for all of them
pub async fn run_review_pool(
    ctx: ReviewContext,
    workers: usize,
    queue: mpsc::UnboundedReceiver<ReviewItem>,
) -> PoolReport {
    let workers = workers.max(1);
    let queue = Arc::new(Mutex::new(queue));
    let handles: Vec<_> = (0..workers)
        .map(|n| tokio::spawn(review_worker(n, ctx.clone(), queue.clone())))
        .collect();

    let mut report = PoolReport::default();
    for handle in handles {
        match handle.await {
            Ok(worker_report) => report += worker_report,
            Err(e) => tracing::error!("Review worker task failed: {}", e),
        }
    }
    tracing::info!(
        "Review pool finished: {} completed, {} failed, {} timed out",
        report.completed,
        report.failed,
        report.timed_out
    );
    report
}

async fn review_worker(
    n: usize,
    ctx: ReviewContext,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<ReviewItem>>>,
) -> PoolReport {
    let mut report = PoolReport::default();
    let mut deferred: VecDeque<ReviewItem> = VecDeque::new();

    loop {
        if let Some((item, lease)) = take_unlocked(&mut deferred, &ctx.locks) {
            review_one(n, &ctx, item, lease, &mut report).await;
            continue;
        }

        let pulled = {
            let mut rx = queue.lock().await;
            tokio::time::timeout(ctx.poll_interval, rx.recv()).await
        };

        match pulled {
            // Nothing arrived this interval; look at the deferred list again
            Err(_) => continue,
            Ok(None) => {
                if deferred.is_empty() {
                    break;
                }
                tokio::time::sleep(ctx.poll_interval).await;
            }
            Ok(Some(item)) => match ctx.locks.try_acquire(&item.file_path) {
                Some(lease) => review_one(n, &ctx, item, lease, &mut report).await,
                None => {
                    tracing::info!(
                        "[reviewer-{}] {} is busy, deferring PR {}",
                        n,
                        item.file_path,
                        item.pull_request
                    );
                    deferred.push_back(item);
                }
            },
        }
    }
    tracing::debug!("Review worker {} exiting", n);
    report
}

async fn review_one(
    n: usize,
    ctx: &ReviewContext,
    item: ReviewItem,
    lease: FileLease,
    report: &mut PoolReport,
) {
    match ctx.ledger.begin_task(PipelineStage::Review, &item.task_id) {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!("Review for '{}' already completed, skipping", item.task_id);
            report.skipped += 1;
            return;
        }
        Err(e) => {
            tracing::error!("Failed to start review for '{}': {:#}", item.task_id, e);
            report.failed += 1;
            return;
        }
    }

    tracing::info!(
        "[reviewer-{}] Reviewing PR {} for '{}' ({})",
        n,
        item.pull_request,
        item.task_id,
        lease.path()
    );
    ctx.telemetry.log(format!(
        "[reviewer:{}] reviewing PR {}",
        item.task_id, item.pull_request
    ));
    ctx.telemetry.event(
        PipelineEventKind::ReviewerStarted,
        json!({
            "worker": n,
            "task": item.task_id,
            "pull_request": item.pull_request,
            "file_path": item.file_path,
        }),
    );

    let reviewer = ctx.reviewer.clone();
    let repo = ctx.repo.clone();
    let call_item = item.clone();
    let result = run_with_timeout(&format!("review-{}", item.task_id), ctx.timeout, move || {
        reviewer.review(&repo, &call_item)
    })
    .await;

    let outcome = match result {
        Ok(Guarded::Completed(())) => TaskOutcome::Completed(None),
        Ok(Guarded::TimedOut) => TaskOutcome::TimedOut,
        Err(e) => TaskOutcome::Failed(format!("{:#}", e)),
    };
    report.record(&outcome);
    if let Err(e) = ctx
        .ledger
        .finish_task(PipelineStage::Review, &item.task_id, outcome.clone())
    {
        tracing::error!("Failed to record review for '{}': {:#}", item.task_id, e);
    }
    drop(lease);

    let status = outcome.status().as_str();
    match &outcome {
        TaskOutcome::Failed(e) => tracing::warn!("Review for '{}' failed: {}", item.task_id, e),
        TaskOutcome::TimedOut => tracing::warn!("Review for '{}' timed out", item.task_id),
        TaskOutcome::Completed(_) => tracing::info!("Review for '{}' completed", item.task_id),
    }
    ctx.telemetry
        .log(format!("[reviewer:{}] {}", item.task_id, status));
    ctx.telemetry.event(
        PipelineEventKind::ReviewerDone,
        json!({
            "worker": n,
            "task": item.task_id,
            "pull_request": item.pull_request,
            "status": status,
        }),
    );
}
