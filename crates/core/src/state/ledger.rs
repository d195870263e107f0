//! # Run Ledger
//!
//! Shared handle over the in-memory [`RunState`] and its durable store.
//! Every mutation goes through [`RunLedger::update`], which applies the
//! change and persists the whole record under one lock, so a crash loses
//! at most the unit of work that was in flight.

use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};

use super::run_state::{RunState, StageStatus, TaskOutcome};
use super::store::StateStore;
use crate::swarm::pipeline::PipelineStage;

/// Cloneable handle shared by the coordinator and every worker
#[derive(Clone)]
pub struct RunLedger {
    state: Arc<Mutex<RunState>>,
    store: Arc<dyn StateStore>,
}

impl RunLedger {
    /// Load (or create) the record for `run_key` from `store`
    pub fn open(store: Arc<dyn StateStore>, run_key: &str) -> Result<Self> {
        let state = store.load(run_key)?;
        Ok(Self::new(store, state))
    }

    /// Wrap an already loaded record
    pub fn new(store: Arc<dyn StateStore>, state: RunState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
            store,
        }
    }

    /// Copy of the current record
    pub fn snapshot(&self) -> Result<RunState> {
        let state = self
            .state
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        Ok(state.clone())
    }

    /// Apply `f` to the record and persist it
    ///
    /// A failed save is logged and the run carries on; the next successful
    /// save writes the full record again.
    pub fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> Result<R> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
        let out = f(&mut state);
        if let Err(e) = self.store.save(&state) {
            tracing::error!("Failed to persist run state '{}': {:#}", state.run_key, e);
        }
        Ok(out)
    }

    /// Run a stage at most once per run
    ///
    /// A completed stage returns its cached result without calling `work`.
    /// Otherwise the stage is marked in progress, `work` runs, and the
    /// outcome is recorded before returning.
    pub async fn track_stage<T, F, Fut>(&self, stage: PipelineStage, work: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cached = {
            let state = self.snapshot()?;
            match state.stage(stage) {
                Some(record) if record.status == StageStatus::Completed => {
                    Some(record.result.clone().unwrap_or(serde_json::Value::Null))
                }
                _ => None,
            }
        };
        if let Some(value) = cached {
            tracing::info!("Stage '{}' already completed, using cached result", stage);
            return Ok(serde_json::from_value(value)?);
        }

        self.update(|s| s.begin_stage(stage))?;
        match work().await {
            Ok(result) => {
                let value = serde_json::to_value(&result)?;
                self.update(|s| s.complete_stage(stage, Some(value)))?;
                Ok(result)
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.update(|s| s.fail_stage(stage, &message))?;
                Err(e)
            }
        }
    }

    /// Open a task-pool stage, reopening it if an earlier run completed it
    pub fn open_stage(&self, stage: PipelineStage) -> Result<()> {
        self.update(|s| s.open_stage(stage))
    }

    /// Close a task-pool stage: completed iff every registered task completed
    pub fn finalize_stage(&self, stage: PipelineStage) -> Result<StageStatus> {
        self.update(|s| s.settle_stage(stage))
    }

    /// Register tasks in a stage without touching existing records
    pub fn register_tasks(&self, stage: PipelineStage, task_ids: &[String]) -> Result<()> {
        self.update(|s| s.register_tasks(stage, task_ids.iter().map(String::as_str)))
    }

    /// Start a task attempt. Returns false if the task already completed.
    pub fn begin_task(&self, stage: PipelineStage, task_id: &str) -> Result<bool> {
        self.update(|s| s.begin_task(stage, task_id))
    }

    /// Record how a task attempt ended
    pub fn finish_task(
        &self,
        stage: PipelineStage,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> Result<()> {
        self.update(|s| s.finish_task(stage, task_id, outcome))
    }
}
