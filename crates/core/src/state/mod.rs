//! # Run State Persistence
//!
//! The resumable record of each pipeline run and the stores that keep it.

pub mod db;
pub mod io;
pub mod ledger;
pub mod run_state;
pub mod store;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::config::StateBackend;

pub use db::SqliteStore;
pub use ledger::RunLedger;
pub use run_state::{
    ResumePlan, RunState, StageRecord, StageStatus, TaskOutcome, TaskRecord, TaskStatus,
};
pub use store::{JsonFileStore, StateStore};

/// Open the configured store rooted at `state_dir`
pub fn open_store(backend: StateBackend, state_dir: &Path) -> Result<Arc<dyn StateStore>> {
    match backend {
        StateBackend::Json => Ok(Arc::new(JsonFileStore::new(state_dir))),
        StateBackend::Sqlite => Ok(Arc::new(SqliteStore::open_at(
            state_dir.join("apiary.db"),
        )?)),
    }
}
