//! # Swarm Orchestration
//!
//! Coordinates the worker pools for a pipeline run.
//!
//! ## Pipeline Flow
//!
//! ```text
//! Orchestrator → research queue → Researchers → review queue → Reviewers
//! ```

pub mod coordinator;
pub mod events;
pub mod locks;
pub mod pipeline;
pub mod research;
pub mod review;
pub mod timeout;

pub use coordinator::{run_pipeline, Coordinator, RunRequest, RunSummary};
pub use events::{PipelineEvent, PipelineEventKind};
pub use locks::{FileLease, FileLockRegistry};
pub use pipeline::{apply_start_from, PipelineStage};
pub use research::{run_research_pool, PoolReport, ResearchContext, ResearchJob};
pub use review::{run_review_pool, take_unlocked, ReviewContext};
pub use timeout::{run_with_timeout, Guarded};
