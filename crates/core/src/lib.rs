//! # Apiary Core
//!
//! The hive behind Apiary - scheduling, resumable run state and telemetry
//! for a research pipeline that turns a project document into a reviewed
//! knowledge base.
//!
//! ## Architecture
//!
//! - `swarm/` - Coordinator, research and review schedulers, timeout guard, file locks
//! - `state/` - Resumable run state and the stores that persist it
//! - `skills/` - Orchestrator, researcher and reviewer workers
//! - `tools/` - Sandboxes, coding agent runner, GitHub, browser and search clients
//! - `telemetry` - Remote event and log sink
//!
//! ## Usage
//!
//! ```rust,ignore
//! use apiary_core::config::PipelineConfig;
//! use apiary_core::state::open_store;
//! use apiary_core::swarm::{run_pipeline, RunRequest};
//! use apiary_core::telemetry::Telemetry;
//!
//! let config = PipelineConfig::load();
//! let store = open_store(config.state_backend, &state_dir)?;
//! let request = RunRequest::new("my-kb", &project_doc);
//! let summary = run_pipeline(config, store, request, Telemetry::from_env("session")).await?;
//! ```

pub mod config;
pub mod error;
pub mod skills;
pub mod state;
pub mod swarm;
pub mod task;
pub mod telemetry;
pub mod tools;

pub use error::ApiaryError;
