//! # Worker Tools
//!
//! The machinery the sandboxed skills are built from.
//!
//! ## Modules
//!
//! - `sandbox` - Isolated working directories with a lifetime
//! - `agent` - Coding agent runner and JSONL tracing
//! - `github` - Knowledge-base clone, commit and pull request commands
//! - `browser` - Hosted browser agent client
//! - `search` - Web search for the orchestrator
//! - `research_tasks` - Research task files written by the orchestrator

pub mod agent;
pub mod browser;
pub mod github;
pub mod research_tasks;
pub mod sandbox;
pub mod search;

pub use sandbox::{LocalSandboxProvider, Sandbox, SandboxHandle, SandboxProvider, SandboxSpec};
