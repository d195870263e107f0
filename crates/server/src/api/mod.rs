//! # Trigger API
//!
//! HTTP surface for starting pipeline runs and reading their state.

mod runs;

use axum::{
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;

use apiary_core::config::PipelineConfig;
use apiary_core::state::StateStore;

/// Shared server state
pub struct AppState {
    pub config: PipelineConfig,
    pub store: Arc<dyn StateStore>,
    /// Expected `x-api-key` value; `None` rejects every trigger
    pub secret: Option<String>,
    /// Environment lookup used for the credential check
    pub env: fn(&str) -> Option<String>,
}

impl AppState {
    pub fn new(config: PipelineConfig, store: Arc<dyn StateStore>, secret: Option<String>) -> Self {
        Self {
            config,
            store,
            secret,
            env: process_env,
        }
    }
}

fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/start", post(runs::start_run))
        .route("/runs/:run_id", get(runs::get_run))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}
