//! # Web Search
//!
//! Objective-driven web search through the Parallel search API. The
//! orchestrator agent calls this (via `apiary tool search-web`) while
//! planning topics.

use serde_json::{json, Value};
use std::path::Path;

use crate::error::Result;
use crate::state::io::write_atomic;

pub const SEARCH_URL: &str = "https://api.parallel.ai/v1beta/search";
const BETA_HEADER: &str = "search-extract-2025-10-10";

/// Search the web for `objective` in agentic mode
pub fn search_web(api_key: &str, objective: &str) -> Result<Value> {
    search_web_at(SEARCH_URL, api_key, objective)
}

/// Same as [`search_web`] against another endpoint
pub fn search_web_at(url: &str, api_key: &str, objective: &str) -> Result<Value> {
    tracing::info!("Searching the web: {}", objective);
    let resp = reqwest::blocking::Client::new()
        .post(url)
        .header("x-api-key", api_key)
        .header("parallel-beta", BETA_HEADER)
        .json(&request_body(objective))
        .send()?
        .error_for_status()?;
    Ok(resp.json()?)
}

pub fn request_body(objective: &str) -> Value {
    json!({ "objective": objective, "mode": "agentic" })
}

/// Write search results as pretty JSON
pub fn write_results(path: &Path, results: &Value) -> anyhow::Result<()> {
    write_atomic(path, &serde_json::to_vec_pretty(results)?)
}
