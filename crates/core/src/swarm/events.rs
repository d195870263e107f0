//! # Pipeline Events
//!
//! Lifecycle events emitted by the coordinator, schedulers and browser
//! agent. They travel to the telemetry sink as `{type, data}` pairs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of pipeline event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    /// Run started
    PipelineStarted,
    /// Orchestrator produced the task list
    OrchestratorDone,
    /// A research worker picked up a task
    ResearcherStarted,
    /// A research call ended (any outcome)
    ResearcherDone,
    /// A review worker picked up a pull request
    ReviewerStarted,
    /// A review call ended (any outcome)
    ReviewerDone,
    /// Run finished
    PipelineDone,
    // === Browser agent events ===
    /// Live view URL of a browser session
    BrowserUrl,
    /// Browser task reached a terminal state
    BrowserDone,
    /// Browser judge verdict available
    BrowserJudgeDone,
}

impl PipelineEventKind {
    /// Wire name used in the telemetry `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline_started",
            Self::OrchestratorDone => "orchestrator_done",
            Self::ResearcherStarted => "researcher_started",
            Self::ResearcherDone => "researcher_done",
            Self::ReviewerStarted => "reviewer_started",
            Self::ReviewerDone => "reviewer_done",
            Self::PipelineDone => "pipeline_done",
            Self::BrowserUrl => "browser_url",
            Self::BrowserDone => "browser_done",
            Self::BrowserJudgeDone => "browser_judge_done",
        }
    }
}

/// An event in the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique event ID
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    /// Associated data (JSON object)
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PipelineEvent {
    /// Create a new event with an empty data object
    pub fn new(kind: PipelineEventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            data: serde_json::json!({}),
        }
    }

    /// Add data to the event
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}
