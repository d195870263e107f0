//! # Pipeline Stages
//!
//! Defines the stages of the research pipeline and the `--start-from`
//! resets that rewind a recorded run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ApiaryError;
use crate::state::run_state::{RunState, StageStatus};

/// Stage of the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    /// Orchestrator planning research topics
    Orchestrator,
    /// Researchers producing pull requests
    Research,
    /// Reviewers evaluating and merging pull requests
    Review,
}

impl PipelineStage {
    /// Every stage, in execution order
    pub fn all() -> [PipelineStage; 3] {
        [Self::Orchestrator, Self::Research, Self::Review]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Research => "research",
            Self::Review => "review",
        }
    }

    /// This stage and every stage after it
    pub fn and_later(self) -> impl Iterator<Item = PipelineStage> {
        Self::all().into_iter().filter(move |s| *s >= self)
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "orchestrator" => Ok(Self::Orchestrator),
            "research" => Ok(Self::Research),
            "review" => Ok(Self::Review),
            other => Err(format!(
                "unknown stage '{}' (expected orchestrator, research or review)",
                other
            )),
        }
    }
}

/// Rewind `state` so the run restarts at `start_from`
///
/// `orchestrator` resets nothing. `research` resets the research and review
/// stages and needs a completed orchestrator stage. `review` resets only the
/// review stage and needs recorded research tasks.
pub fn apply_start_from(state: &mut RunState, start_from: PipelineStage) -> Result<(), ApiaryError> {
    match start_from {
        PipelineStage::Orchestrator => return Ok(()),
        PipelineStage::Research => {
            if state.stage_status(PipelineStage::Orchestrator) != StageStatus::Completed {
                return Err(ApiaryError::InvalidStartFrom {
                    stage: start_from.to_string(),
                    reason: "the orchestrator stage has not completed for this run".to_string(),
                });
            }
        }
        PipelineStage::Review => {
            let has_research = state
                .stage(PipelineStage::Research)
                .is_some_and(|s| !s.tasks.is_empty());
            if !has_research {
                return Err(ApiaryError::InvalidStartFrom {
                    stage: start_from.to_string(),
                    reason: "no research tasks are recorded for this run".to_string(),
                });
            }
        }
    }

    for stage in start_from.and_later() {
        tracing::info!("Resetting stage '{}'", stage);
        state.reset_stage(stage);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run_state::TaskOutcome;
    use crate::task::PullRequest;

    fn completed_run() -> RunState {
        let mut state = RunState::new("run");
        state.complete_stage(PipelineStage::Orchestrator, Some(serde_json::json!([])));
        state.finish_task(
            PipelineStage::Research,
            "a",
            TaskOutcome::Completed(Some(PullRequest(1))),
        );
        state.complete_stage(PipelineStage::Research, None);
        state.finish_task(PipelineStage::Review, "a", TaskOutcome::Completed(None));
        state.complete_stage(PipelineStage::Review, None);
        state
    }

    #[test]
    fn test_stage_order() {
        let later: Vec<_> = PipelineStage::Research.and_later().collect();
        assert_eq!(later, vec![PipelineStage::Research, PipelineStage::Review]);
        assert_eq!("review".parse::<PipelineStage>().unwrap(), PipelineStage::Review);
        assert!("deploy".parse::<PipelineStage>().is_err());
    }

    #[test]
    fn test_start_from_orchestrator_resets_nothing() {
        let mut state = completed_run();
        apply_start_from(&mut state, PipelineStage::Orchestrator).unwrap();
        assert!(state.is_complete());
    }

    #[test]
    fn test_start_from_research_resets_later_stages() {
        let mut state = completed_run();
        apply_start_from(&mut state, PipelineStage::Research).unwrap();

        assert_eq!(
            state.stage_status(PipelineStage::Orchestrator),
            StageStatus::Completed
        );
        assert_eq!(state.stage_status(PipelineStage::Research), StageStatus::Pending);
        assert!(state.task(PipelineStage::Research, "a").is_none());
        assert!(state.task(PipelineStage::Review, "a").is_none());
    }

    #[test]
    fn test_start_from_review_keeps_research() {
        let mut state = completed_run();
        apply_start_from(&mut state, PipelineStage::Review).unwrap();

        assert_eq!(
            state.task(PipelineStage::Research, "a").unwrap().pull_request,
            Some(PullRequest(1))
        );
        assert_eq!(state.stage_status(PipelineStage::Review), StageStatus::Pending);
    }

    #[test]
    fn test_start_from_requires_prior_stages() {
        let mut fresh = RunState::new("run");
        assert!(matches!(
            apply_start_from(&mut fresh, PipelineStage::Research),
            Err(ApiaryError::InvalidStartFrom { .. })
        ));
        assert!(matches!(
            apply_start_from(&mut fresh, PipelineStage::Review),
            Err(ApiaryError::InvalidStartFrom { .. })
        ));
    }
}
