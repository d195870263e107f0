//! # Runs API
//!
//! `POST /start` kicks off a pipeline run in the background and
//! `GET /runs/:run_id` reports its stored state.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use apiary_core::config::Credentials;
use apiary_core::swarm::{apply_start_from, run_pipeline, PipelineStage, RunRequest};
use apiary_core::telemetry::Telemetry;
use apiary_core::ApiaryError;

use super::AppState;

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Body of `POST /start`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub session_id: Option<String>,
    /// Existing run to resume or rewind; a fresh id is generated when absent
    pub run_id: Option<String>,
    pub repo: String,
    /// Contents of the project document
    pub project: String,
    pub research_workers: Option<usize>,
    pub review_workers: Option<usize>,
    pub start_from: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub run_id: String,
    pub status: String,
}

/// 12 hex chars, unique per request
fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let provided = headers.get("x-api-key").and_then(|v| v.to_str().ok());
    match (&state.secret, provided) {
        (Some(secret), Some(key)) if secret == key => Ok(()),
        _ => Err(api_error(StatusCode::UNAUTHORIZED, "Unauthorized")),
    }
}

/// Reject a `startFrom` the stored run cannot honour before anything is spawned
fn check_start_from(state: &AppState, run_id: &str, start_from: PipelineStage) -> Result<(), ApiError> {
    if start_from == PipelineStage::Orchestrator {
        return Ok(());
    }
    let mut run = state
        .store
        .load(run_id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)))?;
    apply_start_from(&mut run, start_from).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

pub async fn start_run(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartRequest>,
) -> Result<Json<StartResponse>, ApiError> {
    authorize(&state, &headers)?;

    let start_from = match req.start_from.as_deref() {
        Some(stage) => stage
            .parse::<PipelineStage>()
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?,
        None => PipelineStage::Orchestrator,
    };

    let mut config = state.config.clone();
    if let Some(n) = req.research_workers {
        config.research_workers = n;
    }
    if let Some(n) = req.review_workers {
        config.review_workers = n;
    }

    if let Err(e) = Credentials::from_lookup(&config, state.env) {
        let status = match e {
            ApiaryError::MissingCredentials(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return Err(api_error(status, e.to_string()));
    }

    let run_id = match req.run_id {
        Some(id) if !id.trim().is_empty() => id,
        _ => new_run_id(),
    };
    check_start_from(&state, &run_id, start_from)?;

    let session_id = req.session_id.unwrap_or_else(|| run_id.clone());
    let request = RunRequest {
        run_key: Some(run_id.clone()),
        start_from,
        ..RunRequest::new(&req.repo, &req.project)
    };
    let store = state.store.clone();

    tracing::info!("Starting run {} for {} (session {})", run_id, req.repo, session_id);
    tokio::spawn(async move {
        let telemetry = Telemetry::from_env(&session_id);
        match run_pipeline(config, store, request, telemetry.clone()).await {
            Ok(summary) if summary.success => {
                tracing::info!("Run {} finished", summary.run_key)
            }
            Ok(summary) => tracing::warn!(
                "Run {} ended unsuccessfully: {}",
                summary.run_key,
                summary.error.as_deref().unwrap_or("unfinished tasks")
            ),
            Err(e) => tracing::error!("Run failed to start: {:#}", e),
        }
        telemetry.shutdown().await;
    });

    Ok(Json(StartResponse {
        run_id,
        status: "started".to_string(),
    }))
}

pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let internal = |e: anyhow::Error| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e));

    if !state.store.exists(&run_id).map_err(internal)? {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No run '{}'", run_id),
        ));
    }
    let run = state.store.load(&run_id).map_err(internal)?;
    let body = serde_json::to_value(&run).map_err(|e| internal(e.into()))?;
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use apiary_core::config::PipelineConfig;
    use apiary_core::state::{JsonFileStore, RunState, StateStore, TaskOutcome};
    use apiary_core::task::PullRequest;
    use axum::http::HeaderValue;

    fn env_without_github_pat(name: &str) -> Option<String> {
        (name != "GITHUB_PAT").then(|| "value".to_string())
    }

    fn full_env(_name: &str) -> Option<String> {
        Some("value".to_string())
    }

    fn app_state(dir: &std::path::Path, secret: Option<&str>) -> Arc<AppState> {
        let mut state = AppState::new(
            PipelineConfig::default(),
            Arc::new(JsonFileStore::new(dir)),
            secret.map(str::to_string),
        );
        state.env = env_without_github_pat;
        Arc::new(state)
    }

    fn request() -> StartRequest {
        serde_json::from_value(json!({
            "sessionId": "s-1",
            "repo": "kb",
            "project": "# Project",
            "researchWorkers": 3,
            "startFrom": "research"
        }))
        .unwrap()
    }

    fn key_header(key: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(key).unwrap());
        headers
    }

    #[test]
    fn test_run_id_format() {
        let id = new_run_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_run_id());
    }

    #[test]
    fn test_start_request_camel_case() {
        let req = request();
        assert_eq!(req.session_id.as_deref(), Some("s-1"));
        assert_eq!(req.research_workers, Some(3));
        assert_eq!(req.review_workers, None);
        assert_eq!(req.start_from.as_deref(), Some("research"));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Some("secret"));

        let (status, _) = start_run(State(state.clone()), HeaderMap::new(), Json(request()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = start_run(State(state), key_header("wrong"), Json(request()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_start_rejects_everything_without_secret() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), None);
        let (status, _) = start_run(State(state), key_header(""), Json(request()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_start_reports_missing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Some("secret"));
        let (status, Json(body)) = start_run(State(state), key_header("secret"), Json(request()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("GITHUB_PAT"));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_stage() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Some("secret"));
        let mut req = request();
        req.start_from = Some("deploy".to_string());
        let (status, _) = start_run(State(state), key_header("secret"), Json(req))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_run() {
        let dir = tempfile::tempdir().unwrap();
        let state = app_state(dir.path(), Some("secret"));

        let (status, _) = get_run(State(state.clone()), Path("abc123".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.store.save(&RunState::new("abc123")).unwrap();
        let Json(body) = get_run(State(state), Path("abc123".to_string()))
            .await
            .unwrap();
        assert_eq!(body["run_key"], "abc123");
    }

    #[tokio::test]
    async fn test_start_from_needs_a_run_that_can_honour_it() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = AppState::new(
            PipelineConfig::default(),
            Arc::new(JsonFileStore::new(dir.path())),
            Some("secret".to_string()),
        );
        app.env = full_env;
        let state = Arc::new(app);

        // no runId: a fresh run has nothing to resume research from
        let (status, Json(body)) = start_run(State(state.clone()), key_header("secret"), Json(request()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("orchestrator"));

        // an unknown runId is just as fresh
        let mut req = request();
        req.run_id = Some("abc123".to_string());
        req.start_from = Some("review".to_string());
        let (status, _) = start_run(State(state.clone()), key_header("secret"), Json(req))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // a stored run with research records can restart its review
        let mut run = RunState::new("abc123");
        run.complete_stage(PipelineStage::Orchestrator, Some(json!([])));
        run.finish_task(
            PipelineStage::Research,
            "a",
            TaskOutcome::Completed(Some(PullRequest(4))),
        );
        state.store.save(&run).unwrap();
        assert!(check_start_from(&state, "abc123", PipelineStage::Review).is_ok());
        assert!(check_start_from(&state, "abc123", PipelineStage::Research).is_ok());
    }
}
