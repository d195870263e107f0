//! # Browser Agent Client
//!
//! Drives a hosted browser-use agent (v2 API): open a session, start a task
//! with a citation instruction appended, then poll until it reaches a
//! terminal state. Live view URL, completion and judge verdict are reported
//! as telemetry events.
//!
//! Uses the blocking client, built per run; callers run it on a worker
//! thread, never on the async runtime.

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use crate::swarm::events::PipelineEventKind;
use crate::telemetry::Telemetry;

pub const BASE_URL: &str = "https://api.browser-use.com/api/v2";
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const TIMEOUT: Duration = Duration::from_secs(10 * 60);
const MAX_STEPS: u32 = 25;
const LLM: &str = "browser-use-2.0";

/// Appended to every task so the result carries its sources
pub const CITATION_PROMPT: &str = " IMPORTANT: For every piece of information you find, record the exact URL \
of the page where you found it. In your memory, always note [source: URL] \
next to each fact. In your final output, include a Citations section that \
maps each claim to its source URL.";

/// Client for the browser agent API
#[derive(Clone)]
pub struct BrowserAgent {
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl BrowserAgent {
    pub fn new(api_key: &str) -> Self {
        Self {
            base_url: BASE_URL.to_string(),
            api_key: api_key.to_string(),
            poll_interval: POLL_INTERVAL,
            timeout: TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.timeout = timeout;
        self
    }

    fn post(&self, http: &Client, path: &str, body: &Value) -> Result<Value> {
        let resp = http
            .post(format!("{}{}", self.base_url, path))
            .header("X-Browser-Use-API-Key", &self.api_key)
            .json(body)
            .send()
            .with_context(|| format!("Failed to POST {}", path))?
            .error_for_status()?;
        Ok(resp.json()?)
    }

    fn get(&self, http: &Client, path: &str) -> Result<Value> {
        let resp = http
            .get(format!("{}{}", self.base_url, path))
            .header("X-Browser-Use-API-Key", &self.api_key)
            .send()
            .with_context(|| format!("Failed to GET {}", path))?
            .error_for_status()?;
        Ok(resp.json()?)
    }

    /// Poll a task until it finishes, stops or runs out of time
    fn poll(&self, http: &Client, task_id: &str, tag: &str, telemetry: &Telemetry) -> Result<Value> {
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed > self.timeout {
                let msg = format!("[{}poll] timed out after {}s", tag, elapsed.as_secs());
                tracing::warn!("{}", msg);
                telemetry.log(msg);
                return Ok(timeout_result());
            }
            let task = self.get(http, &format!("/tasks/{}", task_id))?;
            let status = task.get("status").and_then(Value::as_str).unwrap_or_default();
            let steps = task
                .get("steps")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            let msg = format!(
                "[{}poll] status={} steps={} elapsed={}s",
                tag,
                status,
                steps,
                elapsed.as_secs()
            );
            tracing::info!("{}", msg);
            telemetry.log(msg);
            if is_terminal(status) {
                return Ok(task);
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Run one browser task to completion and return the cleaned result
    pub fn run(
        &self,
        task: &str,
        website: Option<&str>,
        label: &str,
        telemetry: &Telemetry,
    ) -> Result<Value> {
        let tag = if label.is_empty() {
            String::new()
        } else {
            format!("{}:", label)
        };

        let http = Client::new();
        let session = self.post(&http, "/sessions", &json!({ "keepAlive": false }))?;
        let session_id = session
            .get("id")
            .and_then(Value::as_str)
            .context("Browser session response has no id")?;
        telemetry.log(format!("[{}session] {}", tag, session_id));
        if let Some(live_url) = session.get("liveUrl").and_then(Value::as_str) {
            tracing::info!("[{}live] {}", tag, live_url);
            telemetry.log(format!("[{}live] {}", tag, live_url));
            telemetry.event(
                PipelineEventKind::BrowserUrl,
                json!({ "url": live_url, "agent": tag }),
            );
        }

        let created = self.post(&http, "/tasks", &task_payload(session_id, task, website))?;
        let task_id = created
            .get("id")
            .and_then(Value::as_str)
            .context("Browser task response has no id")?;
        telemetry.log(format!("[{}task] {}", tag, task_id));

        let mut result = self.poll(&http, task_id, &tag, telemetry)?;
        let status = result
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        telemetry.event(
            PipelineEventKind::BrowserDone,
            json!({ "agent": tag, "status": status }),
        );

        strip_result(&mut result);

        if let Some(output) = result.get("output").and_then(Value::as_str) {
            if !output.is_empty() {
                let preview: String = output.chars().take(300).collect();
                telemetry.log(format!("[{}output] {}", tag, preview));
            }
        }
        if let Some(verdict) = result.get("judgeVerdict").filter(|v| !v.is_null()) {
            telemetry.log(format!("[{}judge] {}", tag, verdict));
            telemetry.event(
                PipelineEventKind::BrowserJudgeDone,
                json!({ "agent": tag, "verdict": verdict }),
            );
        }
        Ok(result)
    }
}

fn is_terminal(status: &str) -> bool {
    matches!(status, "finished" | "stopped")
}

/// Result reported when polling gives up
pub fn timeout_result() -> Value {
    json!({ "status": "timeout", "output": "Browser agent timed out", "steps": [] })
}

/// Body for `POST /tasks`
pub fn task_payload(session_id: &str, task: &str, website: Option<&str>) -> Value {
    let mut payload = json!({
        "task": format!("{}{}", task, CITATION_PROMPT),
        "sessionId": session_id,
        "llm": LLM,
        "maxSteps": MAX_STEPS,
        "judge": true,
    });
    if let Some(url) = website.filter(|w| !w.trim().is_empty()) {
        payload["startUrl"] = json!(url);
    }
    payload
}

/// Drop the fields the coding agent has no use for
pub fn strip_result(result: &mut Value) {
    if let Some(obj) = result.as_object_mut() {
        for key in ["id", "sessionId", "llm"] {
            obj.remove(key);
        }
    }
    if let Some(steps) = result.get_mut("steps").and_then(Value::as_array_mut) {
        for step in steps.iter_mut().filter_map(Value::as_object_mut) {
            step.remove("evaluationPreviousGoal");
            step.remove("nextGoal");
        }
    }
}
