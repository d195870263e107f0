//! # Coding Agent Runner
//!
//! Runs the coding agent (`opencode run --format json`) inside a sandbox and
//! turns its JSONL event stream into `tracing` spans. Long lines may arrive
//! split across reads, so fragments are accumulated until they parse.
//!
//! Tracing is best effort: a line that never parses is logged and dropped,
//! and never fails the run.

use anyhow::Result;
use serde_json::Value;
use std::path::Path;
use tracing::field::Empty;
use tracing::Span;

use super::sandbox::{shell_quote, Sandbox};
use crate::telemetry::Telemetry;

/// Model id used when `opencode.json` does not name one
pub const UNKNOWN_MODEL: &str = "unknown";

/// Outcome of one agent invocation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRun {
    pub exit_code: i32,
    /// LLM steps that finished
    pub steps: usize,
    pub tool_calls: usize,
    /// Sum of the reported per-step cost
    pub cost: f64,
    /// Last text the agent emitted
    pub final_text: Option<String>,
}

impl AgentRun {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Read the model id from an agent directory's `opencode.json`
///
/// Looks at `agent.build.model`; anything missing or malformed yields
/// [`UNKNOWN_MODEL`].
pub fn read_model_id(agent_dir: &Path) -> String {
    std::fs::read_to_string(agent_dir.join("opencode.json"))
        .ok()
        .and_then(|content| serde_json::from_str::<Value>(&content).ok())
        .and_then(|config| {
            config
                .pointer("/agent/build/model")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| UNKNOWN_MODEL.to_string())
}

/// Reassembles JSON objects from a stream of possibly split lines
#[derive(Debug, Default)]
pub struct JsonlAccumulator {
    buf: String,
}

impl JsonlAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of output, returning every object completed by it
    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        let mut parsed = Vec::new();
        let chunk = chunk.replace('\r', "");
        for fragment in chunk.split('\n') {
            let fragment = fragment.trim();
            if fragment.is_empty() {
                continue;
            }
            self.buf.push_str(fragment);
            if let Ok(value) = serde_json::from_str::<Value>(&self.buf) {
                self.buf.clear();
                parsed.push(value);
            }
        }
        parsed
    }

    /// Whatever is left over once the stream has ended
    pub fn finish(self) -> Option<String> {
        let rest = self.buf.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }
}

/// Maps agent events onto spans under one `agent_run` span
struct EventTracer<'a> {
    root: Span,
    steps: Vec<Span>,
    telemetry: &'a Telemetry,
    tag: &'a str,
    run: AgentRun,
}

impl<'a> EventTracer<'a> {
    fn new(agent_name: &str, model: &str, telemetry: &'a Telemetry, tag: &'a str) -> Self {
        Self {
            root: tracing::info_span!("agent_run", agent = agent_name, model = model),
            steps: Vec::new(),
            telemetry,
            tag,
            run: AgentRun::default(),
        }
    }

    fn observe(&mut self, event: &Value) {
        let _root = self.root.enter();
        let part = event.get("part").cloned().unwrap_or(Value::Null);
        let u64_at = |ptr: &str| part.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);

        match event.get("type").and_then(Value::as_str) {
            Some("step_start") => {
                let span = tracing::info_span!(
                    parent: &self.root,
                    "llm_step",
                    input_tokens = Empty,
                    output_tokens = Empty,
                    reasoning_tokens = Empty,
                    cache_read = Empty,
                    cache_write = Empty,
                    cost = Empty,
                );
                self.steps.push(span);
            }
            Some("step_finish") => {
                let cost = part.get("cost").and_then(Value::as_f64).unwrap_or(0.0);
                if let Some(span) = self.steps.pop() {
                    span.record("input_tokens", u64_at("/tokens/input"));
                    span.record("output_tokens", u64_at("/tokens/output"));
                    span.record("reasoning_tokens", u64_at("/tokens/reasoning"));
                    span.record("cache_read", u64_at("/tokens/cache/read"));
                    span.record("cache_write", u64_at("/tokens/cache/write"));
                    span.record("cost", cost);
                    let _step = span.enter();
                    tracing::debug!("step finished");
                }
                self.run.steps += 1;
                self.run.cost += cost;
                self.telemetry.log(format!(
                    "[{}] step tokens={}/{} cost={:.4}",
                    self.tag,
                    u64_at("/tokens/input"),
                    u64_at("/tokens/output"),
                    cost
                ));
            }
            Some("tool_use") => {
                let tool = part.get("tool").and_then(Value::as_str).unwrap_or("unknown");
                self.run.tool_calls += 1;
                tracing::info!(tool, "[{}] tool", self.tag);
                self.telemetry.log(format!("[{}] tool {}", self.tag, tool));
            }
            Some("text") => {
                let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
                tracing::info!("[{}] {}", self.tag, preview(text, 200));
                self.telemetry
                    .log(format!("[{}] {}", self.tag, preview(text, 200)));
                self.run.final_text = Some(text.to_string());
            }
            Some("error") => {
                let error = event.get("error").cloned().unwrap_or(Value::Null);
                tracing::warn!("[{}] agent error: {}", self.tag, error);
                self.telemetry.log(format!("[{}] error {}", self.tag, error));
            }
            _ => {}
        }
    }

    fn finish(mut self, exit_code: i32) -> AgentRun {
        // Steps that never reported a finish close with the run
        self.steps.clear();
        self.run.exit_code = exit_code;
        self.run
    }
}

fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text.to_string(),
    }
}

/// Run the coding agent with `prompt` in the sandbox's working directory
pub fn run_agent(
    sandbox: &dyn Sandbox,
    agent_name: &str,
    model: &str,
    prompt: &str,
    telemetry: &Telemetry,
    tag: &str,
) -> Result<AgentRun> {
    tracing::info!("[{}] Running agent (model: {})", tag, model);
    let command = format!("opencode run --format json {}", shell_quote(prompt));

    let mut tracer = EventTracer::new(agent_name, model, telemetry, tag);
    let mut acc = JsonlAccumulator::new();
    let exit_code = sandbox.exec_streaming(&command, &mut |line| {
        for event in acc.push(line) {
            tracer.observe(&event);
        }
    })?;
    if let Some(rest) = acc.finish() {
        tracing::warn!("[{}] unparsed agent output: {}", tag, preview(&rest, 200));
    }

    let run = tracer.finish(exit_code);
    tracing::info!(
        "[{}] Agent exited with {} after {} steps ({} tool calls, cost {:.4})",
        tag,
        run.exit_code,
        run.steps,
        run.tool_calls,
        run.cost
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::sandbox::{LocalSandboxProvider, SandboxProvider, SandboxSpec};
    use std::time::Duration;

    #[test]
    fn test_accumulator_joins_split_lines() {
        let mut acc = JsonlAccumulator::new();
        assert!(acc.push(r#"{"type": "text","#).is_empty());
        let parsed = acc.push("\r\n \"part\": {\"text\": \"hi\"}}\n");
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["part"]["text"], "hi");
        assert!(acc.finish().is_none());
    }

    #[test]
    fn test_accumulator_reports_leftovers() {
        let mut acc = JsonlAccumulator::new();
        let parsed = acc.push("{\"type\":\"step_start\"}\n{\"type\":");
        assert_eq!(parsed.len(), 1);
        assert_eq!(acc.finish().as_deref(), Some("{\"type\":"));
    }

    #[test]
    fn test_read_model_id() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_model_id(dir.path()), UNKNOWN_MODEL);

        std::fs::write(
            dir.path().join("opencode.json"),
            r#"{"agent": {"build": {"model": "anthropic/claude-sonnet"}}}"#,
        )
        .unwrap();
        assert_eq!(read_model_id(dir.path()), "anthropic/claude-sonnet");
    }

    #[test]
    fn test_tracer_counts_steps_and_cost() {
        let telemetry = Telemetry::disabled("test");
        let mut tracer = EventTracer::new("researcher", "m", &telemetry, "t");
        let events = [
            r#"{"type":"step_start"}"#,
            r#"{"type":"tool_use","part":{"tool":"bash"}}"#,
            r#"{"type":"step_finish","part":{"tokens":{"input":10,"output":5,"cache":{"read":2}},"cost":0.5}}"#,
            r#"{"type":"step_start"}"#,
            r#"{"type":"text","part":{"text":"done"}}"#,
            r#"{"type":"step_finish","part":{"cost":0.25}}"#,
            r#"{"type":"mystery"}"#,
        ];
        for e in events {
            tracer.observe(&serde_json::from_str(e).unwrap());
        }
        let run = tracer.finish(0);
        assert_eq!(run.steps, 2);
        assert_eq!(run.tool_calls, 1);
        assert!((run.cost - 0.75).abs() < f64::EPSILON);
        assert_eq!(run.final_text.as_deref(), Some("done"));
        assert!(run.success());
    }

    #[test]
    fn test_run_agent_reads_stream_from_sandbox() {
        use std::os::unix::fs::PermissionsExt;

        let agent = tempfile::tempdir().unwrap();
        let bin = agent.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        // Stand-in for the agent binary: prints a fixed event stream
        let fake = bin.join("opencode");
        std::fs::write(
            &fake,
            "#!/bin/bash\necho '{\"type\":\"step_start\"}'\necho '{\"type\":\"step_finish\",\"part\":{\"cost\":1}}'\nexit 2\n",
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let path = format!("{}:{}", bin.display(), std::env::var("PATH").unwrap_or_default());
        let sb = LocalSandboxProvider
            .create(SandboxSpec {
                name: "agent-test".to_string(),
                agent_dir: agent.path().to_path_buf(),
                secrets: [("PATH".to_string(), path)].into(),
                lifetime: Duration::from_secs(30),
            })
            .unwrap();

        let telemetry = Telemetry::disabled("test");
        let run = run_agent(sb.as_ref(), "researcher", "m", "it's a test", &telemetry, "t").unwrap();
        assert_eq!(run.exit_code, 2);
        assert_eq!(run.steps, 1);
    }
}
