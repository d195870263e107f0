//! # Telemetry
//!
//! Fire-and-forget reporting to the frontend's ingest endpoint. One
//! [`Telemetry`] client is built per run and cloned into every component.
//!
//! Every call only enqueues onto a channel, so the pipeline never waits on
//! the network. A background task posts events and status changes as they
//! arrive and batches log lines once a second. Failures are logged and
//! dropped.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::swarm::events::{PipelineEvent, PipelineEventKind};

/// How often buffered log lines are posted
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

const POST_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

/// Something the client was asked to report, as seen by a recording sink
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryRecord {
    Event { kind: PipelineEventKind, data: Value },
    Log(String),
    Status(String),
}

enum Command {
    Event(PipelineEvent),
    Log(String),
    Status(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
enum Sink {
    Disabled,
    Remote(mpsc::UnboundedSender<Command>),
    Recording(Arc<Mutex<Vec<TelemetryRecord>>>),
}

/// Cloneable telemetry client
#[derive(Clone)]
pub struct Telemetry {
    session_id: Arc<str>,
    sink: Sink,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sink = match self.sink {
            Sink::Disabled => "disabled",
            Sink::Remote(_) => "remote",
            Sink::Recording(_) => "recording",
        };
        f.debug_struct("Telemetry")
            .field("session_id", &self.session_id)
            .field("sink", &sink)
            .finish()
    }
}

impl Telemetry {
    /// A client that drops everything
    pub fn disabled(session_id: &str) -> Self {
        Self {
            session_id: session_id.into(),
            sink: Sink::Disabled,
        }
    }

    /// Connect using `CONVEX_SITE_URL` and `APIARY_SECRET_KEY`
    pub fn from_env(session_id: &str) -> Self {
        Self::connect(
            session_id,
            std::env::var("CONVEX_SITE_URL").ok(),
            std::env::var("APIARY_SECRET_KEY").ok(),
        )
    }

    /// Start the background poster, or return a disabled client if the
    /// endpoint or secret is missing. Must be called inside a tokio runtime.
    pub fn connect(session_id: &str, site_url: Option<String>, secret: Option<String>) -> Self {
        let (site_url, secret) = match (
            site_url.filter(|s| !s.is_empty()),
            secret.filter(|s| !s.is_empty()),
        ) {
            (Some(url), Some(secret)) => (url, secret),
            _ => {
                tracing::warn!(
                    "CONVEX_SITE_URL or APIARY_SECRET_KEY not set, telemetry disabled"
                );
                return Self::disabled(session_id);
            }
        };

        let client = match reqwest::Client::builder().timeout(POST_TIMEOUT).build() {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!("Failed to build telemetry HTTP client: {}", e);
                return Self::disabled(session_id);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let poster = Poster {
            client,
            site_url: site_url.trim_end_matches('/').to_string(),
            secret,
            session_id: session_id.to_string(),
        };
        tokio::spawn(poster.run(rx));

        Self {
            session_id: session_id.into(),
            sink: Sink::Remote(tx),
        }
    }

    /// A client that keeps everything in memory, plus a handle to read it
    pub fn recording(session_id: &str) -> (Self, TelemetryRecorder) {
        let records = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                session_id: session_id.into(),
                sink: Sink::Recording(records.clone()),
            },
            TelemetryRecorder { records },
        )
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.sink, Sink::Disabled)
    }

    fn send(&self, command: Command) {
        match &self.sink {
            Sink::Disabled => {}
            Sink::Remote(tx) => {
                if tx.send(command).is_err() {
                    tracing::debug!("Telemetry poster has stopped, dropping message");
                }
            }
            Sink::Recording(records) => {
                let record = match command {
                    Command::Event(e) => TelemetryRecord::Event {
                        kind: e.kind,
                        data: e.data,
                    },
                    Command::Log(line) => TelemetryRecord::Log(line),
                    Command::Status(s) => TelemetryRecord::Status(s),
                    Command::Flush(ack) => {
                        let _ = ack.send(());
                        return;
                    }
                };
                records
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(record);
            }
        }
    }

    /// Report a lifecycle event
    pub fn event(&self, kind: PipelineEventKind, data: Value) {
        self.send(Command::Event(PipelineEvent::new(kind).with_data(data)));
    }

    /// Queue a log line for the next batch
    pub fn log(&self, line: impl Into<String>) {
        self.send(Command::Log(line.into()));
    }

    /// Report a session status change
    pub fn status(&self, status: &str) {
        self.send(Command::Status(status.to_string()));
    }

    /// Post whatever is still buffered and wait for it
    pub async fn shutdown(&self) {
        let Sink::Remote(tx) = &self.sink else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Command::Flush(ack_tx)).is_err() {
            return;
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, ack_rx).await.is_err() {
            tracing::warn!("Timed out flushing telemetry");
        }
    }
}

/// Read side of a recording client
#[derive(Clone)]
pub struct TelemetryRecorder {
    records: Arc<Mutex<Vec<TelemetryRecord>>>,
}

impl TelemetryRecorder {
    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Kinds of recorded events, in order
    pub fn event_kinds(&self) -> Vec<PipelineEventKind> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                TelemetryRecord::Event { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }
}

struct Poster {
    client: reqwest::Client,
    site_url: String,
    secret: String,
    session_id: String,
}

impl Poster {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut buffer: Vec<String> = Vec::new();
        let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Event(event)) => {
                        self.post("/ingest", json!({
                            "kind": "event",
                            "sessionId": self.session_id,
                            "type": event.kind.as_str(),
                            "data": event.data,
                        }))
                        .await;
                    }
                    Some(Command::Log(line)) => buffer.push(line),
                    Some(Command::Status(status)) => {
                        self.post("/updateStatus", json!({
                            "sessionId": self.session_id,
                            "status": status,
                        }))
                        .await;
                    }
                    Some(Command::Flush(ack)) => {
                        self.flush(&mut buffer).await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.flush(&mut buffer).await;
                        break;
                    }
                },
                _ = ticker.tick() => self.flush(&mut buffer).await,
            }
        }
    }

    async fn flush(&self, buffer: &mut Vec<String>) {
        if buffer.is_empty() {
            return;
        }
        let text = buffer.join("\n");
        buffer.clear();
        self.post("/ingest", json!({
            "kind": "log",
            "sessionId": self.session_id,
            "text": text,
        }))
        .await;
    }

    async fn post(&self, path: &str, mut body: Value) {
        body["secret"] = Value::String(self.secret.clone());
        let url = format!("{}{}", self.site_url, path);
        match self.client.post(&url).json(&body).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!("Telemetry post to {} returned {}", path, resp.status());
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Telemetry post to {} failed: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_config_disables() {
        let telemetry = Telemetry::connect("s1", None, Some("secret".into()));
        assert!(!telemetry.is_enabled());
        telemetry.event(PipelineEventKind::PipelineStarted, json!({}));
        telemetry.shutdown().await;
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let (telemetry, recorder) = Telemetry::recording("s1");
        telemetry.status("running");
        telemetry.event(PipelineEventKind::PipelineStarted, json!({"repo": "kb"}));
        telemetry.log("[researcher:caching] started");

        assert_eq!(
            recorder.records(),
            vec![
                TelemetryRecord::Status("running".into()),
                TelemetryRecord::Event {
                    kind: PipelineEventKind::PipelineStarted,
                    data: json!({"repo": "kb"}),
                },
                TelemetryRecord::Log("[researcher:caching] started".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unreachable_sink_never_fails() {
        // Nothing listens on port 9; posts fail and are only logged
        let telemetry = Telemetry::connect(
            "s1",
            Some("http://127.0.0.1:9".into()),
            Some("secret".into()),
        );
        assert!(telemetry.is_enabled());
        telemetry.event(PipelineEventKind::PipelineStarted, json!({}));
        telemetry.log("line");
        telemetry.shutdown().await;
    }
}
