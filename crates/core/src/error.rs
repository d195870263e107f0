//! # Errors
//!
//! Typed failures that callers need to match on. Everything else in the
//! crate travels as `anyhow::Error` with context attached.

use thiserror::Error;

/// Apiary error type.
#[derive(Error, Debug)]
pub enum ApiaryError {
    /// One or more required environment variables are unset
    #[error("missing environment variables: {}", .0.join(", "))]
    MissingCredentials(Vec<String>),

    /// `--start-from` cannot be honoured with the recorded state
    #[error("cannot start from stage '{stage}': {reason}")]
    InvalidStartFrom { stage: String, reason: String },

    /// A guarded worker thread panicked before producing a result
    #[error("worker '{label}' panicked: {message}")]
    WorkerPanicked { label: String, message: String },

    /// A persisted run record could not be decoded
    #[error("run state for '{run_key}' is corrupted: {reason}")]
    StateCorrupted { run_key: String, reason: String },

    /// Sandbox provisioning or command execution failed
    #[error("sandbox error: {0}")]
    Sandbox(String),

    /// External HTTP API returned an error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for typed Apiary errors.
pub type Result<T> = std::result::Result<T, ApiaryError>;
