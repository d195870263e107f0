//! # State Stores
//!
//! Durable storage for [`RunState`] records, keyed by run key. The JSON
//! file store is the default; the SQLite store lives in [`super::db`].

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use super::io::{read_optional, write_atomic};
use super::run_state::RunState;
use crate::error::ApiaryError;

/// Durable storage for run records
pub trait StateStore: Send + Sync {
    /// Load the record for `run_key`, or a fresh one if none exists
    fn load(&self, run_key: &str) -> Result<RunState>;

    /// Atomically overwrite the stored record
    fn save(&self, state: &RunState) -> Result<()>;

    /// Keys of every stored run
    fn list(&self) -> Result<Vec<String>>;

    /// Whether a record exists for `run_key`
    fn exists(&self, run_key: &str) -> Result<bool> {
        Ok(self.list()?.iter().any(|k| k == run_key))
    }
}

/// Decode a stored record, filling in stages an older record may lack
pub(crate) fn decode_state(run_key: &str, content: &str) -> Result<RunState> {
    let mut state: RunState =
        serde_json::from_str(content).map_err(|e| ApiaryError::StateCorrupted {
            run_key: run_key.to_string(),
            reason: e.to_string(),
        })?;
    state.normalize();
    Ok(state)
}

/// File stem for a run key; percent-encoded so distinct keys never share a file
pub(crate) fn encode_key(run_key: &str) -> String {
    urlencoding::encode(run_key).into_owned()
}

/// Run key back from a file stem written by [`encode_key`]
pub(crate) fn decode_key(stem: &str) -> Option<String> {
    urlencoding::decode(stem).ok().map(|key| key.into_owned())
}

/// One pretty-printed JSON file per run at `<dir>/runs/<run_key>.json`
pub struct JsonFileStore {
    runs_dir: PathBuf,
}

impl JsonFileStore {
    /// Store rooted at `state_dir`
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        Self {
            runs_dir: state_dir.as_ref().join("runs"),
        }
    }

    /// Path of the record for a run key
    pub fn path_for(&self, run_key: &str) -> PathBuf {
        self.runs_dir.join(format!("{}.json", encode_key(run_key)))
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, run_key: &str) -> Result<RunState> {
        let path = self.path_for(run_key);
        match read_optional(&path)? {
            Some(content) => decode_state(run_key, &content),
            None => {
                tracing::debug!("No run state at {:?}, starting fresh", path);
                Ok(RunState::new(run_key))
            }
        }
    }

    fn save(&self, state: &RunState) -> Result<()> {
        let path = self.path_for(&state.run_key);
        let content =
            serde_json::to_string_pretty(state).context("Failed to serialize run state")?;
        write_atomic(&path, content.as_bytes())
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.runs_dir)
            .with_context(|| format!("Failed to list {:?}", self.runs_dir))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(key) = path.file_stem().and_then(|s| s.to_str()).and_then(decode_key) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, run_key: &str) -> Result<bool> {
        Ok(self.path_for(run_key).exists())
    }
}
