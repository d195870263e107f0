//! # SQLite Run Store
//!
//! Keeps run records in `<runtime dir>/apiary.db`, one row per run key with
//! the record stored as JSON so it stays human-inspectable through `sqlite3`.

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::run_state::RunState;
use super::store::{decode_state, StateStore};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// SQLite-backed [`StateStore`]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open apiary database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        tracing::debug!("Run database at schema version {}", SCHEMA_VERSION);
        Ok(())
    }

    /// Migration to version 1 - runs table
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                run_key TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
            [],
        )?;
        Ok(())
    }
}

impl StateStore for SqliteStore {
    fn load(&self, run_key: &str) -> Result<RunState> {
        let data: Option<String> = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            conn.query_row(
                "SELECT data FROM runs WHERE run_key = ?1",
                params![run_key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to load run '{}'", run_key))?
        };

        match data {
            Some(content) => decode_state(run_key, &content),
            None => Ok(RunState::new(run_key)),
        }
    }

    fn save(&self, state: &RunState) -> Result<()> {
        let data = serde_json::to_string(state).context("Failed to serialize run state")?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        conn.execute(
            r#"
            INSERT INTO runs (run_key, data, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(run_key) DO UPDATE SET
                data = ?2,
                updated_at = ?3
            "#,
            params![
                state.run_key,
                data,
                state.updated_at.to_rfc3339()
            ],
        )
        .with_context(|| format!("Failed to save run '{}'", state.run_key))?;

        Ok(())
    }

    fn list(&self) -> Result<Vec<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;

        let mut stmt = conn.prepare("SELECT run_key FROM runs ORDER BY run_key")?;
        let rows = stmt.query_map([], |row| row.get(0))?;

        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::run_state::TaskOutcome;
    use crate::swarm::pipeline::PipelineStage;
    use crate::task::PullRequest;

    #[test]
    fn test_open_creates_runs_table() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteStore::open_at(dir.path().join("apiary.db")).unwrap();
        let conn = db.conn.lock().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"runs".to_string()));
        assert!(tables.contains(&"schema_version".to_string()));
    }

    #[test]
    fn test_schema_version_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("apiary.db");

        // Open twice - should not fail on second open
        let db1 = SqliteStore::open_at(&path).unwrap();
        drop(db1);

        let db2 = SqliteStore::open_at(&path).unwrap();
        let conn = db2.conn.lock().unwrap();
        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();

        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_save_load_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteStore::open_at(dir.path().join("apiary.db")).unwrap();

        let fresh = db.load("run-a").unwrap();
        assert_eq!(fresh.run_key, "run-a");
        assert!(db.list().unwrap().is_empty());

        let mut state = RunState::new("run-a");
        state.repo = Some("kb".to_string());
        db.save(&state).unwrap();

        state.finish_task(
            PipelineStage::Research,
            "t1",
            TaskOutcome::Completed(Some(PullRequest(4))),
        );
        db.save(&state).unwrap();

        let loaded = db.load("run-a").unwrap();
        assert_eq!(loaded, state);
        assert_eq!(db.list().unwrap(), vec!["run-a".to_string()]);
        assert!(db.exists("run-a").unwrap());
    }
}
