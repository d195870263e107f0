//! # IO Utilities
//!
//! File system helpers for the `.apiary` runtime directory.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Get the runtime directory path (.apiary)
///
/// Holds run records, the optional config file and the SQLite database.
pub fn get_runtime_path() -> PathBuf {
    if let Ok(path) = std::env::var("APIARY_RUNTIME_PATH") {
        return PathBuf::from(path);
    }

    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".apiary")
}

/// Ensure a directory exists
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {:?}", path))
}

/// Replace `path` with `content` atomically
///
/// Writes a temp file in the same directory, syncs it, then renames it over
/// the target so readers never observe a half-written record.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {:?}", parent))?;
    tmp.write_all(content)
        .with_context(|| format!("Failed to write temp file for {:?}", path))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temp file for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Read a file, returning `None` if it does not exist
pub fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read file: {:?}", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_runtime_path() {
        if std::env::var("APIARY_RUNTIME_PATH").is_err() {
            assert!(get_runtime_path().ends_with(".apiary"));
        }
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(read_optional(&path).unwrap().as_deref(), Some("second"));
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_read_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("nope")).unwrap().is_none());
    }
}
