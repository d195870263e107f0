//! # Research Task Files
//!
//! The orchestrator agent records each topic it wants researched as one
//! JSON file under `research_tasks/`. File names follow the task-id rule:
//! the topic slug, with `-2`, `-3`, ... appended on collision.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::state::io::{ensure_dir, write_atomic};
use crate::task::{disambiguate, topic_slug, ResearchTaskDraft};

/// Directory, relative to the orchestrator sandbox, the agent writes tasks to
pub const RESEARCH_TASKS_DIR: &str = "research_tasks";

fn existing_stems(dir: &Path) -> Result<HashSet<String>> {
    let mut stems = HashSet::new();
    if !dir.exists() {
        return Ok(stems);
    }
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                stems.insert(stem.to_string());
            }
        }
    }
    Ok(stems)
}

/// Save `draft` as `<dir>/<slug>.json` and return the path written
pub fn create_task(dir: &Path, draft: &ResearchTaskDraft) -> Result<PathBuf> {
    ensure_dir(dir)?;
    let name = disambiguate(&topic_slug(&draft.topic), &existing_stems(dir)?);
    let path = dir.join(format!("{}.json", name));
    write_atomic(&path, &serde_json::to_vec_pretty(draft)?)?;
    tracing::info!("Research task saved to {:?}", path);
    Ok(path)
}

/// Parse task files given as `(file name, content)` pairs, in file-name order
///
/// Files that are not valid drafts are skipped with a warning.
pub fn parse_task_files(mut files: Vec<(String, String)>) -> Vec<ResearchTaskDraft> {
    files.sort_by(|a, b| a.0.cmp(&b.0));
    files
        .into_iter()
        .filter(|(name, _)| name.ends_with(".json"))
        .filter_map(|(name, content)| match serde_json::from_str(&content) {
            Ok(draft) => Some(draft),
            Err(e) => {
                tracing::warn!("Skipping malformed research task {}: {}", name, e);
                None
            }
        })
        .collect()
}

/// Every task draft in `dir`, in file-name order
pub fn collect_tasks(dir: &Path) -> Result<Vec<ResearchTaskDraft>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to list {:?}", dir))? {
        let path = entry?.path();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let content =
            std::fs::read_to_string(&path).with_context(|| format!("Failed to read {:?}", path))?;
        files.push((name, content));
    }
    Ok(parse_task_files(files))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(topic: &str) -> ResearchTaskDraft {
        ResearchTaskDraft {
            topic: topic.to_string(),
            prompt: "p".to_string(),
            file_path: "docs/x.md".to_string(),
            websites: "https://example.com".to_string(),
        }
    }

    #[test]
    fn test_create_task_suffixes_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = dir.path().join(RESEARCH_TASKS_DIR);

        let first = create_task(&tasks, &draft("Edge Caching")).unwrap();
        let second = create_task(&tasks, &draft("edge caching!")).unwrap();
        let third = create_task(&tasks, &draft("EDGE CACHING")).unwrap();

        assert!(first.ends_with("edge-caching.json"));
        assert!(second.ends_with("edge-caching-2.json"));
        assert!(third.ends_with("edge-caching-3.json"));
    }

    #[test]
    fn test_collect_tasks_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        create_task(dir.path(), &draft("beta")).unwrap();
        create_task(dir.path(), &draft("alpha")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::write(dir.path().join("broken.json"), "{").unwrap();

        let topics: Vec<_> = collect_tasks(dir.path())
            .unwrap()
            .into_iter()
            .map(|d| d.topic)
            .collect();
        assert_eq!(topics, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_missing_websites_defaults_empty() {
        let drafts = parse_task_files(vec![(
            "a.json".to_string(),
            r#"{"topic":"a","prompt":"p","file_path":"f"}"#.to_string(),
        )]);
        assert_eq!(drafts[0].websites, "");
    }
}
