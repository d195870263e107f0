//! # Research Tasks
//!
//! Task descriptors produced by the orchestrator and the review items that
//! flow from research into review.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

/// A research task as written by the orchestrator agent, before ids are assigned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResearchTaskDraft {
    /// Topic of the research task
    pub topic: String,
    /// Detailed instructions for the researcher
    pub prompt: String,
    /// Knowledge-base file the researcher edits
    pub file_path: String,
    /// Website the browser agent starts from
    #[serde(default)]
    pub websites: String,
}

/// One unit of research work. Read-only once assigned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Slug derived from the topic, unique within a run
    pub id: String,
    pub topic: String,
    pub prompt: String,
    pub file_path: String,
    pub websites: String,
    /// Which `GEMINI_API_KEY_<n>` the worker uses
    pub key_index: usize,
}

/// Pull request number on the knowledge-base repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PullRequest(pub u64);

impl fmt::Display for PullRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A task whose research produced a pull request awaiting review
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewItem {
    pub task_id: String,
    pub pull_request: PullRequest,
    pub file_path: String,
    pub key_index: usize,
}

impl ReviewItem {
    /// Build the review item for a researched task
    pub fn for_task(task: &TaskDescriptor, pull_request: PullRequest) -> Self {
        Self {
            task_id: task.id.clone(),
            pull_request,
            file_path: task.file_path.clone(),
            key_index: task.key_index,
        }
    }
}

fn non_alnum() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-z0-9]+").expect("static regex"))
}

/// Derive a task slug from its topic
///
/// Lowercases, collapses every run of non-alphanumerics into one `-` and
/// trims separators. An empty result becomes `unnamed`.
pub fn topic_slug(topic: &str) -> String {
    let lowered = topic.to_lowercase();
    let slug = non_alnum().replace_all(&lowered, "-");
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.to_string()
    }
}

/// Return `base` if free, otherwise the first free `base-N` for N >= 2
pub fn disambiguate(base: &str, taken: &HashSet<String>) -> String {
    if !taken.contains(base) {
        return base.to_string();
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Assign ids and key indices to orchestrator drafts, in order
pub fn assign_descriptors(drafts: Vec<ResearchTaskDraft>, key_count: usize) -> Vec<TaskDescriptor> {
    let key_count = key_count.max(1);
    let mut taken = HashSet::new();

    drafts
        .into_iter()
        .enumerate()
        .map(|(i, draft)| {
            let id = disambiguate(&topic_slug(&draft.topic), &taken);
            taken.insert(id.clone());
            TaskDescriptor {
                id,
                topic: draft.topic,
                prompt: draft.prompt,
                file_path: draft.file_path,
                websites: draft.websites,
                key_index: i % key_count,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(topic: &str, file: &str) -> ResearchTaskDraft {
        ResearchTaskDraft {
            topic: topic.to_string(),
            prompt: format!("Research {}", topic),
            file_path: file.to_string(),
            websites: "https://example.com".to_string(),
        }
    }

    #[test]
    fn test_topic_slug() {
        assert_eq!(topic_slug("Rust Async Runtimes"), "rust-async-runtimes");
        assert_eq!(topic_slug("  C++ / WebAssembly!! "), "c-webassembly");
        assert_eq!(topic_slug("Tokio_vs_async-std"), "tokio-vs-async-std");
        assert_eq!(topic_slug("???"), "unnamed");
    }

    #[test]
    fn test_collision_suffixes_are_deterministic() {
        let tasks = assign_descriptors(
            vec![
                draft("Caching", "docs/a.md"),
                draft("caching!", "docs/b.md"),
                draft("CACHING", "docs/c.md"),
            ],
            5,
        );
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["caching", "caching-2", "caching-3"]);
    }

    #[test]
    fn test_suffix_skips_natural_slugs_already_taken() {
        let tasks = assign_descriptors(
            vec![draft("foo", "a"), draft("foo 2", "b"), draft("foo", "c")],
            5,
        );
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["foo", "foo-2", "foo-3"]);
    }

    #[test]
    fn test_key_index_round_robin() {
        let drafts = (0..7).map(|i| draft(&format!("t{}", i), "f")).collect();
        let tasks = assign_descriptors(drafts, 5);
        let keys: Vec<_> = tasks.iter().map(|t| t.key_index).collect();
        assert_eq!(keys, vec![0, 1, 2, 3, 4, 0, 1]);
    }

    #[test]
    fn test_pull_request_serializes_as_number() {
        let json = serde_json::to_string(&PullRequest(42)).unwrap();
        assert_eq!(json, "42");
        assert_eq!(PullRequest(42).to_string(), "#42");
    }
}
