//! # File Lock Registry
//!
//! Keeps two reviewers off the same knowledge-base file. A path is in the
//! set iff some worker holds its [`FileLease`]; the lease removes it again
//! when dropped, whichever way the holder exits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Shared set of locked file paths
#[derive(Debug, Clone, Default)]
pub struct FileLockRegistry {
    held: Arc<Mutex<HashSet<String>>>,
}

impl FileLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Insert and remove are single operations, so a poisoned set is still whole.
    fn guard(&self) -> MutexGuard<'_, HashSet<String>> {
        self.held.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Lock `path` if nobody holds it
    ///
    /// Test and insert happen in one critical section.
    pub fn try_acquire(&self, path: &str) -> Option<FileLease> {
        let mut held = self.guard();
        if !held.insert(path.to_string()) {
            return None;
        }
        tracing::debug!("Locked {}", path);
        Some(FileLease {
            registry: self.clone(),
            path: path.to_string(),
        })
    }

    /// Unlock `path`. Releasing a path that is not held does nothing.
    pub fn release(&self, path: &str) {
        if self.guard().remove(path) {
            tracing::debug!("Released {}", path);
        }
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.guard().contains(path)
    }

    /// Currently locked paths, sorted
    pub fn held(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.guard().iter().cloned().collect();
        paths.sort();
        paths
    }
}

/// Exclusive hold on one file path, released on drop
#[derive(Debug)]
pub struct FileLease {
    registry: FileLockRegistry,
    path: String,
}

impl FileLease {
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_is_exclusive() {
        let locks = FileLockRegistry::new();
        let lease = locks.try_acquire("docs/a.md").unwrap();
        assert!(locks.try_acquire("docs/a.md").is_none());
        assert!(locks.try_acquire("docs/b.md").is_some());
        assert_eq!(lease.path(), "docs/a.md");
    }

    #[test]
    fn test_lease_releases_on_drop() {
        let locks = FileLockRegistry::new();
        {
            let _lease = locks.try_acquire("docs/a.md").unwrap();
            assert!(locks.is_locked("docs/a.md"));
        }
        assert!(!locks.is_locked("docs/a.md"));
        assert!(locks.try_acquire("docs/a.md").is_some());
    }

    #[test]
    fn test_release_is_idempotent() {
        let locks = FileLockRegistry::new();
        let lease = locks.try_acquire("docs/a.md").unwrap();
        locks.release("docs/a.md");
        locks.release("docs/a.md");
        drop(lease);
        assert!(locks.held().is_empty());
    }

    #[test]
    fn test_lease_released_when_holder_panics() {
        let locks = FileLockRegistry::new();
        let cloned = locks.clone();
        let result = std::thread::spawn(move || {
            let _lease = cloned.try_acquire("docs/a.md").unwrap();
            panic!("review blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!locks.is_locked("docs/a.md"));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let locks = FileLockRegistry::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    locks.try_acquire("docs/a.md").map(std::mem::forget).is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
