//! Registry of tracked repositories, keyed by canonical root.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::tracker::{RepositoryChangeEvent, RepositoryTracker};
use crate::errors::ReadError;

/// Owns one [`RepositoryTracker`] per repository root.
#[derive(Debug, Default)]
pub struct RepositoryManager {
    trackers: Mutex<HashMap<PathBuf, Arc<RepositoryTracker>>>,
}

impl RepositoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `root`, or return the existing tracker for it.
    pub fn track(&self, root: impl AsRef<Path>) -> Result<Arc<RepositoryTracker>, ReadError> {
        let key = canonical(root.as_ref());
        let mut trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = trackers.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let tracker = Arc::new(RepositoryTracker::open(&key)?);
        info!(root = %key.display(), "repository registered");
        trackers.insert(key, Arc::clone(&tracker));
        Ok(tracker)
    }

    /// Stop tracking `root`. Returns the tracker if it was registered.
    pub fn untrack(&self, root: impl AsRef<Path>) -> Option<Arc<RepositoryTracker>> {
        let key = canonical(root.as_ref());
        self.trackers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&key)
    }

    pub fn get(&self, root: impl AsRef<Path>) -> Option<Arc<RepositoryTracker>> {
        let key = canonical(root.as_ref());
        self.trackers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key)
            .cloned()
    }

    /// The tracker of the deepest registered root containing `path`.
    pub fn repository_for_path(&self, path: impl AsRef<Path>) -> Option<Arc<RepositoryTracker>> {
        let path = canonical(path.as_ref());
        let trackers = self.trackers.lock().unwrap_or_else(|p| p.into_inner());
        trackers
            .iter()
            .filter(|(root, _)| path.starts_with(root))
            .max_by_key(|(root, _)| root.components().count())
            .map(|(_, tracker)| Arc::clone(tracker))
    }

    /// All registered roots, sorted.
    pub fn roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self
            .trackers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect();
        roots.sort();
        roots
    }

    /// Update every tracked repository, returning the events published.
    pub fn update_all(&self) -> Vec<RepositoryChangeEvent> {
        // Snapshot the list so updates do not hold the registry lock.
        let trackers: Vec<Arc<RepositoryTracker>> = self
            .trackers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let events: Vec<RepositoryChangeEvent> =
            trackers.iter().filter_map(|t| t.update()).collect();
        debug!(repositories = trackers.len(), events = events.len(), "updated all");
        events
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;

    #[test]
    fn test_track_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let manager = RepositoryManager::new();
        let a = manager.track(dir.path()).unwrap();
        let b = manager.track(dir.path()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.roots().len(), 1);
    }

    #[test]
    fn test_repository_for_path_picks_deepest_root() {
        let outer = tempfile::tempdir().unwrap();
        Repository::init(outer.path()).unwrap();
        let inner_path = outer.path().join("vendor/lib");
        std::fs::create_dir_all(&inner_path).unwrap();
        Repository::init(&inner_path).unwrap();
        std::fs::write(inner_path.join("file.txt"), "x").unwrap();

        let manager = RepositoryManager::new();
        manager.track(outer.path()).unwrap();
        let inner = manager.track(&inner_path).unwrap();

        let found = manager
            .repository_for_path(inner_path.join("file.txt"))
            .unwrap();
        assert!(Arc::ptr_eq(&found, &inner));
        assert!(manager.repository_for_path("/definitely/elsewhere").is_none());
    }

    #[test]
    fn test_untrack() {
        let dir = tempfile::tempdir().unwrap();
        Repository::init(dir.path()).unwrap();
        let manager = RepositoryManager::new();
        manager.track(dir.path()).unwrap();
        assert!(manager.untrack(dir.path()).is_some());
        assert!(manager.get(dir.path()).is_none());
        assert!(manager.update_all().is_empty());
    }
}
