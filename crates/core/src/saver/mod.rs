//! Setting uncommitted changes aside and putting them back.
//!
//! A [`ChangeSaver`] drives one save/load cycle over a set of roots through
//! a [`SaveBackend`]. Roots with an open change set are reserved in a shared
//! [`SaveRegistry`] so two savers in one process cannot stack sets on the
//! same root; backends additionally persist open sets so a later process
//! sees them through [`SaveBackend::find_open`].

pub mod merger;
pub mod shelve;
pub mod stash;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::config::SaverConfig;
use crate::errors::SaveError;
use crate::models::{BackendKind, RestoreStatus, SavedChangeSet};
use crate::notify::Notifier;

pub use shelve::ShelveBackend;
pub use stash::StashBackend;

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// What a backend did when asked to put a change set back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub status: RestoreStatus,
    pub conflicted_files: Vec<String>,
}

impl RestoreReport {
    pub fn restored() -> Self {
        Self {
            status: RestoreStatus::Restored,
            conflicted_files: Vec::new(),
        }
    }
}

/// A mechanism for setting aside and reapplying uncommitted changes.
pub trait SaveBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Capture the uncommitted changes of `root`, then clean it.
    ///
    /// Returns `Ok(None)` when there is nothing to save. If capturing fails
    /// the working tree must be left as it was.
    fn save(&self, root: &Path, label: &str) -> Result<Option<SavedChangeSet>, SaveError>;

    /// Reapply `set`. The backend drops its copy only on a clean restore.
    fn restore(&self, set: &SavedChangeSet) -> Result<RestoreReport, SaveError>;

    /// Drop `set` without applying it.
    fn discard(&self, set: &SavedChangeSet) -> Result<(), SaveError>;

    /// Change sets this backend still holds for `root`, oldest first.
    fn find_open(&self, root: &Path) -> Result<Vec<SavedChangeSet>, SaveError>;
}

/// Build the backend selected in `config`.
pub fn backend_from_config(config: &SaverConfig) -> Arc<dyn SaveBackend> {
    match config.backend {
        BackendKind::Stash => Arc::new(StashBackend::new(&config.marker, config.include_untracked)),
        BackendKind::Shelve => Arc::new(ShelveBackend::new(
            config.include_untracked,
            config.shelf_dir.clone(),
        )),
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Roots that currently have an open change set in this process.
#[derive(Debug, Default)]
pub struct SaveRegistry {
    open: Mutex<HashSet<PathBuf>>,
}

impl SaveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve every root or none. On conflict, returns the first root that
    /// is already taken.
    pub fn reserve(&self, roots: &[PathBuf]) -> Result<(), PathBuf> {
        let mut open = self.open.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(taken) = roots.iter().find(|r| open.contains(*r)) {
            return Err(taken.clone());
        }
        open.extend(roots.iter().cloned());
        Ok(())
    }

    pub fn release(&self, root: &Path) {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(root);
    }

    pub fn is_open(&self, root: &Path) -> bool {
        self.open
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(root)
    }
}

// ---------------------------------------------------------------------------
// Saver
// ---------------------------------------------------------------------------

/// Where a [`ChangeSaver`] is in its save/load cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaverPhase {
    #[default]
    Idle,
    Saving,
    Saved,
    SaveFailed,
    Loading,
    Restored,
    Conflict,
}

impl std::fmt::Display for SaverPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Saving => write!(f, "saving"),
            Self::Saved => write!(f, "saved"),
            Self::SaveFailed => write!(f, "save_failed"),
            Self::Loading => write!(f, "loading"),
            Self::Restored => write!(f, "restored"),
            Self::Conflict => write!(f, "conflict"),
        }
    }
}

/// Result of [`ChangeSaver::load`].
#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub phase: SaverPhase,
    /// Sets that were applied cleanly and discarded.
    pub restored: Vec<SavedChangeSet>,
    /// Sets that are still open, with their restore status.
    pub unresolved: Vec<SavedChangeSet>,
}

impl LoadOutcome {
    pub fn is_clean(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Saves the uncommitted changes of several roots and later restores them.
pub struct ChangeSaver {
    backend: Arc<dyn SaveBackend>,
    registry: Arc<SaveRegistry>,
    notifier: Arc<Notifier>,
    label: String,
    phase: SaverPhase,
    saved: Vec<SavedChangeSet>,
}

impl ChangeSaver {
    pub fn new(
        backend: Arc<dyn SaveBackend>,
        registry: Arc<SaveRegistry>,
        notifier: Arc<Notifier>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            registry,
            notifier,
            label: label.into(),
            phase: SaverPhase::Idle,
            saved: Vec::new(),
        }
    }

    pub fn phase(&self) -> SaverPhase {
        self.phase
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Change sets this saver holds open.
    pub fn saved_sets(&self) -> &[SavedChangeSet] {
        &self.saved
    }

    /// Set aside the uncommitted changes of every root.
    ///
    /// All-or-nothing: if any root fails, roots already saved by this call
    /// are restored and the error is returned.
    #[instrument(skip_all, fields(label = %self.label, roots = roots.len()))]
    pub fn save(&mut self, roots: &[PathBuf]) -> Result<&[SavedChangeSet], SaveError> {
        if !matches!(
            self.phase,
            SaverPhase::Idle | SaverPhase::SaveFailed | SaverPhase::Restored
        ) {
            return Err(self.invalid_phase("save"));
        }
        let roots = canonical_roots(roots);

        if let Err(taken) = self.registry.reserve(&roots) {
            warn!(root = %taken.display(), "root already has open saved changes");
            self.phase = SaverPhase::SaveFailed;
            return Err(SaveError::AlreadyOpen(taken));
        }
        for root in &roots {
            match self.backend.find_open(root) {
                Ok(open) if open.is_empty() => {}
                Ok(_) => {
                    warn!(root = %root.display(), "backend already holds saved changes");
                    self.release_all(&roots);
                    self.phase = SaverPhase::SaveFailed;
                    return Err(SaveError::AlreadyOpen(root.clone()));
                }
                Err(e) => {
                    self.release_all(&roots);
                    self.phase = SaverPhase::SaveFailed;
                    return Err(e);
                }
            }
        }

        self.phase = SaverPhase::Saving;
        let mut saved: Vec<SavedChangeSet> = Vec::new();
        for root in &roots {
            match self.backend.save(root, &self.label) {
                Ok(Some(set)) => {
                    info!(root = %root.display(), id = %set.id, backend = %set.backend, "saved local changes");
                    saved.push(set);
                }
                Ok(None) => {
                    info!(root = %root.display(), "nothing to save");
                    self.registry.release(root);
                }
                Err(e) => {
                    error!(root = %root.display(), error = %e, "save failed, rolling back");
                    self.compensate(&saved);
                    self.release_all(&roots);
                    if let Err(ne) = self.notifier.notify_save_failed(root, &e.to_string()) {
                        warn!(error = %ne, "could not deliver save failure notification");
                    }
                    self.saved.clear();
                    self.phase = SaverPhase::SaveFailed;
                    return Err(e);
                }
            }
        }

        self.saved = saved;
        self.phase = SaverPhase::Saved;
        Ok(self.saved.as_slice())
    }

    /// Reapply every open set. Only valid after a successful save, an
    /// [`adopt`](Self::adopt), or a previous load that hit a conflict.
    #[instrument(skip_all, fields(label = %self.label, sets = self.saved.len()))]
    pub fn load(&mut self) -> Result<LoadOutcome, SaveError> {
        if !matches!(self.phase, SaverPhase::Saved | SaverPhase::Conflict) {
            return Err(self.invalid_phase("load"));
        }
        self.phase = SaverPhase::Loading;

        let mut restored = Vec::new();
        let mut unresolved = Vec::new();
        for mut set in std::mem::take(&mut self.saved) {
            let report = match self.backend.restore(&set) {
                Ok(report) => report,
                Err(e) => {
                    error!(root = %set.root.display(), id = %set.id, error = %e, "restore failed");
                    RestoreReport {
                        status: RestoreStatus::Conflicted,
                        conflicted_files: Vec::new(),
                    }
                }
            };
            set.status = report.status;
            set.conflicted_files = report.conflicted_files;

            if set.status == RestoreStatus::Restored {
                info!(root = %set.root.display(), id = %set.id, "restored local changes");
                self.registry.release(&set.root);
                if let Err(e) = self.notifier.notify_restored(&set) {
                    warn!(error = %e, "could not deliver restore notification");
                }
                restored.push(set);
            } else {
                warn!(
                    root = %set.root.display(),
                    id = %set.id,
                    status = %set.status,
                    files = set.conflicted_files.len(),
                    "saved changes not restored"
                );
                if let Err(e) = self.notifier.notify_restore_conflict(&set) {
                    warn!(error = %e, "could not deliver conflict notification");
                }
                unresolved.push(set);
            }
        }

        self.saved = unresolved.clone();
        self.phase = if unresolved.is_empty() {
            SaverPhase::Restored
        } else {
            SaverPhase::Conflict
        };
        Ok(LoadOutcome {
            phase: self.phase,
            restored,
            unresolved,
        })
    }

    /// Take over change sets left open by an earlier process.
    ///
    /// Returns how many sets were adopted; with none the saver stays idle.
    #[instrument(skip_all, fields(roots = roots.len()))]
    pub fn adopt(&mut self, roots: &[PathBuf]) -> Result<usize, SaveError> {
        if self.phase != SaverPhase::Idle {
            return Err(self.invalid_phase("adopt"));
        }
        let roots = canonical_roots(roots);
        let mut found = Vec::new();
        for root in &roots {
            found.extend(self.backend.find_open(root)?);
        }
        if found.is_empty() {
            return Ok(0);
        }

        let mut with_sets: Vec<PathBuf> = found.iter().map(|s| s.root.clone()).collect();
        with_sets.dedup();
        self.registry
            .reserve(&with_sets)
            .map_err(SaveError::AlreadyOpen)?;

        info!(count = found.len(), "adopted saved changes");
        self.saved = found;
        self.phase = SaverPhase::Saved;
        Ok(self.saved.len())
    }

    /// Drop every open set without applying it.
    #[instrument(skip_all, fields(sets = self.saved.len()))]
    pub fn discard(&mut self) -> Result<usize, SaveError> {
        if !matches!(self.phase, SaverPhase::Saved | SaverPhase::Conflict) {
            return Err(self.invalid_phase("discard"));
        }
        let mut discarded = 0;
        while let Some(set) = self.saved.first() {
            self.backend.discard(set)?;
            info!(root = %set.root.display(), id = %set.id, "discarded saved changes");
            self.registry.release(&set.root);
            self.saved.remove(0);
            discarded += 1;
        }
        self.phase = SaverPhase::Idle;
        Ok(discarded)
    }

    fn compensate(&self, saved: &[SavedChangeSet]) {
        for set in saved.iter().rev() {
            match self.backend.restore(set) {
                Ok(report) if report.status == RestoreStatus::Restored => {}
                Ok(report) => {
                    error!(root = %set.root.display(), id = %set.id, status = %report.status,
                        "compensating restore left saved changes open");
                }
                Err(e) => {
                    error!(root = %set.root.display(), id = %set.id, error = %e,
                        "compensating restore failed");
                }
            }
        }
    }

    fn release_all(&self, roots: &[PathBuf]) {
        for root in roots {
            self.registry.release(root);
        }
    }

    fn invalid_phase(&self, operation: &'static str) -> SaveError {
        SaveError::InvalidPhase {
            operation,
            phase: self.phase.to_string(),
        }
    }
}

impl Drop for ChangeSaver {
    /// Open sets stay in the backend; only this process's reservation goes,
    /// so another saver can [`adopt`](ChangeSaver::adopt) them.
    fn drop(&mut self) {
        for set in &self.saved {
            debug!(root = %set.root.display(), id = %set.id, "saver dropped with open set");
            self.registry.release(&set.root);
        }
    }
}

impl std::fmt::Debug for ChangeSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeSaver")
            .field("backend", &self.backend.kind())
            .field("label", &self.label)
            .field("phase", &self.phase)
            .field("saved", &self.saved.len())
            .finish()
    }
}

fn canonical_roots(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut out: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        let canonical = std::fs::canonicalize(root).unwrap_or_else(|_| root.clone());
        if !out.contains(&canonical) {
            out.push(canonical);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SavedHandle;
    use crate::notify::{MemorySink, NotificationKind};

    /// In-memory backend: `save` fails for roots named in `fail_on`,
    /// `restore` returns `next_status`.
    #[derive(Default)]
    struct FakeBackend {
        fail_on: Vec<PathBuf>,
        next_status: Mutex<Option<RestoreStatus>>,
        held: Mutex<Vec<SavedChangeSet>>,
        restored: Mutex<Vec<PathBuf>>,
    }

    impl SaveBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Shelve
        }

        fn save(&self, root: &Path, label: &str) -> Result<Option<SavedChangeSet>, SaveError> {
            if self.fail_on.iter().any(|r| r == root) {
                return Err(SaveError::NoCommits(root.to_path_buf()));
            }
            let set = SavedChangeSet::new(
                root.to_path_buf(),
                label,
                BackendKind::Shelve,
                SavedHandle::Shelf { path: root.join("shelf.json") },
            );
            self.held.lock().unwrap().push(set.clone());
            Ok(Some(set))
        }

        fn restore(&self, set: &SavedChangeSet) -> Result<RestoreReport, SaveError> {
            let status = self.next_status.lock().unwrap().unwrap_or(RestoreStatus::Restored);
            if status == RestoreStatus::Restored {
                self.held.lock().unwrap().retain(|s| s.id != set.id);
                self.restored.lock().unwrap().push(set.root.clone());
                return Ok(RestoreReport::restored());
            }
            Ok(RestoreReport {
                status,
                conflicted_files: vec!["a.txt".into()],
            })
        }

        fn discard(&self, set: &SavedChangeSet) -> Result<(), SaveError> {
            self.held.lock().unwrap().retain(|s| s.id != set.id);
            Ok(())
        }

        fn find_open(&self, root: &Path) -> Result<Vec<SavedChangeSet>, SaveError> {
            Ok(self
                .held
                .lock()
                .unwrap()
                .iter()
                .filter(|s| s.root == root)
                .cloned()
                .collect())
        }
    }

    fn saver(backend: Arc<FakeBackend>, registry: Arc<SaveRegistry>) -> (ChangeSaver, MemorySink) {
        let memory = MemorySink::new();
        let notifier = Arc::new(Notifier::silent().with_sink(memory.clone()));
        (ChangeSaver::new(backend, registry, notifier, "checkout"), memory)
    }

    #[test]
    fn test_save_then_load() {
        let backend = Arc::new(FakeBackend::default());
        let registry = Arc::new(SaveRegistry::new());
        let (mut saver, memory) = saver(backend.clone(), registry.clone());

        let roots = vec![PathBuf::from("/fake/a"), PathBuf::from("/fake/b")];
        assert_eq!(saver.save(&roots).unwrap().len(), 2);
        assert_eq!(saver.phase(), SaverPhase::Saved);
        assert!(registry.is_open(Path::new("/fake/a")));

        let outcome = saver.load().unwrap();
        assert!(outcome.is_clean());
        assert_eq!(outcome.phase, SaverPhase::Restored);
        assert!(!registry.is_open(Path::new("/fake/a")));
        assert!(saver.saved_sets().is_empty());
        assert!(memory
            .received()
            .iter()
            .all(|n| n.kind == NotificationKind::Restored));
    }

    #[test]
    fn test_second_save_on_open_root_fails() {
        let backend = Arc::new(FakeBackend::default());
        let registry = Arc::new(SaveRegistry::new());
        let (mut first, _) = saver(backend.clone(), registry.clone());
        let (mut second, _) = saver(backend.clone(), registry.clone());

        let roots = vec![PathBuf::from("/fake/a")];
        first.save(&roots).unwrap();
        let err = second.save(&roots).unwrap_err();
        assert!(matches!(err, SaveError::AlreadyOpen(_)));
        assert_eq!(second.phase(), SaverPhase::SaveFailed);
        assert_eq!(first.saved_sets().len(), 1);
        assert_eq!(backend.held.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_save_compensates() {
        let backend = Arc::new(FakeBackend {
            fail_on: vec![PathBuf::from("/fake/b")],
            ..Default::default()
        });
        let registry = Arc::new(SaveRegistry::new());
        let (mut saver, memory) = saver(backend.clone(), registry.clone());

        let roots = vec![PathBuf::from("/fake/a"), PathBuf::from("/fake/b")];
        assert!(saver.save(&roots).is_err());
        assert_eq!(saver.phase(), SaverPhase::SaveFailed);
        assert!(saver.saved_sets().is_empty());
        assert_eq!(*backend.restored.lock().unwrap(), vec![PathBuf::from("/fake/a")]);
        assert!(backend.held.lock().unwrap().is_empty());
        assert!(!registry.is_open(Path::new("/fake/a")));
        assert_eq!(memory.received()[0].kind, NotificationKind::SaveFailed);
    }

    #[test]
    fn test_conflict_keeps_set_and_allows_retry() {
        let backend = Arc::new(FakeBackend::default());
        *backend.next_status.lock().unwrap() = Some(RestoreStatus::Conflicted);
        let registry = Arc::new(SaveRegistry::new());
        let (mut saver, memory) = saver(backend.clone(), registry.clone());

        saver.save(&[PathBuf::from("/fake/a")]).unwrap();
        let outcome = saver.load().unwrap();
        assert_eq!(outcome.phase, SaverPhase::Conflict);
        assert_eq!(outcome.unresolved[0].conflicted_files, vec!["a.txt"]);
        assert!(registry.is_open(Path::new("/fake/a")));
        assert_eq!(memory.received()[0].kind, NotificationKind::RestoreConflict);

        *backend.next_status.lock().unwrap() = Some(RestoreStatus::Restored);
        assert_eq!(saver.load().unwrap().phase, SaverPhase::Restored);
    }

    #[test]
    fn test_load_requires_saved_phase() {
        let (mut saver, _) = saver(Arc::new(FakeBackend::default()), Arc::new(SaveRegistry::new()));
        assert!(matches!(
            saver.load(),
            Err(SaveError::InvalidPhase { operation: "load", .. })
        ));
    }

    #[test]
    fn test_adopt_and_discard() {
        let backend = Arc::new(FakeBackend::default());
        let registry = Arc::new(SaveRegistry::new());
        let roots = vec![PathBuf::from("/fake/a")];
        {
            let (mut earlier, _) = saver(backend.clone(), Arc::new(SaveRegistry::new()));
            earlier.save(&roots).unwrap();
        }

        let (mut later, _) = saver(backend.clone(), registry.clone());
        assert_eq!(later.adopt(&roots).unwrap(), 1);
        assert_eq!(later.phase(), SaverPhase::Saved);
        assert_eq!(later.discard().unwrap(), 1);
        assert_eq!(later.phase(), SaverPhase::Idle);
        assert!(backend.held.lock().unwrap().is_empty());
        assert!(!registry.is_open(Path::new("/fake/a")));
    }

    #[test]
    fn test_dropped_saver_releases_roots_for_adoption() {
        let backend = Arc::new(FakeBackend::default());
        let registry = Arc::new(SaveRegistry::new());
        let roots = vec![PathBuf::from("/fake/a")];
        {
            let (mut first, _) = saver(backend.clone(), registry.clone());
            first.save(&roots).unwrap();
            assert!(registry.is_open(Path::new("/fake/a")));
        }
        assert!(!registry.is_open(Path::new("/fake/a")));
        assert_eq!(backend.held.lock().unwrap().len(), 1);

        let (mut later, _) = saver(backend.clone(), registry.clone());
        assert_eq!(later.adopt(&roots).unwrap(), 1);
        assert!(later.load().unwrap().is_clean());
    }

    #[test]
    fn test_dropped_saver_in_conflict_releases_roots() {
        let backend = Arc::new(FakeBackend::default());
        *backend.next_status.lock().unwrap() = Some(RestoreStatus::Conflicted);
        let registry = Arc::new(SaveRegistry::new());
        let roots = vec![PathBuf::from("/fake/a")];
        {
            let (mut first, _) = saver(backend.clone(), registry.clone());
            first.save(&roots).unwrap();
            assert_eq!(first.load().unwrap().phase, SaverPhase::Conflict);
        }
        let (mut later, _) = saver(backend.clone(), registry.clone());
        assert_eq!(later.adopt(&roots).unwrap(), 1);
        assert_eq!(later.discard().unwrap(), 1);
    }

    #[test]
    fn test_registry_reserve_is_all_or_nothing() {
        let registry = SaveRegistry::new();
        registry.reserve(&[PathBuf::from("/a")]).unwrap();
        let err = registry
            .reserve(&[PathBuf::from("/b"), PathBuf::from("/a")])
            .unwrap_err();
        assert_eq!(err, PathBuf::from("/a"));
        assert!(!registry.is_open(Path::new("/b")));
    }
}
