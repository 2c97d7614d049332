//! Repository change notifier.
//!
//! A [`RepositoryTracker`] owns the last snapshot of one repository and an
//! explicit list of listeners. Each [`update`](RepositoryTracker::update)
//! re-reads the metadata and, when anything differs, delivers exactly one
//! [`RepositoryChangeEvent`] to every listener before returning.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::ThreadId;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::reader::RepositoryReader;
use crate::errors::ReadError;
use crate::models::{RepositorySnapshot, SnapshotField};

/// A state transition observed by [`RepositoryTracker::update`].
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RepositoryChangeEvent {
    pub previous: RepositorySnapshot,
    pub current: RepositorySnapshot,
    pub changed: Vec<SnapshotField>,
}

impl RepositoryChangeEvent {
    pub fn root(&self) -> &Path {
        &self.current.root
    }

    pub fn touches(&self, field: SnapshotField) -> bool {
        self.changed.contains(&field)
    }
}

/// Receives change events. Closures taking `&RepositoryChangeEvent` qualify.
pub trait RepositoryListener: Send + Sync {
    fn repository_changed(&self, event: &RepositoryChangeEvent);
}

impl<F> RepositoryListener for F
where
    F: Fn(&RepositoryChangeEvent) + Send + Sync,
{
    fn repository_changed(&self, event: &RepositoryChangeEvent) {
        self(event)
    }
}

/// Handle returned by [`RepositoryTracker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct TrackerInner {
    snapshot: RepositorySnapshot,
    listeners: Vec<(ListenerId, Arc<dyn RepositoryListener>)>,
    next_id: u64,
}

/// Tracks one repository root and publishes its state transitions.
pub struct RepositoryTracker {
    reader: RepositoryReader,
    inner: Mutex<TrackerInner>,
    /// Serializes `update()` calls, including listener delivery.
    update_lock: Mutex<()>,
    /// Thread currently inside `update()`, to catch re-entrant calls.
    updating: Mutex<Option<ThreadId>>,
}

/// Clears the updating thread when `update()` returns or unwinds.
struct UpdatingGuard<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for UpdatingGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl RepositoryTracker {
    /// Open the repository at `root` and take the initial snapshot.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ReadError> {
        let reader = RepositoryReader::open(root)?;
        Ok(Self::with_reader(reader))
    }

    pub fn with_reader(reader: RepositoryReader) -> Self {
        let snapshot = reader.read();
        info!(
            root = %reader.root().display(),
            state = %snapshot.state,
            branch = ?snapshot.current_branch,
            "tracking repository"
        );
        Self {
            reader,
            inner: Mutex::new(TrackerInner {
                snapshot,
                listeners: Vec::new(),
                next_id: 0,
            }),
            update_lock: Mutex::new(()),
            updating: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        self.reader.root()
    }

    pub fn reader(&self) -> &RepositoryReader {
        &self.reader
    }

    /// The last snapshot taken. Does not touch the disk.
    pub fn snapshot(&self) -> RepositorySnapshot {
        self.lock_inner().snapshot.clone()
    }

    pub fn subscribe(&self, listener: impl RepositoryListener + 'static) -> ListenerId {
        let mut inner = self.lock_inner();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        debug!(listener = id.0, "listener subscribed");
        id
    }

    /// Remove a listener. Returns `false` if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.lock_inner();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        before != inner.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.lock_inner().listeners.len()
    }

    /// Re-read the repository and publish a change event if anything differs.
    ///
    /// Listeners run synchronously on the calling thread after the new
    /// snapshot is stored. They may call [`snapshot`](Self::snapshot). A
    /// listener calling `update()` on the same tracker gets `None`.
    #[instrument(skip(self), fields(root = %self.reader.root().display()))]
    pub fn update(&self) -> Option<RepositoryChangeEvent> {
        let me = std::thread::current().id();
        if *self.updating.lock().unwrap_or_else(|p| p.into_inner()) == Some(me) {
            warn!("update() called from a listener of the same tracker, ignored");
            return None;
        }
        let _serial = self
            .update_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *self.updating.lock().unwrap_or_else(|p| p.into_inner()) = Some(me);
        let _updating = UpdatingGuard(&self.updating);

        let current = self.reader.read();

        let (event, listeners) = {
            let mut inner = self.lock_inner();
            let changed = inner.snapshot.changed_fields(&current);
            if changed.is_empty() {
                debug!("repository unchanged");
                return None;
            }
            let previous = std::mem::replace(&mut inner.snapshot, current.clone());
            let listeners: Vec<Arc<dyn RepositoryListener>> =
                inner.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (
                RepositoryChangeEvent {
                    previous,
                    current,
                    changed,
                },
                listeners,
            )
        };

        info!(
            changed = ?event.changed,
            state = %event.current.state,
            branch = ?event.current.current_branch,
            listeners = listeners.len(),
            "repository changed"
        );
        for listener in &listeners {
            listener.repository_changed(&event);
        }
        Some(event)
    }

    fn lock_inner(&self) -> MutexGuard<'_, TrackerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for RepositoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryTracker")
            .field("root", &self.reader.root())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
