//! Save backend built on the repository stash.
//!
//! Each save creates one stash entry whose message carries the configured
//! marker, so entries made by repotrack can be told apart from the user's
//! own stashes and found again by a later process.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{ErrorCode, ObjectType, Oid, Repository, Signature, StashFlags, TreeWalkMode, TreeWalkResult};
use tracing::{debug, info, instrument, warn};

use super::merger;
use super::{RestoreReport, SaveBackend};
use crate::errors::SaveError;
use crate::models::{BackendKind, RestoreStatus, SavedChangeSet, SavedHandle};
use crate::worktree;

/// Stash-backed [`SaveBackend`].
#[derive(Debug, Clone)]
pub struct StashBackend {
    marker: String,
    include_untracked: bool,
}

impl StashBackend {
    pub fn new(marker: impl Into<String>, include_untracked: bool) -> Self {
        Self {
            marker: marker.into(),
            include_untracked,
        }
    }

    fn message(&self, label: &str) -> String {
        format!("{} {}", self.marker, label)
    }

    /// Label encoded in a stash message, if the entry is ours.
    fn label_of(&self, message: &str) -> Option<String> {
        message
            .find(&self.marker)
            .map(|at| message[at + self.marker.len()..].trim().to_string())
    }
}

impl SaveBackend for StashBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stash
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    fn save(&self, root: &Path, label: &str) -> Result<Option<SavedChangeSet>, SaveError> {
        let mut repo = worktree::open(root)?;
        if let Err(e) = repo.head() {
            if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound {
                return Err(SaveError::NoCommits(root.to_path_buf()));
            }
            return Err(e.into());
        }
        if worktree::status_of(&repo, self.include_untracked)?.is_empty() {
            return Ok(None);
        }

        let signature = match repo.signature() {
            Ok(sig) => sig,
            Err(_) => Signature::now("repotrack", "repotrack@localhost")?,
        };
        let mut flags = StashFlags::DEFAULT;
        if self.include_untracked {
            flags |= StashFlags::INCLUDE_UNTRACKED;
        }

        let oid = match repo.stash_save(&signature, &self.message(label), Some(flags)) {
            Ok(oid) => oid,
            Err(e) if e.code() == ErrorCode::NotFound => {
                debug!("stash reported nothing to save");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        info!(oid = %oid, "created stash entry");

        let mut set = SavedChangeSet::new(
            root.to_path_buf(),
            label,
            BackendKind::Stash,
            SavedHandle::Stash { oid: oid.to_string() },
        );
        set.id = oid.to_string();
        Ok(Some(set))
    }

    #[instrument(skip_all, fields(root = %set.root.display(), id = %set.id))]
    fn restore(&self, set: &SavedChangeSet) -> Result<RestoreReport, SaveError> {
        let oid = stash_oid(set)?;
        let mut repo = worktree::open(&set.root)?;
        let index = find_entry(&mut repo, oid)?.ok_or_else(|| SaveError::NotFound(set.id.clone()))?;
        let marker = applied_marker(&repo, oid);
        if marker.is_file() {
            return finish_applied(&mut repo, &set.root, index, oid, &marker);
        }

        match repo.stash_apply(index, None) {
            Ok(()) => {}
            Err(e) if is_collision(&e) => {
                let conflicted = colliding_paths(&repo, oid)?;
                warn!(error = %e, files = conflicted.len(), "stash does not apply, nothing changed");
                return Ok(RestoreReport {
                    status: RestoreStatus::FailedCleanly,
                    conflicted_files: conflicted,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let repo_index = repo.index()?;
        if repo_index.has_conflicts() {
            let mut conflicted = BTreeSet::new();
            for conflict in repo_index.conflicts()? {
                let conflict = conflict?;
                let entry = conflict.our.or(conflict.their).or(conflict.ancestor);
                if let Some(entry) = entry {
                    conflicted.insert(String::from_utf8_lossy(&entry.path).to_string());
                }
            }
            if let Some(parent) = marker.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&marker, b"")?;
            warn!(files = conflicted.len(), "stash applied with conflicts, entry kept");
            return Ok(RestoreReport {
                status: RestoreStatus::Conflicted,
                conflicted_files: conflicted.into_iter().collect(),
            });
        }

        repo.stash_drop(index)?;
        info!("stash applied and dropped");
        Ok(RestoreReport::restored())
    }

    fn discard(&self, set: &SavedChangeSet) -> Result<(), SaveError> {
        let oid = stash_oid(set)?;
        let mut repo = worktree::open(&set.root)?;
        let index = find_entry(&mut repo, oid)?.ok_or_else(|| SaveError::NotFound(set.id.clone()))?;
        repo.stash_drop(index)?;
        clear_marker(&applied_marker(&repo, oid))?;
        debug!(oid = %oid, "dropped stash entry");
        Ok(())
    }

    fn find_open(&self, root: &Path) -> Result<Vec<SavedChangeSet>, SaveError> {
        let mut repo = worktree::open(root)?;
        let mut entries: Vec<(String, Oid)> = Vec::new();
        repo.stash_foreach(|_, message, oid| {
            entries.push((message.to_string(), *oid));
            true
        })?;

        let mut open = Vec::new();
        // Stash index 0 is the newest entry.
        for (message, oid) in entries.into_iter().rev() {
            let Some(label) = self.label_of(&message) else {
                continue;
            };
            let mut set = SavedChangeSet::new(
                root.to_path_buf(),
                label,
                BackendKind::Stash,
                SavedHandle::Stash { oid: oid.to_string() },
            );
            set.id = oid.to_string();
            if applied_marker(&repo, oid).is_file() {
                set.status = RestoreStatus::Conflicted;
            }
            if let Ok(commit) = repo.find_commit(oid) {
                if let Some(time) = DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0) {
                    set.created_at = time;
                }
            }
            open.push(set);
        }
        Ok(open)
    }
}

fn stash_oid(set: &SavedChangeSet) -> Result<Oid, SaveError> {
    match &set.handle {
        SavedHandle::Stash { oid } => {
            Oid::from_str(oid).map_err(|_| SaveError::NotFound(oid.clone()))
        }
        SavedHandle::Shelf { path } => Err(SaveError::NotFound(path.display().to_string())),
    }
}

/// Current stash index of the entry with commit `oid`.
fn find_entry(repo: &mut Repository, oid: Oid) -> Result<Option<usize>, SaveError> {
    let mut found = None;
    repo.stash_foreach(|index, _, id| {
        if *id == oid && found.is_none() {
            found = Some(index);
        }
        true
    })?;
    Ok(found)
}

fn is_collision(e: &git2::Error) -> bool {
    matches!(
        e.code(),
        ErrorCode::Conflict | ErrorCode::MergeConflict | ErrorCode::Exists | ErrorCode::Uncommitted
    )
}

/// Present while a stash entry has been applied with conflicts the user
/// has not resolved yet.
fn applied_marker(repo: &Repository, oid: Oid) -> PathBuf {
    repo.path()
        .join("repotrack")
        .join("stash-applied")
        .join(oid.to_string())
}

fn clear_marker(marker: &Path) -> Result<(), SaveError> {
    match std::fs::remove_file(marker) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Complete a restore whose stash was already applied with conflicts.
///
/// The stash is not applied again. Conflicted paths whose working copy no
/// longer holds markers count as resolved and are staged; once nothing is
/// left the entry is dropped.
fn finish_applied(
    repo: &mut Repository,
    root: &Path,
    index: usize,
    oid: Oid,
    marker: &Path,
) -> Result<RestoreReport, SaveError> {
    let mut repo_index = repo.index()?;
    let mut in_conflict = BTreeSet::new();
    for conflict in repo_index.conflicts()? {
        let conflict = conflict?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            in_conflict.insert(String::from_utf8_lossy(&entry.path).to_string());
        }
    }

    let mut candidates = stashed_paths(repo, oid)?;
    candidates.extend(in_conflict.iter().cloned());

    let mut unresolved = Vec::new();
    let mut staged = false;
    for path in &candidates {
        let abs = root.join(path);
        let bytes = match std::fs::read(&abs) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        if let Some(bytes) = &bytes {
            if merger::has_conflict_markers(&String::from_utf8_lossy(bytes)) {
                unresolved.push(path.clone());
                continue;
            }
        }
        if in_conflict.contains(path) {
            match bytes {
                Some(_) => repo_index.add_path(Path::new(path))?,
                None => repo_index.remove_path(Path::new(path))?,
            }
            staged = true;
        }
    }
    if staged {
        repo_index.write()?;
    }

    if !unresolved.is_empty() {
        debug!(files = unresolved.len(), "stash conflicts still unresolved");
        return Ok(RestoreReport {
            status: RestoreStatus::Conflicted,
            conflicted_files: unresolved,
        });
    }
    repo.stash_drop(index)?;
    clear_marker(marker)?;
    info!("stash conflicts resolved, entry dropped");
    Ok(RestoreReport::restored())
}

/// Every path the stash entry changed, including its untracked files.
fn stashed_paths(repo: &Repository, oid: Oid) -> Result<BTreeSet<String>, SaveError> {
    let commit = repo.find_commit(oid)?;
    let base = commit.parent(0)?.tree()?;
    let mut stashed = BTreeSet::new();

    let diff = repo.diff_tree_to_tree(Some(&base), Some(&commit.tree()?), None)?;
    for delta in diff.deltas() {
        if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
            stashed.insert(path.to_string_lossy().to_string());
        }
    }
    if commit.parent_count() > 2 {
        let untracked = commit.parent(2)?.tree()?;
        untracked.walk(TreeWalkMode::PreOrder, |dir, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    stashed.insert(format!("{}{}", dir, name));
                }
            }
            TreeWalkResult::Ok
        })?;
    }
    Ok(stashed)
}

/// Paths touched by the stash entry that are also dirty in the working tree.
fn colliding_paths(repo: &Repository, oid: Oid) -> Result<Vec<String>, SaveError> {
    let stashed = stashed_paths(repo, oid)?;
    let dirty = worktree::status_of(repo, true)?;
    Ok(dirty
        .into_iter()
        .map(|c| c.path)
        .filter(|p| stashed.contains(p))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_round_trip_through_message() {
        let backend = StashBackend::new("[repotrack]", true);
        let message = format!("On main: {}", backend.message("checkout feature"));
        assert_eq!(backend.label_of(&message).as_deref(), Some("checkout feature"));
        assert_eq!(backend.label_of("On main: WIP"), None);
    }

    #[test]
    fn test_shelf_handle_is_not_a_stash() {
        let set = SavedChangeSet::new(
            "/repo".into(),
            "x",
            BackendKind::Shelve,
            SavedHandle::Shelf { path: "/repo/s.json".into() },
        );
        assert!(matches!(stash_oid(&set), Err(SaveError::NotFound(_))));
    }
}
