//! Save backend that writes changed files to a JSON shelf.
//!
//! A shelf records, for every changed path, the HEAD content (`base`) and
//! the working-tree content at save time. Restoring compares both against
//! what is on disk now and three-way merges text files when the working
//! tree moved on in the meantime.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use git2::{ErrorCode, Repository, ResetType, Tree};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::merger::{self, Merger};
use super::{RestoreReport, SaveBackend};
use crate::errors::SaveError;
use crate::models::{BackendKind, RestoreStatus, SavedChangeSet, SavedHandle};
use crate::worktree;

const SHELF_VERSION: u32 = 1;

/// On-disk shelf file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Shelf {
    version: u32,
    id: String,
    label: String,
    root: PathBuf,
    created_at: DateTime<Utc>,
    /// Commit the base contents were taken from.
    head: String,
    files: Vec<ShelvedFile>,
}

/// One changed path. `None` means the file did not exist on that side.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShelvedFile {
    path: String,
    base: Option<String>,
    content: Option<String>,
    /// Progress of earlier restore attempts.
    #[serde(default)]
    state: FileState,
}

/// How far restoring a shelved file got.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FileState {
    /// Not put back yet, or left untouched by a collision.
    #[default]
    Pending,
    /// The working tree holds the shelved content.
    Applied,
    /// Conflict markers were written and await the user.
    Conflicted,
}

impl ShelvedFile {
    fn base(&self) -> Result<Option<Vec<u8>>, SaveError> {
        decode(self.base.as_deref())
    }

    fn content(&self) -> Result<Option<Vec<u8>>, SaveError> {
        decode(self.content.as_deref())
    }
}

fn encode(bytes: Option<Vec<u8>>) -> Option<String> {
    bytes.map(|b| STANDARD.encode(b))
}

fn decode(payload: Option<&str>) -> Result<Option<Vec<u8>>, SaveError> {
    payload
        .map(|p| {
            STANDARD
                .decode(p)
                .map_err(|e| SaveError::ShelfFormat(format!("bad payload: {}", e)))
        })
        .transpose()
}

/// Shelf-backed [`SaveBackend`].
#[derive(Debug, Clone)]
pub struct ShelveBackend {
    include_untracked: bool,
    shelf_dir: Option<PathBuf>,
}

impl ShelveBackend {
    /// With `shelf_dir` unset, shelves live in `<git dir>/repotrack/shelf`.
    pub fn new(include_untracked: bool, shelf_dir: Option<PathBuf>) -> Self {
        Self {
            include_untracked,
            shelf_dir,
        }
    }

    fn dir_for(&self, repo: &Repository, root: &Path) -> PathBuf {
        match &self.shelf_dir {
            Some(dir) => dir.join(root_key(root)),
            None => repo.path().join("repotrack").join("shelf"),
        }
    }

    /// Put the tree back to HEAD and delete captured files HEAD lacks.
    fn clean(
        &self,
        repo: &Repository,
        root: &Path,
        head: &git2::Commit<'_>,
        files: &[ShelvedFile],
    ) -> Result<(), SaveError> {
        repo.reset(head.as_object(), ResetType::Hard, None)?;
        for file in files.iter().filter(|f| f.base.is_none()) {
            let abs = root.join(&file.path);
            if abs.is_file() {
                std::fs::remove_file(&abs)?;
            }
            prune_empty_parents(root, &abs);
        }
        Ok(())
    }
}

fn canonical(root: &Path) -> PathBuf {
    std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf())
}

/// Directory name for `root` under a shared shelf directory.
fn root_key(root: &Path) -> String {
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    hex::encode(&digest[..8])
}

fn blob_at(repo: &Repository, tree: &Tree<'_>, path: &str) -> Result<Option<Vec<u8>>, SaveError> {
    match tree.get_path(Path::new(path)) {
        Ok(entry) => {
            let object = entry.to_object(repo)?;
            Ok(object.as_blob().map(|b| b.content().to_vec()))
        }
        Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, SaveError> {
    if path.is_file() {
        Ok(Some(std::fs::read(path)?))
    } else {
        Ok(None)
    }
}

fn write_file(path: &Path, content: Option<&[u8]>) -> Result<(), SaveError> {
    match content {
        Some(bytes) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, bytes)?;
        }
        None => {
            if path.is_file() {
                std::fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}

fn prune_empty_parents(root: &Path, path: &Path) {
    let mut dir = path.parent();
    while let Some(d) = dir {
        if d == root || !d.starts_with(root) {
            break;
        }
        // Fails (and stops) on the first non-empty directory.
        if std::fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

fn write_shelf(path: &Path, shelf: &Shelf) -> Result<(), SaveError> {
    let json = serde_json::to_vec_pretty(shelf)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_shelf(path: &Path) -> Result<Shelf, SaveError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SaveError::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let shelf: Shelf = serde_json::from_slice(&bytes)?;
    if shelf.version != SHELF_VERSION {
        return Err(SaveError::ShelfFormat(format!(
            "unsupported shelf version {}",
            shelf.version
        )));
    }
    Ok(shelf)
}

fn shelf_path(set: &SavedChangeSet) -> Result<&Path, SaveError> {
    match &set.handle {
        SavedHandle::Shelf { path } => Ok(path),
        SavedHandle::Stash { oid } => Err(SaveError::NotFound(oid.clone())),
    }
}

/// Outcome of putting one shelved file back.
#[derive(Debug, PartialEq, Eq)]
enum FileOutcome {
    Unchanged,
    Applied,
    Merged,
    /// The user cleared the conflict markers of an earlier attempt.
    Resolved,
    Conflicted { written: bool },
}

fn restore_file(root: &Path, file: &ShelvedFile) -> Result<FileOutcome, SaveError> {
    let abs = root.join(&file.path);
    let current = read_file(&abs)?;
    let base = file.base()?;
    let shelved = file.content()?;

    if current == shelved {
        return Ok(FileOutcome::Unchanged);
    }
    if current == base {
        write_file(&abs, shelved.as_deref())?;
        return Ok(FileOutcome::Applied);
    }

    // Both sides changed: only text present on both sides can be merged.
    let (Some(current), Some(shelved)) = (current, shelved) else {
        debug!(path = %file.path, "delete collision, leaving file alone");
        return Ok(FileOutcome::Conflicted { written: false });
    };
    let base = base.unwrap_or_default();
    let (Ok(base), Ok(current), Ok(shelved)) = (
        String::from_utf8(base),
        String::from_utf8(current),
        String::from_utf8(shelved),
    ) else {
        debug!(path = %file.path, "binary collision, leaving file alone");
        return Ok(FileOutcome::Conflicted { written: false });
    };

    let result = Merger::three_way_merge(&base, &current, &shelved);
    std::fs::write(&abs, result.merged_content.as_bytes())?;
    if result.has_conflicts {
        debug!(path = %file.path, conflicts = result.conflict_count, "wrote conflict markers");
        Ok(FileOutcome::Conflicted { written: true })
    } else {
        Ok(FileOutcome::Merged)
    }
}

/// Revisit a file whose conflict markers were written by an earlier attempt.
///
/// The working tree is never merged again: markers still present keep the
/// file conflicted, anything else is the user's resolution.
fn resume_file(root: &Path, file: &ShelvedFile) -> Result<FileOutcome, SaveError> {
    let abs = root.join(&file.path);
    let current = read_file(&abs)?;
    let shelved = file.content()?;

    if current == shelved {
        return Ok(FileOutcome::Unchanged);
    }
    if current == file.base()? {
        write_file(&abs, shelved.as_deref())?;
        return Ok(FileOutcome::Applied);
    }
    match current {
        Some(bytes) if merger::has_conflict_markers(&String::from_utf8_lossy(&bytes)) => {
            Ok(FileOutcome::Conflicted { written: true })
        }
        _ => {
            debug!(path = %file.path, "conflict resolved in working tree");
            Ok(FileOutcome::Resolved)
        }
    }
}

impl SaveBackend for ShelveBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Shelve
    }

    #[instrument(skip(self), fields(root = %root.display()))]
    fn save(&self, root: &Path, label: &str) -> Result<Option<SavedChangeSet>, SaveError> {
        let root = &canonical(root);
        let repo = worktree::open(root)?;
        let head = match repo.head() {
            Ok(head) => head.peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                return Err(SaveError::NoCommits(root.to_path_buf()))
            }
            Err(e) => return Err(e.into()),
        };
        let tree = head.tree()?;

        let changes = worktree::status_of(&repo, self.include_untracked)?;
        if changes.is_empty() {
            return Ok(None);
        }

        let mut files = Vec::with_capacity(changes.len());
        for change in &changes {
            files.push(ShelvedFile {
                path: change.path.clone(),
                base: encode(blob_at(&repo, &tree, &change.path)?),
                content: encode(read_file(&root.join(&change.path))?),
                state: FileState::Pending,
            });
        }

        let dir = self.dir_for(&repo, root);
        std::fs::create_dir_all(&dir)?;
        let mut set = SavedChangeSet::new(
            root.to_path_buf(),
            label,
            BackendKind::Shelve,
            SavedHandle::Shelf { path: PathBuf::new() },
        );
        let path = dir.join(format!("{}.json", set.id));
        set.handle = SavedHandle::Shelf { path: path.clone() };

        let shelf = Shelf {
            version: SHELF_VERSION,
            id: set.id.clone(),
            label: set.label.clone(),
            root: root.to_path_buf(),
            created_at: set.created_at,
            head: head.id().to_string(),
            files,
        };
        write_shelf(&path, &shelf)?;
        info!(path = %path.display(), files = shelf.files.len(), "wrote shelf");

        if let Err(e) = self.clean(&repo, root, &head, &shelf.files) {
            warn!(error = %e, "cleaning after shelve failed, putting changes back");
            match self.restore(&set) {
                Ok(report) if report.status == RestoreStatus::Restored => {}
                Ok(report) => warn!(status = %report.status, "shelf kept after failed clean"),
                Err(re) => warn!(error = %re, "shelf kept after failed clean"),
            }
            return Err(e);
        }
        Ok(Some(set))
    }

    #[instrument(skip_all, fields(root = %set.root.display(), id = %set.id))]
    fn restore(&self, set: &SavedChangeSet) -> Result<RestoreReport, SaveError> {
        let path = shelf_path(set)?;
        let mut shelf = read_shelf(path)?;

        let mut conflicted = Vec::new();
        let mut written_any = false;
        for file in shelf.files.iter_mut() {
            let outcome = match file.state {
                FileState::Applied => {
                    written_any = true;
                    continue;
                }
                FileState::Conflicted => resume_file(&set.root, file)?,
                FileState::Pending => restore_file(&set.root, file)?,
            };
            match outcome {
                FileOutcome::Unchanged => file.state = FileState::Applied,
                FileOutcome::Applied | FileOutcome::Merged | FileOutcome::Resolved => {
                    file.state = FileState::Applied;
                    written_any = true;
                }
                FileOutcome::Conflicted { written } => {
                    if written {
                        file.state = FileState::Conflicted;
                        written_any = true;
                    }
                    conflicted.push(file.path.clone());
                }
            }
        }

        if conflicted.is_empty() {
            std::fs::remove_file(path)?;
            info!(files = shelf.files.len(), "shelf restored and removed");
            return Ok(RestoreReport::restored());
        }
        write_shelf(path, &shelf)?;
        let status = if written_any {
            RestoreStatus::Conflicted
        } else {
            RestoreStatus::FailedCleanly
        };
        warn!(%status, files = conflicted.len(), "shelf not fully restored, kept");
        Ok(RestoreReport {
            status,
            conflicted_files: conflicted,
        })
    }

    fn discard(&self, set: &SavedChangeSet) -> Result<(), SaveError> {
        let path = shelf_path(set)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SaveError::NotFound(path.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn find_open(&self, root: &Path) -> Result<Vec<SavedChangeSet>, SaveError> {
        let root = &canonical(root);
        let repo = worktree::open(root)?;
        let dir = self.dir_for(&repo, root);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut open = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let shelf = match read_shelf(&path) {
                Ok(shelf) => shelf,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable shelf");
                    continue;
                }
            };
            if shelf.root.as_path() != root.as_path() {
                continue;
            }
            let mut set = SavedChangeSet::new(
                shelf.root,
                shelf.label,
                BackendKind::Shelve,
                SavedHandle::Shelf { path },
            );
            if shelf.files.iter().any(|f| f.state == FileState::Conflicted) {
                set.status = RestoreStatus::Conflicted;
            }
            set.id = shelf.id;
            set.created_at = shelf.created_at;
            open.push(set);
        }
        open.sort_by_key(|s| s.created_at);
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shelved(path: &str, base: Option<&str>, content: Option<&str>) -> ShelvedFile {
        ShelvedFile {
            path: path.into(),
            base: encode(base.map(|s| s.as_bytes().to_vec())),
            content: encode(content.map(|s| s.as_bytes().to_vec())),
            state: FileState::Pending,
        }
    }

    #[test]
    fn test_restore_file_onto_base() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "base\n").unwrap();
        let file = shelved("a.txt", Some("base\n"), Some("edited\n"));
        assert_eq!(restore_file(dir.path(), &file).unwrap(), FileOutcome::Applied);
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "edited\n");
        assert_eq!(restore_file(dir.path(), &file).unwrap(), FileOutcome::Unchanged);
    }

    #[test]
    fn test_restore_deleted_and_new_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gone.txt"), "x\n").unwrap();
        let deleted = shelved("gone.txt", Some("x\n"), None);
        let created = shelved("sub/new.txt", None, Some("new\n"));
        restore_file(dir.path(), &deleted).unwrap();
        restore_file(dir.path(), &created).unwrap();
        assert!(!dir.path().join("gone.txt").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("sub/new.txt")).unwrap(), "new\n");
    }

    #[test]
    fn test_restore_file_conflict_writes_markers() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\nexternal\nthree\n").unwrap();
        let file = shelved("a.txt", Some("one\ntwo\nthree\n"), Some("one\nsaved\nthree\n"));
        assert_eq!(
            restore_file(dir.path(), &file).unwrap(),
            FileOutcome::Conflicted { written: true }
        );
        let text = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();
        assert!(text.contains("<<<<<<<"));
    }

    #[test]
    fn test_resume_accepts_resolution_and_keeps_markers() {
        let dir = tempfile::tempdir().unwrap();
        let file = shelved("a.txt", Some("one\ntwo\nthree\n"), Some("one\nsaved\nthree\n"));
        std::fs::write(dir.path().join("a.txt"), "one\nexternal\nthree\n").unwrap();
        restore_file(dir.path(), &file).unwrap();
        let with_markers = std::fs::read_to_string(dir.path().join("a.txt")).unwrap();

        assert_eq!(
            resume_file(dir.path(), &file).unwrap(),
            FileOutcome::Conflicted { written: true }
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), with_markers);

        std::fs::write(dir.path().join("a.txt"), "one\nexternal\nsaved\nthree\n").unwrap();
        assert_eq!(resume_file(dir.path(), &file).unwrap(), FileOutcome::Resolved);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "one\nexternal\nsaved\nthree\n"
        );
    }

    #[test]
    fn test_shelf_without_state_reads_as_pending() {
        let json = r#"{"path":"a.txt","base":null,"content":null}"#;
        let file: ShelvedFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.state, FileState::Pending);
    }

    #[test]
    fn test_delete_collision_leaves_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "external\n").unwrap();
        let file = shelved("a.txt", Some("base\n"), None);
        assert_eq!(
            restore_file(dir.path(), &file).unwrap(),
            FileOutcome::Conflicted { written: false }
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "external\n");
    }

    #[test]
    fn test_root_key_is_stable() {
        let a = root_key(Path::new("/work/repo"));
        assert_eq!(a, root_key(Path::new("/work/repo")));
        assert_ne!(a, root_key(Path::new("/work/other")));
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_bad_shelf_version_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.json");
        let shelf = Shelf {
            version: 99,
            id: "x".into(),
            label: "l".into(),
            root: dir.path().to_path_buf(),
            created_at: Utc::now(),
            head: "0".repeat(40),
            files: Vec::new(),
        };
        write_shelf(&path, &shelf).unwrap();
        assert!(matches!(read_shelf(&path), Err(SaveError::ShelfFormat(_))));
    }
}
