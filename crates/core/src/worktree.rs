//! Working tree operations: status, rollback, and merge-base diffs.

use std::path::{Path, PathBuf};

use git2::{build::CheckoutBuilder, Delta, ErrorCode, Repository, Status, StatusOptions};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::errors::GitError;

/// Kind of change to a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Renamed { from: String },
    Untracked,
    Conflicted,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
            Self::Renamed { from } => write!(f, "renamed from {}", from),
            Self::Untracked => write!(f, "untracked"),
            Self::Conflicted => write!(f, "conflicted"),
        }
    }
}

/// A changed file, relative to the repository root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(flatten)]
    pub kind: ChangeKind,
    /// Whether the change is (at least partly) in the index.
    pub staged: bool,
}

/// Open the repository at `root`.
pub fn open(root: &Path) -> Result<Repository, GitError> {
    Repository::open(root).map_err(|_| GitError::RepositoryNotFound(root.display().to_string()))
}

/// Uncommitted changes in the working tree and index. Ignored files are skipped.
#[instrument(skip_all, fields(root = %root.display()))]
pub fn status(root: &Path, include_untracked: bool) -> Result<Vec<FileChange>, GitError> {
    let repo = open(root)?;
    status_of(&repo, include_untracked)
}

pub(crate) fn status_of(repo: &Repository, include_untracked: bool) -> Result<Vec<FileChange>, GitError> {
    let mut opts = StatusOptions::new();
    opts.include_untracked(include_untracked)
        .recurse_untracked_dirs(include_untracked)
        .include_ignored(false);

    let statuses = repo.statuses(Some(&mut opts))?;
    let mut changes = Vec::new();
    for entry in statuses.iter() {
        let Some(path) = entry.path() else {
            continue;
        };
        if let Some(kind) = classify_status(entry.status()) {
            changes.push(FileChange {
                path: path.to_string(),
                kind,
                staged: entry.status().intersects(
                    Status::INDEX_NEW
                        | Status::INDEX_MODIFIED
                        | Status::INDEX_DELETED
                        | Status::INDEX_RENAMED
                        | Status::INDEX_TYPECHANGE,
                ),
            });
        }
    }
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(count = changes.len(), "collected status");
    Ok(changes)
}

fn classify_status(status: Status) -> Option<ChangeKind> {
    if status.is_conflicted() {
        Some(ChangeKind::Conflicted)
    } else if status.contains(Status::INDEX_NEW) {
        Some(ChangeKind::Added)
    } else if status.contains(Status::WT_NEW) {
        Some(ChangeKind::Untracked)
    } else if status.intersects(Status::INDEX_DELETED | Status::WT_DELETED) {
        Some(ChangeKind::Deleted)
    } else if status.intersects(
        Status::INDEX_MODIFIED
            | Status::WT_MODIFIED
            | Status::INDEX_TYPECHANGE
            | Status::WT_TYPECHANGE
            | Status::INDEX_RENAMED
            | Status::WT_RENAMED,
    ) {
        Some(ChangeKind::Modified)
    } else {
        None
    }
}

/// What [`rollback`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RollbackSummary {
    /// Paths reset to their HEAD content.
    pub reverted: Vec<String>,
    /// Paths not in HEAD that were deleted.
    pub removed: Vec<String>,
}

/// Roll `paths` back to their HEAD state, discarding staged and unstaged
/// changes. Paths that do not exist in HEAD are removed from the index and
/// deleted from disk.
#[instrument(skip_all, fields(root = %root.display(), count = paths.len()))]
pub fn rollback<P: AsRef<Path>>(root: &Path, paths: &[P]) -> Result<RollbackSummary, GitError> {
    let repo = open(root)?;
    let head_commit = match repo.head() {
        Ok(head) => Some(head.peel_to_commit()?),
        Err(e) if e.code() == ErrorCode::UnbornBranch => None,
        Err(e) => return Err(e.into()),
    };
    let head_tree = head_commit.as_ref().map(|c| c.tree()).transpose()?;

    let mut to_revert: Vec<PathBuf> = Vec::new();
    let mut to_remove: Vec<PathBuf> = Vec::new();
    for p in paths {
        let rel = relative_to_root(root, p.as_ref());
        let in_head = head_tree
            .as_ref()
            .map(|t| t.get_path(&rel).is_ok())
            .unwrap_or(false);
        if in_head {
            to_revert.push(rel);
        } else {
            to_remove.push(rel);
        }
    }

    let mut summary = RollbackSummary::default();

    if let (Some(commit), false) = (head_commit.as_ref(), to_revert.is_empty()) {
        repo.reset_default(Some(commit.as_object()), to_revert.iter().map(|p| p.as_path()))?;
        let mut checkout = CheckoutBuilder::new();
        checkout.force();
        for p in &to_revert {
            checkout.path(p.as_path());
        }
        repo.checkout_head(Some(&mut checkout))?;
        summary.reverted = to_revert.iter().map(|p| p.to_string_lossy().to_string()).collect();
    }

    if !to_remove.is_empty() {
        let mut index = repo.index()?;
        for rel in &to_remove {
            // Untracked files are not in the index; that is fine.
            let _ = index.remove_path(rel);
            let abs = root.join(rel);
            if abs.is_dir() {
                std::fs::remove_dir_all(&abs)?;
            } else if abs.exists() {
                std::fs::remove_file(&abs)?;
            }
            summary.removed.push(rel.to_string_lossy().to_string());
        }
        index.write()?;
    }

    info!(
        reverted = summary.reverted.len(),
        removed = summary.removed.len(),
        "rollback complete"
    );
    Ok(summary)
}

pub(crate) fn relative_to_root(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        let canonical_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        path.strip_prefix(root)
            .or_else(|_| path.strip_prefix(&canonical_root))
            .map(Path::to_path_buf)
            .unwrap_or_else(|_| path.to_path_buf())
    } else {
        path.to_path_buf()
    }
}

/// Files a branch changed since it diverged from HEAD.
#[derive(Debug, Clone, Serialize)]
pub struct MergeBaseDiff {
    pub merge_base: String,
    pub branch_tip: String,
    pub changes: Vec<FileChange>,
}

/// Diff between the merge base of HEAD and `branch`, and the tip of `branch`.
///
/// `branch` may be anything rev-parse understands (local or remote branch
/// name, tag, commit id).
#[instrument(skip_all, fields(root = %root.display(), branch))]
pub fn changes_since_merge_base(root: &Path, branch: &str) -> Result<MergeBaseDiff, GitError> {
    let repo = open(root)?;
    let head = match repo.head() {
        Ok(head) => head.peel_to_commit()?,
        Err(e) if e.code() == ErrorCode::UnbornBranch => return Err(GitError::UnbornHead),
        Err(e) => return Err(e.into()),
    };
    let tip = repo
        .revparse_single(branch)
        .and_then(|obj| obj.peel_to_commit())
        .map_err(|_| GitError::RefNotFound(branch.to_string()))?;

    let base = repo.merge_base(head.id(), tip.id()).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            GitError::RefNotFound(format!("merge base of HEAD and {}", branch))
        } else {
            GitError::Git2Error(e)
        }
    })?;

    let base_tree = repo.find_commit(base)?.tree()?;
    let tip_tree = tip.tree()?;
    let mut diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&tip_tree), None)?;
    diff.find_similar(None)?;

    let mut changes = Vec::new();
    for delta in diff.deltas() {
        let new_path = delta.new_file().path().map(|p| p.to_string_lossy().to_string());
        let old_path = delta.old_file().path().map(|p| p.to_string_lossy().to_string());
        let (path, kind) = match delta.status() {
            Delta::Added => (new_path, ChangeKind::Added),
            Delta::Deleted => (old_path, ChangeKind::Deleted),
            Delta::Renamed => (
                new_path,
                ChangeKind::Renamed {
                    from: old_path.unwrap_or_default(),
                },
            ),
            Delta::Modified | Delta::Typechange | Delta::Copied => (new_path, ChangeKind::Modified),
            _ => continue,
        };
        if let Some(path) = path {
            changes.push(FileChange {
                path,
                kind,
                staged: false,
            });
        }
    }

    debug!(merge_base = %base, changes = changes.len(), "computed merge-base diff");
    Ok(MergeBaseDiff {
        merge_base: base.to_string(),
        branch_tip: tip.id().to_string(),
        changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{IndexAddOption, Signature};

    fn commit_all(repo: &Repository, message: &str) -> git2::Oid {
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT, None)
            .unwrap();
        index.update_all(["*"].iter(), None).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .unwrap()
    }

    fn repo_with_file() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("a.txt"), "original\n").unwrap();
        commit_all(&repo, "initial");
        (dir, repo)
    }

    #[test]
    fn test_status_classifies_changes() {
        let (dir, repo) = repo_with_file();
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "new\n").unwrap();
        std::fs::write(dir.path().join("staged.txt"), "staged\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("staged.txt")).unwrap();
        index.write().unwrap();

        let changes = status(dir.path(), true).unwrap();
        let summary: Vec<(&str, &ChangeKind, bool)> = changes
            .iter()
            .map(|c| (c.path.as_str(), &c.kind, c.staged))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("a.txt", &ChangeKind::Modified, false),
                ("new.txt", &ChangeKind::Untracked, false),
                ("staged.txt", &ChangeKind::Added, true),
            ]
        );

        let tracked_only = status(dir.path(), false).unwrap();
        assert_eq!(tracked_only.len(), 2);
    }

    #[test]
    fn test_rollback_reverts_and_removes() {
        let (dir, _repo) = repo_with_file();
        std::fs::write(dir.path().join("a.txt"), "changed\n").unwrap();
        std::fs::write(dir.path().join("new.txt"), "new\n").unwrap();

        let summary = rollback(dir.path(), &["a.txt", "new.txt"]).unwrap();
        assert_eq!(summary.reverted, vec!["a.txt"]);
        assert_eq!(summary.removed, vec!["new.txt"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
            "original\n"
        );
        assert!(!dir.path().join("new.txt").exists());
        assert!(status(dir.path(), true).unwrap().is_empty());
    }

    #[test]
    fn test_changes_since_merge_base() {
        let (dir, repo) = repo_with_file();
        let main_tip = repo.head().unwrap().peel_to_commit().unwrap();
        let main_ref = repo.head().unwrap().name().unwrap().to_string();

        repo.branch("feature", &main_tip, false).unwrap();
        repo.set_head("refs/heads/feature").unwrap();
        std::fs::write(dir.path().join("feature.txt"), "f\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), "feature edit\n").unwrap();
        commit_all(&repo, "feature work");

        repo.set_head(&main_ref).unwrap();
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
            .unwrap();

        let diff = changes_since_merge_base(dir.path(), "feature").unwrap();
        assert_eq!(diff.merge_base, main_tip.id().to_string());
        let mut paths: Vec<(&str, &ChangeKind)> =
            diff.changes.iter().map(|c| (c.path.as_str(), &c.kind)).collect();
        paths.sort_by_key(|(p, _)| *p);
        assert_eq!(
            paths,
            vec![("a.txt", &ChangeKind::Modified), ("feature.txt", &ChangeKind::Added)]
        );
    }

    #[test]
    fn test_merge_base_unknown_branch() {
        let (dir, _repo) = repo_with_file();
        assert!(matches!(
            changes_since_merge_base(dir.path(), "nope"),
            Err(GitError::RefNotFound(_))
        ));
    }
}
