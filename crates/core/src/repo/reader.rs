//! Repository state reader.
//!
//! Reads `HEAD`, the ref store and the merge/rebase marker files straight
//! from the metadata directory. Reading never modifies the repository.

use std::path::{Path, PathBuf};

use git2::Repository;
use tracing::{debug, instrument, warn};

use super::refs::{parse_ref_content, read_optional, RefContent, RefStore};
use crate::errors::ReadError;
use crate::models::{BranchSnapshot, RepositorySnapshot, RepositoryState};

const REBASE_MERGE_DIR: &str = "rebase-merge";
const REBASE_APPLY_DIR: &str = "rebase-apply";
/// Present in `rebase-apply/` when a mailbox apply (`am`) owns the directory.
const APPLYING_MARKER: &str = "applying";
const MERGE_HEAD: &str = "MERGE_HEAD";
const HEAD_NAME: &str = "head-name";
const COMMONDIR: &str = "commondir";

/// Reads a typed [`RepositorySnapshot`] from one repository root.
#[derive(Debug, Clone)]
pub struct RepositoryReader {
    root: PathBuf,
    git_dir: PathBuf,
    common_dir: PathBuf,
}

impl RepositoryReader {
    /// Locate the metadata directories of the repository at `root`.
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub fn open(root: impl AsRef<Path>) -> Result<Self, ReadError> {
        let root = root.as_ref();
        let repo = Repository::open(root)
            .map_err(|_| ReadError::NotARepository(root.display().to_string()))?;
        let git_dir = repo.path().to_path_buf();
        let common_dir = common_dir_of(&git_dir)?;
        let reader = Self {
            root: root.to_path_buf(),
            git_dir,
            common_dir,
        };
        debug!(git_dir = %reader.git_dir.display(), "opened repository reader");
        Ok(reader)
    }

    /// Open the repository whose working tree contains `path`.
    pub fn discover(path: impl AsRef<Path>) -> Result<Self, ReadError> {
        let path = path.as_ref();
        let repo = Repository::discover(path)
            .map_err(|_| ReadError::NotARepository(path.display().to_string()))?;
        let root = repo
            .workdir()
            .ok_or_else(|| ReadError::NotARepository(path.display().to_string()))?;
        Self::open(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-worktree metadata directory (holds `HEAD`, `MERGE_HEAD`, ...).
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    /// The shared metadata directory (holds `refs/`, `packed-refs`).
    pub fn common_dir(&self) -> &Path {
        &self.common_dir
    }

    /// Read a snapshot, degrading to `Normal`/`None` if metadata is unreadable.
    ///
    /// The failure is reported through a warning log.
    pub fn read(&self) -> RepositorySnapshot {
        match self.try_read() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(
                    root = %self.root.display(),
                    error = %e,
                    "failed to read repository metadata; using best-effort state"
                );
                RepositorySnapshot::unknown(self.root.clone())
            }
        }
    }

    /// Read a snapshot, surfacing any metadata problem as an error.
    pub fn try_read(&self) -> Result<RepositorySnapshot, ReadError> {
        let head_path = self.git_dir.join("HEAD");
        let head = read_optional(&head_path)?
            .ok_or_else(|| ReadError::CorruptHead(String::new()))?;
        let refs = RefStore::load(&self.common_dir)?;

        let (head_ref, current_revision) = match parse_ref_content("HEAD", &head)? {
            RefContent::Symbolic(target) => {
                let revision = refs.resolve(&target)?;
                (Some(target), revision)
            }
            RefContent::Direct(hash) => (None, Some(hash)),
        };

        let state = self.read_state(head_ref.is_none());
        let mut current_branch = head_ref.as_deref().map(short_branch_name);
        if state == RepositoryState::Rebasing && current_branch.is_none() {
            current_branch = self.rebased_branch()?;
        }

        let branches = BranchSnapshot::from_refs(refs.list()?);

        let snapshot = RepositorySnapshot {
            root: self.root.clone(),
            state,
            current_branch,
            current_revision,
            branches,
        };
        debug!(
            state = %snapshot.state,
            branch = ?snapshot.current_branch,
            revision = ?snapshot.current_revision,
            "read repository snapshot"
        );
        Ok(snapshot)
    }

    /// Derive the repository state from marker files.
    ///
    /// Rebasing wins over merging, which wins over a detached HEAD.
    fn read_state(&self, head_detached: bool) -> RepositoryState {
        if self.is_rebasing() {
            RepositoryState::Rebasing
        } else if self.git_dir.join(MERGE_HEAD).is_file() {
            RepositoryState::Merging
        } else if head_detached {
            RepositoryState::Detached
        } else {
            RepositoryState::Normal
        }
    }

    fn is_rebasing(&self) -> bool {
        let apply_dir = self.git_dir.join(REBASE_APPLY_DIR);
        self.git_dir.join(REBASE_MERGE_DIR).is_dir()
            || (apply_dir.is_dir() && !apply_dir.join(APPLYING_MARKER).exists())
    }

    /// The branch being rebased, from `head-name` in the rebase directory.
    fn rebased_branch(&self) -> Result<Option<String>, ReadError> {
        for dir in [REBASE_MERGE_DIR, REBASE_APPLY_DIR] {
            if let Some(content) = read_optional(&self.git_dir.join(dir).join(HEAD_NAME))? {
                let name = content.trim();
                if name.starts_with("refs/") {
                    return Ok(Some(short_branch_name(name)));
                }
            }
        }
        Ok(None)
    }
}

/// The shared metadata directory. A linked worktree names it in its
/// `commondir` file, relative to its own git dir.
fn common_dir_of(git_dir: &Path) -> Result<PathBuf, ReadError> {
    match read_optional(&git_dir.join(COMMONDIR))? {
        Some(content) if !content.trim().is_empty() => {
            let dir = git_dir.join(content.trim());
            Ok(std::fs::canonicalize(&dir).unwrap_or(dir))
        }
        _ => Ok(git_dir.to_path_buf()),
    }
}

fn short_branch_name(full: &str) -> String {
    full.strip_prefix("refs/heads/").unwrap_or(full).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    fn init_with_commit() -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let oid = repo
            .commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        (dir, oid.to_string())
    }

    #[test]
    fn test_open_non_repository() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            RepositoryReader::open(dir.path()),
            Err(ReadError::NotARepository(_))
        ));
    }

    #[test]
    fn test_discover_from_subdirectory() {
        let (dir, _) = init_with_commit();
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();
        let reader = RepositoryReader::discover(&nested).unwrap();
        assert_eq!(
            std::fs::canonicalize(reader.root()).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[test]
    fn test_linked_worktree_reads_shared_refs() {
        let (dir, sha) = init_with_commit();
        let repo = Repository::open(dir.path()).unwrap();
        let parent = tempfile::tempdir().unwrap();
        let wt_path = parent.path().join("wt");
        repo.worktree("wt", &wt_path, None).unwrap();

        let reader = RepositoryReader::open(&wt_path).unwrap();
        assert_ne!(reader.git_dir(), reader.common_dir());
        assert_eq!(
            std::fs::canonicalize(reader.common_dir()).unwrap(),
            std::fs::canonicalize(repo.path()).unwrap()
        );

        let snapshot = reader.try_read().unwrap();
        assert_eq!(snapshot.state, RepositoryState::Normal);
        assert_eq!(snapshot.current_branch.as_deref(), Some("wt"));
        assert_eq!(snapshot.current_revision.as_deref(), Some(sha.as_str()));
        assert!(snapshot.branches.find_local("wt").is_some());
        assert_eq!(snapshot.branches.local.len(), 2);
    }

    #[test]
    fn test_main_checkout_common_dir_is_git_dir() {
        let (dir, _) = init_with_commit();
        let reader = RepositoryReader::open(dir.path()).unwrap();
        assert_eq!(reader.git_dir(), reader.common_dir());
    }

    #[test]
    fn test_short_branch_name() {
        assert_eq!(short_branch_name("refs/heads/feature/x"), "feature/x");
        assert_eq!(short_branch_name("weird"), "weird");
    }

    #[test]
    fn test_merge_marker() {
        let (dir, sha) = init_with_commit();
        let reader = RepositoryReader::open(dir.path()).unwrap();
        std::fs::write(reader.git_dir().join("MERGE_HEAD"), format!("{}\n", sha)).unwrap();
        let snapshot = reader.try_read().unwrap();
        assert_eq!(snapshot.state, RepositoryState::Merging);
        assert!(snapshot.current_branch.is_some());
    }

    #[test]
    fn test_rebase_reports_branch_from_head_name() {
        let (dir, sha) = init_with_commit();
        let reader = RepositoryReader::open(dir.path()).unwrap();
        let rebase_dir = reader.git_dir().join("rebase-merge");
        std::fs::create_dir_all(&rebase_dir).unwrap();
        std::fs::write(rebase_dir.join("head-name"), "refs/heads/topic\n").unwrap();
        std::fs::write(reader.git_dir().join("HEAD"), format!("{}\n", sha)).unwrap();

        let snapshot = reader.try_read().unwrap();
        assert_eq!(snapshot.state, RepositoryState::Rebasing);
        assert_eq!(snapshot.current_branch.as_deref(), Some("topic"));
        assert_eq!(snapshot.current_revision.as_deref(), Some(sha.as_str()));
    }

    #[test]
    fn test_mailbox_apply_is_not_rebase() {
        let (dir, _) = init_with_commit();
        let reader = RepositoryReader::open(dir.path()).unwrap();
        let apply_dir = reader.git_dir().join("rebase-apply");
        std::fs::create_dir_all(&apply_dir).unwrap();
        std::fs::write(apply_dir.join("applying"), "").unwrap();
        assert_eq!(reader.read_state(false), RepositoryState::Normal);
    }

    #[test]
    fn test_corrupt_head_degrades_to_normal() {
        let (dir, _) = init_with_commit();
        let reader = RepositoryReader::open(dir.path()).unwrap();
        std::fs::write(reader.git_dir().join("HEAD"), "garbage\n").unwrap();

        assert!(matches!(reader.try_read(), Err(ReadError::CorruptHead(_))));
        let snapshot = reader.read();
        assert_eq!(snapshot.state, RepositoryState::Normal);
        assert_eq!(snapshot.current_branch, None);
        assert_eq!(snapshot.current_revision, None);
    }
}
