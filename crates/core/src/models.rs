//! Domain model types used throughout repotrack.
//!
//! Snapshots are plain values: the reader produces them, the tracker
//! compares them, and nothing mutates them in place.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Repository state
// ---------------------------------------------------------------------------

/// What the repository is in the middle of, derived from marker files.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryState {
    #[default]
    Normal,
    Merging,
    Rebasing,
    Detached,
}

impl std::fmt::Display for RepositoryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Merging => write!(f, "merging"),
            Self::Rebasing => write!(f, "rebasing"),
            Self::Detached => write!(f, "detached"),
        }
    }
}

// ---------------------------------------------------------------------------
// Branch refs
// ---------------------------------------------------------------------------

/// Kind of a named ref.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    Local,
    Remote,
    Tag,
    Head,
}

impl std::fmt::Display for BranchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
            Self::Tag => write!(f, "tag"),
            Self::Head => write!(f, "head"),
        }
    }
}

/// A named ref and the commit it points at. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct BranchRef {
    name: String,
    target: String,
    kind: BranchKind,
}

impl BranchRef {
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: BranchKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
        }
    }

    /// Short name, e.g. `feature/x` or `origin/main`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full hex object id of the target commit.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn kind(&self) -> BranchKind {
        self.kind
    }

    /// First seven characters of the target.
    pub fn short_target(&self) -> &str {
        &self.target[..7.min(self.target.len())]
    }
}

/// All named refs of a repository at one point in time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchSnapshot {
    pub local: Vec<BranchRef>,
    pub remote: Vec<BranchRef>,
    pub tags: Vec<BranchRef>,
}

impl BranchSnapshot {
    /// Build a snapshot from unordered refs; refs of kind `Head` are ignored.
    pub fn from_refs(refs: impl IntoIterator<Item = BranchRef>) -> Self {
        let mut snapshot = Self::default();
        for r in refs {
            match r.kind() {
                BranchKind::Local => snapshot.local.push(r),
                BranchKind::Remote => snapshot.remote.push(r),
                BranchKind::Tag => snapshot.tags.push(r),
                BranchKind::Head => {}
            }
        }
        snapshot.local.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.remote.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot.tags.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }

    pub fn find_local(&self, name: &str) -> Option<&BranchRef> {
        self.local.iter().find(|b| b.name == name)
    }

    pub fn find_remote(&self, name: &str) -> Option<&BranchRef> {
        self.remote.iter().find(|b| b.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty() && self.remote.is_empty() && self.tags.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Repository snapshot
// ---------------------------------------------------------------------------

/// Everything the reader knows about a repository at one point in time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepositorySnapshot {
    pub root: PathBuf,
    pub state: RepositoryState,
    /// `None` when HEAD is detached.
    pub current_branch: Option<String>,
    /// `None` when HEAD is unborn.
    pub current_revision: Option<String>,
    pub branches: BranchSnapshot,
}

/// A field of [`RepositorySnapshot`] that can change between reads.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotField {
    State,
    CurrentBranch,
    CurrentRevision,
    Branches,
}

impl std::fmt::Display for SnapshotField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::State => write!(f, "state"),
            Self::CurrentBranch => write!(f, "current_branch"),
            Self::CurrentRevision => write!(f, "current_revision"),
            Self::Branches => write!(f, "branches"),
        }
    }
}

impl RepositorySnapshot {
    /// The best-effort snapshot used when metadata cannot be read.
    pub fn unknown(root: PathBuf) -> Self {
        Self {
            root,
            state: RepositoryState::Normal,
            current_branch: None,
            current_revision: None,
            branches: BranchSnapshot::default(),
        }
    }

    /// Fields whose values differ between `self` and `other`.
    pub fn changed_fields(&self, other: &RepositorySnapshot) -> Vec<SnapshotField> {
        let mut changed = Vec::new();
        if self.state != other.state {
            changed.push(SnapshotField::State);
        }
        if self.current_branch != other.current_branch {
            changed.push(SnapshotField::CurrentBranch);
        }
        if self.current_revision != other.current_revision {
            changed.push(SnapshotField::CurrentRevision);
        }
        if self.branches != other.branches {
            changed.push(SnapshotField::Branches);
        }
        changed
    }

    pub fn is_detached(&self) -> bool {
        self.current_branch.is_none()
    }

    pub fn is_unborn(&self) -> bool {
        self.current_revision.is_none()
    }
}

// ---------------------------------------------------------------------------
// Saved change sets
// ---------------------------------------------------------------------------

/// Which save backend produced a change set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Stash,
    Shelve,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stash => write!(f, "stash"),
            Self::Shelve => write!(f, "shelve"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stash" => Ok(Self::Stash),
            "shelve" | "shelf" => Ok(Self::Shelve),
            other => Err(format!("unknown save backend '{}'", other)),
        }
    }
}

/// Where a backend keeps a saved change set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SavedHandle {
    /// A stash entry, identified by its commit id.
    Stash { oid: String },
    /// A shelf file on disk.
    Shelf { path: PathBuf },
}

/// Outcome of restoring one saved change set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreStatus {
    /// Not restored yet.
    #[default]
    Pending,
    /// Applied cleanly and discarded.
    Restored,
    /// Nothing was applied; the working tree is untouched.
    FailedCleanly,
    /// Partially applied with unresolved conflicts left in the working tree.
    Conflicted,
}

impl std::fmt::Display for RestoreStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Restored => write!(f, "restored"),
            Self::FailedCleanly => write!(f, "failed_cleanly"),
            Self::Conflicted => write!(f, "conflicted"),
        }
    }
}

/// Uncommitted changes of one root, set aside by a save backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SavedChangeSet {
    pub id: String,
    pub root: PathBuf,
    pub label: String,
    pub backend: BackendKind,
    pub created_at: DateTime<Utc>,
    pub handle: SavedHandle,
    pub status: RestoreStatus,
    /// Files that could not be restored cleanly on the last attempt.
    #[serde(default)]
    pub conflicted_files: Vec<String>,
}

impl SavedChangeSet {
    pub fn new(root: PathBuf, label: impl Into<String>, backend: BackendKind, handle: SavedHandle) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            root,
            label: label.into(),
            backend,
            created_at: Utc::now(),
            handle,
            status: RestoreStatus::Pending,
            conflicted_files: Vec::new(),
        }
    }

    /// Still waiting to be (successfully) restored.
    pub fn is_open(&self) -> bool {
        self.status != RestoreStatus::Restored
    }
}
