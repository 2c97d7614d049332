//! Error types for the repotrack core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.
//!
//! A restore that collides with working-tree content is deliberately *not*
//! an error: it is reported as a [`RestoreStatus`](crate::models::RestoreStatus)
//! plus a notification.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Save(#[from] SaveError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Notification(#[from] NotificationError),

    #[error(transparent)]
    BranchName(#[from] BranchNameError),
}

// ---------------------------------------------------------------------------
// Metadata read errors
// ---------------------------------------------------------------------------

/// Failures while reading on-disk repository metadata.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The path is not (inside) a repository.
    #[error("not a repository: '{0}'")]
    NotARepository(String),

    /// A metadata file exists but could not be read.
    #[error("cannot read '{path}': {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `HEAD` holds neither a symbolic ref nor an object id.
    #[error("corrupt HEAD: {0:?}")]
    CorruptHead(String),

    /// A ref file holds something that is not an object id.
    #[error("corrupt ref '{name}': {content:?}")]
    CorruptRef { name: String, content: String },

    /// Symbolic refs point at each other more deeply than allowed.
    #[error("symbolic ref chain too deep starting at '{0}'")]
    SymbolicRefLoop(String),

    /// Underlying `git2` failure while locating the repository.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),
}

// ---------------------------------------------------------------------------
// Save / restore errors
// ---------------------------------------------------------------------------

/// Errors from the change saver and its backends.
#[derive(Debug, Error)]
pub enum SaveError {
    /// A saved change set is already open for this root.
    #[error("changes for '{}' are already saved and not yet restored", .0.display())]
    AlreadyOpen(PathBuf),

    /// The operation is not allowed in the saver's current phase.
    #[error("cannot {operation} while saver is {phase}")]
    InvalidPhase {
        operation: &'static str,
        phase: String,
    },

    /// The repository has no commits to reset to.
    #[error("repository at '{}' has no commits", .0.display())]
    NoCommits(PathBuf),

    /// The saved change set no longer exists in the backend.
    #[error("saved changes '{0}' not found")]
    NotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A working-tree operation failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// A shelf file could not be encoded or decoded.
    #[error("shelf format error: {0}")]
    ShelfFormat(String),

    /// Generic I/O wrapper.
    #[error("save I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serde_json::Error> for SaveError {
    fn from(err: serde_json::Error) -> Self {
        SaveError::ShelfFormat(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Git operation errors
// ---------------------------------------------------------------------------

/// Errors from annotate, diff, status and rollback operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, tag, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// The file is not present in the revision asked for.
    #[error("path not found in HEAD: {0}")]
    PathNotFound(String),

    /// HEAD does not point at a commit yet.
    #[error("HEAD is unborn")]
    UnbornHead,

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Branch name errors
// ---------------------------------------------------------------------------

/// Why a name cannot be used for a new local branch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BranchNameError {
    #[error("branch name is empty")]
    Empty,

    #[error("branch name must not start with '-'")]
    LeadingDash,

    #[error("branch name contains forbidden character {0:?}")]
    ForbiddenChar(char),

    #[error("branch name must not contain '{0}'")]
    ForbiddenSequence(&'static str),

    #[error("branch name must not start or end with '/' or contain '//'")]
    BadSlash,

    #[error("path component '{0}' must not start with '.' or end with '.lock'")]
    BadComponent(String),

    #[error("branch name must not end with '.'")]
    TrailingDot,

    #[error("'@' is not a valid branch name")]
    At,

    #[error("branch '{0}' already exists")]
    Exists(String),

    /// A branch can't be both a file and a directory under `refs/heads`.
    #[error("branch '{name}' clashes with existing branch '{existing}'")]
    PathClash { name: String, existing: String },
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Notification errors
// ---------------------------------------------------------------------------

/// Errors from the notification subsystem.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// The hook command could not be spawned or exited non-zero.
    #[error("hook command failed: {0}")]
    HookFailed(String),

    /// All notification sinks failed.
    #[error("all notification sinks failed: {0}")]
    AllSinksFailed(String),
}
