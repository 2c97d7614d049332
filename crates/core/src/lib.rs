//! repotrack core library.
//!
//! This crate tracks the state of git repositories and sets local changes
//! aside around disruptive operations: metadata reading and change
//! tracking, the change saver with its stash and shelve backends,
//! notifications, configuration, and a few working-tree helpers (status,
//! rollback, merge-base diff, annotate, branch name checks).

pub mod annotate;
pub mod branch;
pub mod config;
pub mod errors;
pub mod models;
pub mod notify;
pub mod repo;
pub mod saver;
pub mod worktree;

// Re-exports for convenience.
pub use config::AppConfig;
pub use errors::CoreError;
pub use models::{RepositorySnapshot, RepositoryState, SavedChangeSet};
pub use notify::Notifier;
pub use repo::{RepositoryManager, RepositoryReader, RepositoryTracker};
pub use saver::{ChangeSaver, SaveBackend, SaveRegistry};
