//! Repository state tracking.
//!
//! - [`reader`] parses on-disk metadata into a [`RepositorySnapshot`](crate::models::RepositorySnapshot).
//! - [`tracker`] compares successive snapshots and publishes change events.
//! - [`manager`] keeps one tracker per repository root.

pub mod manager;
pub mod reader;
pub mod refs;
pub mod tracker;

pub use manager::RepositoryManager;
pub use reader::RepositoryReader;
pub use tracker::{ListenerId, RepositoryChangeEvent, RepositoryListener, RepositoryTracker};
