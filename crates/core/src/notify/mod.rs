//! Notification subsystem for restore conflicts and save failures.
//!
//! The [`Notifier`] facade dispatches to every configured sink and logs
//! sink failures without aborting. It only errors when all sinks failed.

pub mod hook;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::errors::NotificationError;
use crate::models::SavedChangeSet;

/// What a notification is about.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    RestoreConflict,
    SaveFailed,
    Restored,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RestoreConflict => write!(f, "restore_conflict"),
            Self::SaveFailed => write!(f, "save_failed"),
            Self::Restored => write!(f, "restored"),
        }
    }
}

/// A user-facing message about a save/restore outcome.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub root: PathBuf,
    pub title: String,
    pub body: String,
}

/// Destination for notifications.
pub trait NotificationSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, notification: &Notification) -> Result<(), NotificationError>;
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, n: &Notification) -> Result<(), NotificationError> {
        match n.kind {
            NotificationKind::Restored => {
                info!(root = %n.root.display(), title = %n.title, "{}", n.body)
            }
            _ => warn!(root = %n.root.display(), kind = %n.kind, title = %n.title, "{}", n.body),
        }
        Ok(())
    }
}

/// Collects notifications in memory; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    received: Arc<Mutex<Vec<Notification>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.received.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    fn deliver(&self, n: &Notification) -> Result<(), NotificationError> {
        self.received
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(n.clone());
        Ok(())
    }
}

/// Unified notifier that dispatches to all configured sinks.
#[derive(Default)]
pub struct Notifier {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl Notifier {
    /// A notifier with no sinks; every notification is dropped.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Create a notifier from the notification configuration.
    pub fn new(config: &NotificationConfig) -> Self {
        let mut notifier = Self::default();
        if config.log {
            notifier = notifier.with_sink(LogSink);
        }
        if let Some(ref command) = config.hook_command {
            info!(command = %command, "hook notifications enabled");
            notifier = notifier.with_sink(hook::HookSink::new(command.clone()));
        }
        notifier
    }

    pub fn with_sink(mut self, sink: impl NotificationSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    /// Return whether any sink is configured.
    pub fn is_configured(&self) -> bool {
        !self.sinks.is_empty()
    }

    /// Deliver to every sink; fails only if all sinks failed.
    pub fn send(&self, notification: &Notification) -> Result<(), NotificationError> {
        let mut errors = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.deliver(notification) {
                warn!(sink = sink.name(), error = %e, "notification sink failed");
                errors.push(format!("{}: {}", sink.name(), e));
            }
        }
        if !self.sinks.is_empty() && errors.len() == self.sinks.len() {
            return Err(NotificationError::AllSinksFailed(errors.join("; ")));
        }
        Ok(())
    }

    /// Tell the user a saved change set could not be restored cleanly.
    pub fn notify_restore_conflict(&self, set: &SavedChangeSet) -> Result<(), NotificationError> {
        self.send(&format_restore_conflict(set))
    }

    /// Tell the user saving failed and nothing was set aside.
    pub fn notify_save_failed(&self, root: &Path, error: &str) -> Result<(), NotificationError> {
        self.send(&Notification {
            kind: NotificationKind::SaveFailed,
            root: root.to_path_buf(),
            title: "Couldn't save local changes".into(),
            body: format!(
                "Local changes in {} were left untouched: {}",
                root.display(),
                error
            ),
        })
    }

    pub fn notify_restored(&self, set: &SavedChangeSet) -> Result<(), NotificationError> {
        self.send(&Notification {
            kind: NotificationKind::Restored,
            root: set.root.clone(),
            title: "Local changes restored".into(),
            body: format!("Restored {} '{}' in {}", set.backend, set.label, set.root.display()),
        })
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.sinks.iter().map(|s| s.name()).collect();
        f.debug_struct("Notifier").field("sinks", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Formatting helpers
// ---------------------------------------------------------------------------

fn format_restore_conflict(set: &SavedChangeSet) -> Notification {
    let mut body = format!(
        "Saved changes '{}' ({}) could not be fully restored in {}.",
        set.label,
        set.backend,
        set.root.display()
    );
    if set.conflicted_files.is_empty() {
        body.push_str("\nNothing was applied.");
    } else {
        body.push_str("\nUnresolved files:");
        for file in &set.conflicted_files {
            body.push_str(&format!("\n  {}", file));
        }
    }
    body.push_str("\nThe saved changes were kept; resolve the files and run restore again.");
    Notification {
        kind: NotificationKind::RestoreConflict,
        root: set.root.clone(),
        title: "Local changes were not restored".into(),
        body,
    }
}
