//! Notification sink that runs an external command.
//!
//! The command is run through `sh -c` with the notification described in
//! environment variables and the body written to stdin.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use super::{Notification, NotificationSink};
use crate::errors::NotificationError;

/// Runs a shell command for every notification.
#[derive(Debug, Clone)]
pub struct HookSink {
    command: String,
}

impl HookSink {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

impl NotificationSink for HookSink {
    fn name(&self) -> &str {
        "hook"
    }

    fn deliver(&self, n: &Notification) -> Result<(), NotificationError> {
        debug!(command = %self.command, kind = %n.kind, "running notification hook");
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("REPOTRACK_KIND", n.kind.to_string())
            .env("REPOTRACK_ROOT", &n.root)
            .env("REPOTRACK_TITLE", &n.title)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NotificationError::HookFailed(format!("spawn '{}': {}", self.command, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A hook that ignores stdin may close it early.
            if let Err(e) = stdin.write_all(n.body.as_bytes()) {
                debug!(error = %e, "hook did not read stdin");
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| NotificationError::HookFailed(e.to_string()))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "notification hook failed");
            return Err(NotificationError::HookFailed(format!(
                "exit {}: {}",
                exit_code,
                stderr.trim()
            )));
        }
        Ok(())
    }
}
