//! Shared styling utilities for the CLI.

use console::Style;

use repotrack_core::models::{RepositoryState, RestoreStatus};

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Repository state, coloured by how unusual it is.
pub fn repo_state(state: RepositoryState) -> String {
    let style = match state {
        RepositoryState::Normal => Style::new().green(),
        RepositoryState::Detached => Style::new().yellow(),
        RepositoryState::Merging | RepositoryState::Rebasing => Style::new().red().bold(),
    };
    style.apply_to(state.to_string()).to_string()
}

pub fn restore_status(status: RestoreStatus) -> String {
    let style = match status {
        RestoreStatus::Restored => Style::new().green(),
        RestoreStatus::Pending => Style::new().dim(),
        RestoreStatus::FailedCleanly => Style::new().yellow(),
        RestoreStatus::Conflicted => Style::new().red().bold(),
    };
    style.apply_to(status.to_string()).to_string()
}

/// Marker for the current branch in listings (green dot).
pub fn current_marker() -> String {
    let style = Style::new().green();
    style.apply_to("●").to_string()
}
