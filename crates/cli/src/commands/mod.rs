//! Subcommand implementations.

pub mod files;
pub mod repo;
pub mod saved;
pub mod style;

use anyhow::{Context, Result};
use dialoguer::Confirm;

/// Ask a yes/no question, defaulting to no.
pub fn confirm(prompt: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()
        .context("failed to read confirmation")
}
