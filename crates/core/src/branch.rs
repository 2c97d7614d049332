//! Validation of names for new local branches.

use tracing::debug;

use crate::errors::BranchNameError;
use crate::models::BranchSnapshot;

const FORBIDDEN_CHARS: &[char] = &[' ', '~', '^', ':', '?', '*', '[', '\\'];

/// Check `name` against git's ref-name rules.
pub fn validate_branch_name(name: &str) -> Result<(), BranchNameError> {
    if name.is_empty() {
        return Err(BranchNameError::Empty);
    }
    if name == "@" {
        return Err(BranchNameError::At);
    }
    if name.starts_with('-') {
        return Err(BranchNameError::LeadingDash);
    }
    if let Some(c) = name
        .chars()
        .find(|c| c.is_ascii_control() || FORBIDDEN_CHARS.contains(c))
    {
        return Err(BranchNameError::ForbiddenChar(c));
    }
    for seq in ["..", "@{"] {
        if name.contains(seq) {
            return Err(BranchNameError::ForbiddenSequence(seq));
        }
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(BranchNameError::BadSlash);
    }
    if name.ends_with('.') {
        return Err(BranchNameError::TrailingDot);
    }
    if let Some(bad) = name
        .split('/')
        .find(|c| c.starts_with('.') || c.ends_with(".lock"))
    {
        return Err(BranchNameError::BadComponent(bad.to_string()));
    }
    Ok(())
}

/// Check that `name` is valid and free to use as a new local branch.
///
/// A name is taken if it exists, or if it would be a directory of an
/// existing branch (`a` vs `a/b`) or live inside one (`a/b` vs `a`).
pub fn check_branch_available(name: &str, branches: &BranchSnapshot) -> Result<(), BranchNameError> {
    validate_branch_name(name)?;
    for existing in &branches.local {
        let existing = existing.name();
        if existing == name {
            return Err(BranchNameError::Exists(name.to_string()));
        }
        if is_path_prefix(existing, name) || is_path_prefix(name, existing) {
            debug!(name, existing, "branch name clashes with existing ref path");
            return Err(BranchNameError::PathClash {
                name: name.to_string(),
                existing: existing.to_string(),
            });
        }
    }
    Ok(())
}

fn is_path_prefix(prefix: &str, name: &str) -> bool {
    name.len() > prefix.len() && name.starts_with(prefix) && name.as_bytes()[prefix.len()] == b'/'
}
