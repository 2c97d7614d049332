//! Working tree commands: status, rollback, annotate, diff-base.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use repotrack_core::annotate;
use repotrack_core::worktree::{self, ChangeKind, FileChange};

use super::style;

fn changes_table(changes: &[FileChange], with_staged: bool) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    if with_staged {
        table.set_header(vec!["Path", "Change", "Staged"]);
    } else {
        table.set_header(vec!["Path", "Change"]);
    }
    for c in changes {
        let mut row = vec![Cell::new(&c.path), Cell::new(c.kind.to_string())];
        if with_staged {
            row.push(Cell::new(if c.staged { "yes" } else { "" }));
        }
        table.add_row(row);
    }
    table
}

/// List uncommitted changes.
pub fn run_status(root: &Path, include_untracked: bool) -> Result<()> {
    let changes = worktree::status(root, include_untracked).context("failed to read status")?;
    if changes.is_empty() {
        println!();
        println!("{}", style::success("Working tree clean"));
        println!();
        return Ok(());
    }

    let conflicted = changes
        .iter()
        .filter(|c| c.kind == ChangeKind::Conflicted)
        .count();
    println!();
    println!("{}", style::header(&format!("Changes ({})", changes.len())));
    println!();
    println!("{}", changes_table(&changes, true));
    if conflicted > 0 {
        println!("{}", style::warn(&format!("{} file(s) have unresolved conflicts", conflicted)));
    }
    println!();
    Ok(())
}

/// Roll paths back to HEAD, asking first unless `yes`.
pub fn run_rollback(root: &Path, paths: &[PathBuf], yes: bool) -> Result<()> {
    if !yes {
        let prompt = format!(
            "Discard all changes to {} path(s)? New files will be deleted.",
            paths.len()
        );
        if !super::confirm(&prompt)? {
            println!("{}", style::dim("Aborted."));
            return Ok(());
        }
    }

    let summary = worktree::rollback(root, paths).context("rollback failed")?;
    for p in &summary.reverted {
        println!("{}", style::success(&format!("reverted {}", p)));
    }
    for p in &summary.removed {
        println!("{}", style::success(&format!("removed {}", p)));
    }
    Ok(())
}

/// Print per-line attribution of a committed file.
pub fn run_annotate(root: &Path, file: &Path) -> Result<()> {
    let cwd_relative = std::env::current_dir()
        .map(|cwd| cwd.join(file))
        .unwrap_or_else(|_| file.to_path_buf());
    let target = if file.is_absolute() || !cwd_relative.exists() {
        file.to_path_buf()
    } else {
        std::fs::canonicalize(&cwd_relative).unwrap_or(cwd_relative)
    };

    let lines = annotate::annotate(root, &target)
        .with_context(|| format!("failed to annotate {}", file.display()))?;
    let author_width = lines
        .iter()
        .map(|l| l.author.chars().count())
        .max()
        .unwrap_or(0)
        .min(20);
    let number_width = lines.len().to_string().len();

    for line in &lines {
        let author: String = line.author.chars().take(author_width).collect();
        println!(
            "{} {:<aw$} {} {:>nw$}) {}",
            style::dim(line.short_commit()),
            author,
            style::dim(&line.time.format("%Y-%m-%d").to_string()),
            line.line_number,
            line.content,
            aw = author_width,
            nw = number_width,
        );
    }
    Ok(())
}

/// Show what `branch` changed since it forked from HEAD.
pub fn run_diff_base(root: &Path, branch: &str) -> Result<()> {
    let diff = worktree::changes_since_merge_base(root, branch)
        .with_context(|| format!("failed to diff against {}", branch))?;

    println!();
    println!("  Merge base  {}", diff.merge_base);
    println!("  {:<11} {}", branch, diff.branch_tip);
    println!();
    if diff.changes.is_empty() {
        println!("{}", style::dim("No changes since the merge base."));
    } else {
        println!("{}", changes_table(&diff.changes, false));
    }
    println!();
    Ok(())
}
