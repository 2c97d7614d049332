//! Repository state commands: state, branches, watch, check-branch.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::{debug, info};

use repotrack_core::branch;
use repotrack_core::models::{BranchKind, BranchRef, RepositorySnapshot, SnapshotField};
use repotrack_core::repo::{RepositoryChangeEvent, RepositoryReader, RepositoryTracker};

use super::style;

/// Print the current snapshot.
pub fn run_state(reader: &RepositoryReader, json: bool) -> Result<()> {
    let snapshot = reader.try_read().context("failed to read repository metadata")?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("failed to encode snapshot")?
        );
        return Ok(());
    }

    println!();
    println!("{}", style::header(&snapshot.root.display().to_string()));
    println!("{}", "═".repeat(snapshot.root.display().to_string().chars().count().min(60)));
    println!();
    print_summary(&snapshot);
    println!();
    Ok(())
}

fn print_summary(snapshot: &RepositorySnapshot) {
    println!("  State      {}", style::repo_state(snapshot.state));
    println!(
        "  Branch     {}",
        snapshot
            .current_branch
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| style::dim("(detached)"))
    );
    println!(
        "  Revision   {}",
        snapshot
            .current_revision
            .as_deref()
            .map(str::to_string)
            .unwrap_or_else(|| style::dim("(no commits)"))
    );
    println!(
        "  Refs       {} local, {} remote, {} tags",
        snapshot.branches.local.len(),
        snapshot.branches.remote.len(),
        snapshot.branches.tags.len()
    );
}

/// List local branches, remote branches and tags.
pub fn run_branches(reader: &RepositoryReader) -> Result<()> {
    let snapshot = reader.try_read().context("failed to read repository metadata")?;
    if snapshot.branches.is_empty() {
        println!();
        println!("{}", style::dim("No branches yet."));
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["", "Name", "Kind", "Target"]);

    let all: Vec<&BranchRef> = snapshot
        .branches
        .local
        .iter()
        .chain(snapshot.branches.remote.iter())
        .chain(snapshot.branches.tags.iter())
        .collect();
    for b in all {
        let is_current = b.kind() == BranchKind::Local
            && snapshot.current_branch.as_deref() == Some(b.name());
        table.add_row(vec![
            Cell::new(if is_current { style::current_marker() } else { String::new() }),
            Cell::new(b.name()),
            Cell::new(b.kind().to_string()),
            Cell::new(b.short_target()),
        ]);
    }

    println!();
    println!("{}", table);
    println!();
    Ok(())
}

/// Check whether `name` can be used for a new local branch.
pub fn run_check_branch(reader: &RepositoryReader, name: &str) -> Result<()> {
    let snapshot = reader.read();
    match branch::check_branch_available(name, &snapshot.branches) {
        Ok(()) => {
            println!("{}", style::success(&format!("'{}' is available", name)));
            Ok(())
        }
        Err(e) => {
            println!("{}", style::error(&e.to_string()));
            anyhow::bail!("branch name '{}' cannot be used", name)
        }
    }
}

/// Poll the repository and print every state transition until Ctrl-C.
pub async fn run_watch(reader: RepositoryReader, interval_secs: u64) -> Result<()> {
    let tracker = Arc::new(RepositoryTracker::with_reader(reader));
    tracker.subscribe(print_event);

    println!();
    println!(
        "{}",
        style::header(&format!("Watching {}", tracker.root().display()))
    );
    println!("{}", style::dim("Press Ctrl-C to stop."));
    println!();
    print_summary(&tracker.snapshot());
    println!();

    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let t = Arc::clone(&tracker);
                let event = tokio::task::spawn_blocking(move || t.update())
                    .await
                    .context("tracker update panicked")?;
                if event.is_none() {
                    debug!("no change");
                }
            }
            _ = &mut ctrl_c => {
                info!("watch interrupted");
                break;
            }
        }
    }
    println!();
    Ok(())
}

fn print_event(event: &RepositoryChangeEvent) {
    let now = chrono::Local::now().format("%H:%M:%S").to_string();
    for field in &event.changed {
        let line = match field {
            SnapshotField::State => format!(
                "state {} → {}",
                style::repo_state(event.previous.state),
                style::repo_state(event.current.state)
            ),
            SnapshotField::CurrentBranch => format!(
                "branch {} → {}",
                event.previous.current_branch.as_deref().unwrap_or("(detached)"),
                event.current.current_branch.as_deref().unwrap_or("(detached)")
            ),
            SnapshotField::CurrentRevision => format!(
                "revision {} → {}",
                short(event.previous.current_revision.as_deref()),
                short(event.current.current_revision.as_deref())
            ),
            SnapshotField::Branches => format!(
                "refs now {} local, {} remote, {} tags",
                event.current.branches.local.len(),
                event.current.branches.remote.len(),
                event.current.branches.tags.len()
            ),
        };
        println!("  {} {}", style::dim(&now), line);
    }
}

fn short(revision: Option<&str>) -> &str {
    match revision {
        Some(r) => &r[..7.min(r.len())],
        None => "(none)",
    }
}
