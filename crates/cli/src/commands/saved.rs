//! Saving and restoring local changes: save, restore, saved, discard.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};

use repotrack_core::config::{AppConfig, SaverConfig};
use repotrack_core::models::{BackendKind, SavedChangeSet};
use repotrack_core::notify::Notifier;
use repotrack_core::saver::{self, ChangeSaver, SaveBackend, SaveRegistry, SaverPhase};

use super::style;

fn backend(config: &SaverConfig, kind: BackendKind) -> Arc<dyn SaveBackend> {
    let mut config = config.clone();
    config.backend = kind;
    saver::backend_from_config(&config)
}

/// Configured backend first, so its sets are handled before the other's.
fn all_backends(config: &SaverConfig) -> Vec<Arc<dyn SaveBackend>> {
    let other = match config.backend {
        BackendKind::Stash => BackendKind::Shelve,
        BackendKind::Shelve => BackendKind::Stash,
    };
    vec![backend(config, config.backend), backend(config, other)]
}

fn new_saver(config: &AppConfig, backend: Arc<dyn SaveBackend>, label: &str) -> ChangeSaver {
    ChangeSaver::new(
        backend,
        Arc::new(SaveRegistry::new()),
        Arc::new(Notifier::new(&config.notifications)),
        label,
    )
}

/// Set the working tree's uncommitted changes aside.
pub fn run_save(config: &AppConfig, root: &Path, label: &str, kind: Option<BackendKind>) -> Result<()> {
    let kind = kind.unwrap_or(config.saver.backend);
    for other in all_backends(&config.saver) {
        if !other.find_open(root).context("failed to look for saved changes")?.is_empty() {
            anyhow::bail!(
                "changes saved with the {} backend are still open; run 'repotrack restore' or 'repotrack discard' first",
                other.kind()
            );
        }
    }

    let mut saver = new_saver(config, backend(&config.saver, kind), label);
    let saved = saver
        .save(&[root.to_path_buf()])
        .context("failed to save local changes")?;

    match saved.first() {
        Some(set) => println!(
            "{}",
            style::success(&format!("Saved local changes as '{}' ({}, {})", set.label, set.backend, short_id(&set.id)))
        ),
        None => println!("{}", style::dim("Nothing to save, working tree is clean.")),
    }
    Ok(())
}

/// Restore every open change set of the repository.
pub fn run_restore(config: &AppConfig, root: &Path) -> Result<()> {
    let mut any = false;
    let mut unresolved: Vec<SavedChangeSet> = Vec::new();

    for backend in all_backends(&config.saver) {
        let mut saver = new_saver(config, backend, "restore");
        if saver.adopt(&[root.to_path_buf()]).context("failed to look for saved changes")? == 0 {
            continue;
        }
        any = true;
        let outcome = saver.load().context("failed to restore saved changes")?;
        for set in &outcome.restored {
            println!(
                "{}",
                style::success(&format!("Restored '{}' ({})", set.label, set.backend))
            );
        }
        unresolved.extend(outcome.unresolved);
    }

    if !any {
        println!("{}", style::dim("No saved changes to restore."));
        return Ok(());
    }
    if unresolved.is_empty() {
        return Ok(());
    }

    println!();
    for set in &unresolved {
        println!(
            "{}",
            style::warn(&format!(
                "'{}' ({}) was not restored: {}",
                set.label,
                set.backend,
                style::restore_status(set.status)
            ))
        );
        for file in &set.conflicted_files {
            println!("    {}", file);
        }
    }
    println!();
    println!(
        "{}",
        style::dim("Resolve the files above, then run 'repotrack restore' again.")
    );
    anyhow::bail!("{} saved change set(s) could not be restored", unresolved.len())
}

/// List open change sets from every backend.
pub fn run_saved(config: &AppConfig, root: &Path) -> Result<()> {
    let mut sets = Vec::new();
    for backend in all_backends(&config.saver) {
        sets.extend(backend.find_open(root).context("failed to list saved changes")?);
    }

    if sets.is_empty() {
        println!();
        println!("{}", style::success("No saved changes"));
        println!();
        return Ok(());
    }

    println!();
    println!("{}", style::header(&format!("Saved Changes ({})", sets.len())));
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["ID", "Label", "Backend", "Created"]);
    for set in &sets {
        table.add_row(vec![
            Cell::new(short_id(&set.id)),
            Cell::new(&set.label),
            Cell::new(set.backend.to_string()),
            Cell::new(
                set.created_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string(),
            ),
        ]);
    }
    println!("{}", table);
    println!();
    Ok(())
}

/// Drop every open change set without applying it.
pub fn run_discard(config: &AppConfig, root: &Path, yes: bool) -> Result<()> {
    let roots: Vec<PathBuf> = vec![root.to_path_buf()];
    let mut savers = Vec::new();
    let mut count = 0;
    for backend in all_backends(&config.saver) {
        let mut saver = new_saver(config, backend, "discard");
        count += saver.adopt(&roots).context("failed to look for saved changes")?;
        if saver.phase() == SaverPhase::Saved {
            savers.push(saver);
        }
    }

    if count == 0 {
        println!("{}", style::dim("No saved changes to discard."));
        return Ok(());
    }
    if !yes && !super::confirm(&format!("Discard {} saved change set(s)? This cannot be undone.", count))? {
        println!("{}", style::dim("Aborted."));
        return Ok(());
    }

    for mut saver in savers {
        saver.discard().context("failed to discard saved changes")?;
    }
    println!("{}", style::success(&format!("Discarded {} saved change set(s)", count)));
    Ok(())
}

fn short_id(id: &str) -> &str {
    &id[..8.min(id.len())]
}
