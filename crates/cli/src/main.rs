//! repotrack command-line tool.
//!
//! Provides subcommands for inspecting repository state, watching it for
//! transitions, setting local changes aside and restoring them, a few
//! working-tree helpers, and generating / validating configuration files.

mod commands;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use repotrack_core::config::AppConfig;
use repotrack_core::models::BackendKind;
use repotrack_core::repo::RepositoryReader;

use commands::{files, repo, saved, style};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// repotrack command-line tool.
#[derive(Parser, Debug)]
#[command(
    name = "repotrack",
    version,
    about = "Track git repository state and set local changes aside"
)]
struct Cli {
    /// Repository to operate on (any path inside its working tree).
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Path to the TOML configuration file
    /// [default: <config dir>/repotrack/config.toml].
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level override: trace, debug, info, warn, error.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the repository state, current branch and revision.
    State {
        /// Print the snapshot as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List local branches, remote branches and tags.
    Branches,

    /// Print state transitions as they happen, until Ctrl-C.
    Watch {
        /// Seconds between checks [default: from config].
        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Set uncommitted changes aside and clean the working tree.
    Save {
        /// Label stored with the saved changes.
        #[arg(short, long, default_value = "repotrack save")]
        label: String,

        /// Backend to use: stash or shelve [default: from config].
        #[arg(short, long)]
        backend: Option<BackendKind>,
    },

    /// Re-apply saved changes.
    Restore,

    /// List saved changes that have not been restored.
    Saved,

    /// Drop saved changes without applying them.
    Discard {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show who last changed each line of a committed file.
    Annotate {
        /// File to annotate.
        file: PathBuf,
    },

    /// List files a branch changed since its merge base with HEAD.
    DiffBase {
        /// Branch, tag or commit.
        branch: String,
    },

    /// List uncommitted changes.
    Status,

    /// Discard changes to the given paths.
    Rollback {
        /// Paths to roll back.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Check whether a name can be used for a new branch.
    CheckBranch {
        /// Proposed branch name.
        name: String,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file [default: --config].
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    // A broken config still gets reported through logging at the default level.
    let config = AppConfig::load_or_default(&config_path);
    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().ok().map(|c| c.log_level.clone()))
        .unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli, &config_path, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(
    cli: Cli,
    config_path: &Path,
    config: Result<AppConfig, repotrack_core::errors::ConfigError>,
) -> Result<()> {
    match cli.command {
        Commands::Init { output } => cmd_init(output.as_deref().unwrap_or(config_path)),
        Commands::Validate => cmd_validate(config_path),
        command => {
            let config = config.context("failed to load configuration")?;
            let reader = open_repository(&cli.repo)?;
            let root = reader.root().to_path_buf();

            match command {
                Commands::State { json } => repo::run_state(&reader, json),
                Commands::Branches => repo::run_branches(&reader),
                Commands::Watch { interval } => {
                    let secs = interval.unwrap_or(config.tracker.poll_interval_secs).max(1);
                    repo::run_watch(reader, secs).await
                }
                Commands::CheckBranch { name } => repo::run_check_branch(&reader, &name),
                Commands::Save { label, backend } => saved::run_save(&config, &root, &label, backend),
                Commands::Restore => saved::run_restore(&config, &root),
                Commands::Saved => saved::run_saved(&config, &root),
                Commands::Discard { yes } => saved::run_discard(&config, &root, yes),
                Commands::Annotate { file } => files::run_annotate(&root, &file),
                Commands::DiffBase { branch } => files::run_diff_base(&root, &branch),
                Commands::Status => files::run_status(&root, config.saver.include_untracked),
                Commands::Rollback { paths, yes } => files::run_rollback(&root, &paths, yes),
                Commands::Init { .. } | Commands::Validate => unreachable!("handled above"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("repotrack")
        .join("config.toml")
}

fn open_repository(path: &Path) -> Result<RepositoryReader> {
    let reader = RepositoryReader::discover(path)
        .with_context(|| format!("no git repository at {}", path.display()))?;
    let root = std::fs::canonicalize(reader.root()).context("failed to resolve repository root")?;
    RepositoryReader::open(root).context("failed to open repository")
}

// ---------------------------------------------------------------------------
// Config subcommands
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() && !commands::confirm(&format!("{} already exists. Overwrite?", output.display()))? {
        println!("{}", style::dim("Aborted."));
        return Ok(());
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
    }

    let body = AppConfig::default().to_toml().context("failed to render default config")?;
    let text = format!("# repotrack configuration\n# Every field is optional.\n\n{}", body);
    std::fs::write(output, text).context("failed to write config file")?;

    println!("{}", style::success(&format!("Default configuration written to {}", output.display())));
    println!();
    println!("Next steps:");
    println!("  1. Pick a save backend in [saver] (stash or shelve)");
    println!("  2. Optionally set [notifications] hook_command");
    println!("  3. Validate with: repotrack validate --config {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let config = AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    match config.validate() {
        Ok(()) => println!("  [OK] All fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Log level        : {}", config.log_level);
    println!("  Save backend     : {}", config.saver.backend);
    println!("  Stash marker     : {}", config.saver.marker);
    println!("  Untracked files  : {}", if config.saver.include_untracked { "saved" } else { "left alone" });
    println!(
        "  Shelf directory  : {}",
        config
            .saver
            .shelf_dir
            .as_ref()
            .map(|d| d.display().to_string())
            .unwrap_or_else(|| "<git dir>/repotrack/shelf".to_string())
    );
    println!("  Poll interval    : {}s", config.tracker.poll_interval_secs);
    println!("  Log notifications: {}", if config.notifications.log { "on" } else { "off" });
    println!(
        "  Hook command     : {}",
        config.notifications.hook_command.as_deref().unwrap_or("not set")
    );
    println!();
    println!("Configuration is valid.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_save_with_backend() {
        let cli = Cli::try_parse_from(["repotrack", "save", "--label", "wip", "--backend", "shelve"]).unwrap();
        match cli.command {
            Commands::Save { label, backend } => {
                assert_eq!(label, "wip");
                assert_eq!(backend, Some(BackendKind::Shelve));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_rollback_requires_paths() {
        assert!(Cli::try_parse_from(["repotrack", "rollback"]).is_err());
    }

    #[test]
    fn test_init_writes_loadable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        cmd_init(&path).unwrap();
        let config = AppConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        cmd_validate(&path).unwrap();
    }
}
