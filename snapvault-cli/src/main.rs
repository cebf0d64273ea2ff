//! Snapvault administration CLI
//!
//! Inspect and manage the snapshot history of a project store from the
//! command line: initialize, list history, view per-unit diffs, take
//! manual snapshots, and restore prior states.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use snapvault_core::orchestrator::VCS_DIR;
use snapvault_core::{ChangeKind, SnapshotOrchestrator, VcsConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "snapvault")]
#[command(author = "Snapvault Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Snapshot history administration for project stores")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize version control for a store
    Init {
        /// Path to the project's store file
        #[arg(short, long)]
        store: PathBuf,
    },

    /// List snapshot history, newest first
    Log {
        #[arg(short, long)]
        store: PathBuf,

        /// Maximum number of snapshots to show
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },

    /// Show per-unit changes between two snapshots
    Diff {
        #[arg(short, long)]
        store: PathBuf,

        /// Older snapshot reference
        from: String,

        /// Newer snapshot reference
        to: String,
    },

    /// Take a manual snapshot of the current store state
    Commit {
        #[arg(short, long)]
        store: PathBuf,

        #[arg(short, long, default_value = "manual snapshot")]
        message: String,
    },

    /// Restore the store to a prior snapshot
    Restore {
        #[arg(short, long)]
        store: PathBuf,

        /// Snapshot reference (id, short id, or e.g. HEAD~1)
        reference: String,

        /// Commit outstanding changes before restoring instead of failing
        #[arg(long)]
        force_commit: bool,
    },

    /// Show version-control status for a store
    Status {
        #[arg(short, long)]
        store: PathBuf,
    },
}

fn open(store: &Path) -> Result<Arc<SnapshotOrchestrator>> {
    let project_dir = store
        .parent()
        .with_context(|| format!("store path {} has no parent directory", store.display()))?;
    let config = VcsConfig::load(&project_dir.join(VCS_DIR))?;
    Ok(SnapshotOrchestrator::open(store, config)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init { store } => {
            let orchestrator = open(&store)?;
            let snapshot = orchestrator.initialize().await?;
            println!(
                "Initialized version control for {} (snapshot {})",
                store.display(),
                short(&snapshot.id)
            );
        }

        Commands::Log { store, limit } => {
            let orchestrator = open(&store)?;
            let snapshots = orchestrator.list_snapshots(limit).await?;
            if snapshots.is_empty() {
                println!("No snapshots yet");
            }
            for snapshot in snapshots {
                println!(
                    "{}  {}  {}",
                    short(&snapshot.id),
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.message
                );
            }
        }

        Commands::Diff { store, from, to } => {
            let orchestrator = open(&store)?;
            let entries = orchestrator.view_diff(&from, &to).await?;
            if entries.is_empty() {
                println!("No changes");
            }
            for entry in entries {
                let kind = match entry.change_kind {
                    ChangeKind::Added => "added",
                    ChangeKind::Modified => "modified",
                    ChangeKind::Deleted => "deleted",
                };
                println!(
                    "{kind:<9} {:<24} {} rows",
                    entry.unit_name, entry.affected_row_count
                );
            }
        }

        Commands::Commit { store, message } => {
            let orchestrator = open(&store)?;
            match orchestrator.commit_now(&message).await? {
                Some(snapshot) => println!("Committed snapshot {}", short(&snapshot.id)),
                None => println!("Nothing to commit"),
            }
        }

        Commands::Restore {
            store,
            reference,
            force_commit,
        } => {
            let orchestrator = open(&store)?;
            if force_commit && orchestrator.has_uncommitted_changes().await? {
                orchestrator
                    .commit_now("manual snapshot before restore")
                    .await?;
            }
            let snapshot = orchestrator.restore(&reference).await?;
            println!(
                "Restored {} to {} (snapshot {})",
                store.display(),
                reference,
                short(&snapshot.id)
            );
        }

        Commands::Status { store } => {
            let orchestrator = open(&store)?;
            match orchestrator.list_snapshots(1).await {
                Ok(snapshots) => match snapshots.first() {
                    Some(head) => {
                        println!("Initialized: yes");
                        println!("Head: {}  {}", short(&head.id), head.message);
                        println!(
                            "Uncommitted changes: {}",
                            if orchestrator.has_uncommitted_changes().await? {
                                "yes"
                            } else {
                                "no"
                            }
                        );
                    }
                    None => println!("Initialized: yes (no snapshots)"),
                },
                Err(snapvault_core::VcsError::NotInitialized) => {
                    println!("Initialized: no");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}
