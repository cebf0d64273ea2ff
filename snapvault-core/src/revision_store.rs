//! Revision store
//!
//! Thin typed wrapper over the `git` executable. The tracked directory is
//! `<project>/.vcs`; history lives beside the units in
//! `<project>/.vcs/history` (the git dir, selected via environment so no
//! absolute path is baked into the project). Every operation shells out
//! and surfaces stderr as a typed error value.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Directory under the work tree holding the history backend's own data.
pub const HISTORY_DIR: &str = "history";

/// Work-tree paths never committed: the git dir itself, the dump staging
/// area, and the per-store configuration.
const EXCLUDED_PATHS: &str = "history/\n.staging/\nconfig.json\n";

pub type Result<T> = std::result::Result<T, RevisionError>;

#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error("version-control backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("revision store is not initialized")]
    NotInitialized,

    #[error("revision store already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("nothing to commit")]
    NothingToCommit,

    #[error("tracked directory has uncommitted changes")]
    UncommittedChanges,

    #[error("unknown revision reference '{0}'")]
    UnknownRef(String),

    #[error("`git {command}` failed: {stderr}")]
    Backend { command: String, stderr: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One committed revision of the serialized store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// Every snapshot except the very first has a parent.
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Per-unit change between two snapshots; computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub unit_name: String,
    pub change_kind: ChangeKind,
    pub affected_row_count: u64,
}

pub struct RevisionStore {
    work_tree: PathBuf,
    git_dir: PathBuf,
    git_binary: String,
}

impl RevisionStore {
    pub fn new(work_tree: impl Into<PathBuf>, git_binary: impl Into<String>) -> Self {
        let work_tree = work_tree.into();
        let git_dir = work_tree.join(HISTORY_DIR);
        Self {
            work_tree,
            git_dir,
            git_binary: git_binary.into(),
        }
    }

    pub fn work_tree(&self) -> &Path {
        &self.work_tree
    }

    /// Probe the backend executable. Absence is a configuration error at
    /// startup, never a per-operation failure.
    pub async fn ensure_backend(&self) -> Result<String> {
        let output = Command::new(&self.git_binary)
            .arg("--version")
            .output()
            .await
            .map_err(|e| {
                RevisionError::BackendUnavailable(format!("{}: {e}", self.git_binary))
            })?;
        if !output.status.success() {
            return Err(RevisionError::BackendUnavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn is_initialized(&self) -> bool {
        self.git_dir.join("HEAD").exists()
    }

    /// Create the history backend under the work tree.
    pub async fn init(&self) -> Result<()> {
        if self.is_initialized() {
            return Err(RevisionError::AlreadyInitialized(self.git_dir.clone()));
        }
        fs::create_dir_all(&self.work_tree)?;
        self.run(["init", "--quiet"]).await?;

        // Commits must not depend on the user's global identity.
        self.run(["config", "user.name", "snapvault"]).await?;
        self.run(["config", "user.email", "snapvault@localhost"]).await?;
        self.run(["config", "commit.gpgsign", "false"]).await?;

        let info_dir = self.git_dir.join("info");
        fs::create_dir_all(&info_dir)?;
        fs::write(info_dir.join("exclude"), EXCLUDED_PATHS)?;

        debug!(git_dir = %self.git_dir.display(), "revision store initialized");
        Ok(())
    }

    /// Stage everything under the work tree and commit it.
    ///
    /// An unchanged tree yields `NothingToCommit`, which is what makes an
    /// empty batch flush a safe no-op end to end.
    pub async fn commit(&self, message: &str) -> Result<Snapshot> {
        if !self.is_initialized() {
            return Err(RevisionError::NotInitialized);
        }
        self.run(["add", "--all"]).await?;
        let status = self.run(["status", "--porcelain"]).await?;
        if status.trim().is_empty() {
            return Err(RevisionError::NothingToCommit);
        }
        self.run(["commit", "--quiet", "-m", message]).await?;
        self.head().await
    }

    /// Most recent snapshot on the active line.
    pub async fn head(&self) -> Result<Snapshot> {
        self.log(1)
            .await?
            .into_iter()
            .next()
            .ok_or(RevisionError::NotInitialized)
    }

    /// Snapshots newest-first, at most `limit`.
    pub async fn log(&self, limit: usize) -> Result<Vec<Snapshot>> {
        if !self.is_initialized() {
            return Err(RevisionError::NotInitialized);
        }
        // An initialized store with no commits yet has an unborn HEAD.
        if self
            .run(["rev-parse", "--verify", "--quiet", "HEAD"])
            .await
            .is_err()
        {
            return Ok(Vec::new());
        }

        let output = self
            .run([
                "log",
                "--format=%H%x1f%P%x1f%ct%x1f%s%x1e",
                "-n",
                &limit.to_string(),
            ])
            .await?;

        let mut snapshots = Vec::new();
        for record in output.split('\u{1e}') {
            let record = record.trim();
            if record.is_empty() {
                continue;
            }
            let fields: Vec<&str> = record.split('\u{1f}').collect();
            if fields.len() != 4 {
                return Err(RevisionError::Backend {
                    command: "log".to_string(),
                    stderr: format!("unparseable log record: {record:?}"),
                });
            }
            let created_at = fields[2]
                .parse::<i64>()
                .ok()
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .ok_or_else(|| RevisionError::Backend {
                    command: "log".to_string(),
                    stderr: format!("bad commit timestamp {:?}", fields[2]),
                })?;
            snapshots.push(Snapshot {
                id: fields[0].to_string(),
                // merge parents never occur here; the first parent is the line
                parent_id: fields[1].split_whitespace().next().map(str::to_string),
                created_at,
                message: fields[3].to_string(),
            });
        }
        Ok(snapshots)
    }

    /// Resolve a symbolic reference (`HEAD~1`, a short id, ...) to a full
    /// snapshot id.
    pub async fn resolve(&self, reference: &str) -> Result<String> {
        match self
            .run(["rev-parse", "--verify", "--quiet", &format!("{reference}^{{commit}}")])
            .await
        {
            Ok(id) => Ok(id.trim().to_string()),
            Err(RevisionError::Backend { .. }) => {
                Err(RevisionError::UnknownRef(reference.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// Per-unit changes between two snapshots.
    pub async fn diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        let from = self.resolve(from).await?;
        let to = self.resolve(to).await?;

        // One row per line by construction of the dump format, so numstat
        // line counts are row counts.
        let numstat = self.run(["diff", "--numstat", &from, &to]).await?;
        let mut counts: HashMap<String, (u64, u64)> = HashMap::new();
        for line in numstat.lines() {
            let mut parts = line.split('\t');
            let (Some(added), Some(deleted), Some(path)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            counts.insert(
                path.to_string(),
                (
                    added.parse().unwrap_or(0),
                    deleted.parse().unwrap_or(0),
                ),
            );
        }

        let status = self.run(["diff", "--name-status", &from, &to]).await?;
        let mut entries = Vec::new();
        for line in status.lines() {
            let mut parts = line.split('\t');
            let (Some(code), Some(path)) = (parts.next(), parts.next()) else {
                continue;
            };
            // Renames carry old and new paths; the new one is the unit.
            let path = if code.starts_with('R') {
                parts.next().unwrap_or(path)
            } else {
                path
            };
            let change_kind = match code.chars().next() {
                Some('A') => ChangeKind::Added,
                Some('D') => ChangeKind::Deleted,
                _ => ChangeKind::Modified,
            };
            let (added, deleted) = counts.get(path).copied().unwrap_or((0, 0));
            let affected_row_count = match change_kind {
                ChangeKind::Added => added,
                ChangeKind::Deleted => deleted,
                ChangeKind::Modified => added.max(deleted),
            };
            entries.push(DiffEntry {
                unit_name: unit_name(path),
                change_kind,
                affected_row_count,
            });
        }
        entries.sort_by(|a, b| a.unit_name.cmp(&b.unit_name));
        Ok(entries)
    }

    /// Make the work tree match `reference` exactly.
    ///
    /// Refuses when the tree differs from head: a checkout then would
    /// silently discard un-flushed work. History is never rewritten: the
    /// branch head stays put and a later commit records the rollback.
    pub async fn checkout(&self, reference: &str) -> Result<()> {
        if self.has_uncommitted_changes().await? {
            return Err(RevisionError::UncommittedChanges);
        }
        let id = self.resolve(reference).await?;
        self.reset_tree_to(&id).await
    }

    /// Reset index and work tree to `id` without preconditions. Used by
    /// `checkout` and by restore rollback, where the tree is dirty by
    /// definition.
    pub(crate) async fn reset_tree_to(&self, id: &str) -> Result<()> {
        self.run(["read-tree", "--reset", "-u", id]).await?;
        Ok(())
    }

    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        if !self.is_initialized() {
            return Err(RevisionError::NotInitialized);
        }
        let status = self.run(["status", "--porcelain"]).await?;
        Ok(!status.trim().is_empty())
    }

    async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let output = Command::new(&self.git_binary)
            .args(&args)
            .current_dir(&self.work_tree)
            .env("GIT_DIR", &self.git_dir)
            .env("GIT_WORK_TREE", &self.work_tree)
            .output()
            .await?;

        if !output.status.success() {
            let command = args
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            return Err(RevisionError::Backend {
                command,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `code_text.dump` -> `code_text`; anything else keeps its file name.
fn unit_name(path: &str) -> String {
    path.strip_suffix(".dump").unwrap_or(path).to_string()
}
