//! Error taxonomy for the versioning subsystem
//!
//! Configuration problems are fatal at initialization; dump/commit
//! failures on the auto-commit path are transient and self-healing (the
//! next successful flush captures cumulative changes); invariant
//! violations (`Busy`, `UncommittedChanges`) are returned synchronously
//! and never retried automatically; `CorruptedRestore` is fatal and
//! requires manual intervention.

use crate::dump_store::{DumpError, LoadError};
use crate::revision_store::RevisionError;
use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, VcsError>;

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// Missing backend tool or unusable directory. Surfaced immediately at
    /// initialization, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("version control already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("version control is not initialized for this store")]
    NotInitialized,

    /// A snapshot operation is in flight; the caller may retry once it
    /// drains.
    #[error("a snapshot operation is in flight")]
    Busy,

    /// The tracked directory differs from the head snapshot; restoring now
    /// would silently discard un-flushed work. The caller must force a
    /// commit first.
    #[error("uncommitted changes present; commit before restoring")]
    UncommittedChanges,

    /// The primary store was partially replaced and could not be rolled
    /// back. Non-retryable; the host must surface a blocking error.
    #[error("restore left the primary store in an ambiguous state: {0}")]
    CorruptedRestore(String),

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Revision(#[from] RevisionError),

    #[error("background task failed: {0}")]
    TaskFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
