//! Snapvault Core Library
//!
//! Automatic version control for a project's relational store:
//! - Mutation notification model (closed category set, pending batches)
//! - Debounced mutation listener (quiet-period coalescing)
//! - Serialized store adapter (SQLite <-> diffable dump directory)
//! - Revision store over a git history backend (commit/log/diff/checkout)
//! - Snapshot lifecycle orchestration (initialize / auto-commit / restore)
//! - Commit message synthesis

pub mod config;
pub mod dump_store;
pub mod error;
pub mod listener;
pub mod message;
pub mod notification;
pub mod orchestrator;
pub mod revision_store;

pub use config::VcsConfig;
pub use dump_store::{DumpError, DumpSummary, LoadError};
pub use error::{Result, VcsError};
pub use listener::{BatchSink, ListenerHandle, MutationListener};
pub use notification::{MutationCategory, MutationKind, MutationNotification, PendingBatch};
pub use orchestrator::{LifecycleState, RestoreEvent, SnapshotOrchestrator};
pub use revision_store::{ChangeKind, DiffEntry, RevisionError, RevisionStore, Snapshot};
