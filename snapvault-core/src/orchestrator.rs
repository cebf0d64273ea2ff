//! Snapshot lifecycle orchestration
//!
//! Composes the serialized store adapter, the revision store, and the
//! mutation listener behind one per-project handle, and enforces the
//! lifecycle invariants: no restore while a commit is in flight, no
//! notification buffering while a restore replaces the store, no silent
//! discard of un-flushed work.
//!
//! Exactly one orchestrator instance is active per open store; the host
//! process is single-instance per project, so exclusion is enforced by the
//! state flag rather than filesystem locking.

use crate::config::VcsConfig;
use crate::dump_store::{self, DumpSummary, LoadError};
use crate::error::{Result, VcsError};
use crate::listener::{BatchSink, ListenerHandle, MutationListener};
use crate::message;
use crate::notification::PendingBatch;
use crate::revision_store::{DiffEntry, RevisionError, RevisionStore, Snapshot};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Directory created next to the primary store file.
pub const VCS_DIR: &str = ".vcs";

/// Message of the first snapshot of every store.
pub const INITIAL_MESSAGE: &str = "initial snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Idle,
    Committing,
    Restoring,
}

/// Signal published to asynchronous UIs when a restore finishes.
#[derive(Debug, Clone)]
pub enum RestoreEvent {
    Completed { snapshot: Snapshot },
    Failed { reference: String, reason: String },
}

pub struct SnapshotOrchestrator {
    store_path: PathBuf,
    vcs_dir: PathBuf,
    config: VcsConfig,
    revisions: RevisionStore,
    state: Mutex<LifecycleState>,
    /// Serializes dump/commit/restore bodies. Commits queue on it; restore
    /// only try-locks so an in-flight commit rejects it with `Busy`.
    op_lock: tokio::sync::Mutex<()>,
    listener_enabled: Arc<AtomicBool>,
    restore_events: broadcast::Sender<RestoreEvent>,
}

impl SnapshotOrchestrator {
    /// Bind an orchestrator to the store at `store_path`. The `.vcs`
    /// directory is a sibling of the store file. An already-initialized
    /// store comes up Idle with the listener enabled.
    pub fn open(store_path: impl Into<PathBuf>, config: VcsConfig) -> Result<Arc<Self>> {
        let store_path = store_path.into();
        let project_dir = store_path.parent().ok_or_else(|| {
            VcsError::Configuration(format!(
                "store path {} has no parent directory",
                store_path.display()
            ))
        })?;
        let vcs_dir = project_dir.join(VCS_DIR);
        let revisions = RevisionStore::new(&vcs_dir, &config.git_binary);
        let initialized = revisions.is_initialized();
        let (restore_events, _) = broadcast::channel(16);

        Ok(Arc::new(Self {
            store_path,
            vcs_dir,
            config,
            revisions,
            state: Mutex::new(if initialized {
                LifecycleState::Idle
            } else {
                LifecycleState::Uninitialized
            }),
            op_lock: tokio::sync::Mutex::new(()),
            listener_enabled: Arc::new(AtomicBool::new(initialized)),
            restore_events,
        }))
    }

    /// Build the listener wired to this orchestrator. Spawn the returned
    /// `MutationListener::run` on the runtime and hand the
    /// `ListenerHandle` to the host's notification feed.
    pub fn listener(self: &Arc<Self>) -> (ListenerHandle, MutationListener<Self>) {
        MutationListener::new(
            self.config.quiet_period(),
            self.config.max_batch_wait(),
            Arc::clone(self),
            Arc::clone(&self.listener_enabled),
        )
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn vcs_dir(&self) -> &Path {
        &self.vcs_dir
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        *self.state.lock().unwrap()
    }

    /// Subscribe to restore-completed / restore-failed signals.
    pub fn subscribe(&self) -> broadcast::Receiver<RestoreEvent> {
        self.restore_events.subscribe()
    }

    /// Set up version control for the store: init the history backend,
    /// take the first dump, commit the first snapshot, enable the
    /// listener.
    pub async fn initialize(&self) -> Result<Snapshot> {
        let _guard = self.op_lock.lock().await;
        if self.lifecycle_state() != LifecycleState::Uninitialized
            || self.revisions.is_initialized()
        {
            return Err(VcsError::AlreadyInitialized(self.vcs_dir.clone()));
        }

        let backend = self
            .revisions
            .ensure_backend()
            .await
            .map_err(|e| VcsError::Configuration(e.to_string()))?;
        debug!(%backend, "history backend available");

        self.revisions.init().await?;
        self.config.save(&self.vcs_dir)?;
        self.dump_store().await?;
        let snapshot = self.revisions.commit(INITIAL_MESSAGE).await?;

        self.set_state(LifecycleState::Idle);
        self.listener_enabled.store(true, Ordering::SeqCst);
        info!(id = %snapshot.id, store = %self.store_path.display(), "version control initialized");
        Ok(snapshot)
    }

    /// The auto-commit operation: synthesize a message from the batch,
    /// dump the store, commit the result. Returns `None` when the flush
    /// turned out to be a no-op (empty batch, no file changes, or a batch
    /// flushed while a restore had the listener disabled).
    pub async fn commit_batch(&self, batch: PendingBatch) -> Result<Option<Snapshot>> {
        if batch.is_empty() {
            return Ok(None);
        }
        let message = message::synthesize(batch.events());
        let events = batch.len();
        let snapshot = self.commit_with_message(&message).await?;
        if let Some(snapshot) = &snapshot {
            info!(id = %snapshot.id, events, message = %snapshot.message, "snapshot committed");
        }
        Ok(snapshot)
    }

    /// Manual snapshot outside the notification flow (admin surface and
    /// pre-restore force commits).
    pub async fn commit_now(&self, message: &str) -> Result<Option<Snapshot>> {
        let snapshot = self.commit_with_message(message).await?;
        if let Some(snapshot) = &snapshot {
            info!(id = %snapshot.id, message, "manual snapshot committed");
        }
        Ok(snapshot)
    }

    async fn commit_with_message(&self, message: &str) -> Result<Option<Snapshot>> {
        let _guard = self.op_lock.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::Uninitialized => return Err(VcsError::NotInitialized),
                LifecycleState::Restoring => {
                    // backstop: the listener is disabled for the restore's
                    // duration, so batches racing it are dropped
                    debug!("dropping batch flushed during restore");
                    return Ok(None);
                }
                _ => *state = LifecycleState::Committing,
            }
        }

        let result = self.dump_and_commit(message).await;
        self.set_state(LifecycleState::Idle);
        match result {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(VcsError::Revision(RevisionError::NothingToCommit)) => {
                debug!("flush produced no changes, skipping snapshot");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn dump_and_commit(&self, message: &str) -> Result<Snapshot> {
        self.dump_store().await?;
        Ok(self.revisions.commit(message).await?)
    }

    /// Snapshots newest-first.
    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<Snapshot>> {
        self.require_initialized()?;
        Ok(self.revisions.log(limit).await?)
    }

    /// Per-unit changes between two snapshots.
    pub async fn view_diff(&self, from: &str, to: &str) -> Result<Vec<DiffEntry>> {
        self.require_initialized()?;
        Ok(self.revisions.diff(from, to).await?)
    }

    /// Whether the tracked directory differs from the head snapshot.
    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        self.require_initialized()?;
        Ok(self.revisions.has_uncommitted_changes().await?)
    }

    /// Replace the live store with the state captured at `reference`.
    ///
    /// The only destructive operation. Rejected with `Busy` while a commit
    /// is in flight and with `UncommittedChanges` while un-flushed work is
    /// outstanding; the listener is disabled for the duration so
    /// notifications arriving mid-restore are dropped, not buffered
    /// against a store about to be replaced.
    pub async fn restore(&self, reference: &str) -> Result<Snapshot> {
        let Ok(_guard) = self.op_lock.try_lock() else {
            return Err(VcsError::Busy);
        };
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LifecycleState::Uninitialized => return Err(VcsError::NotInitialized),
                LifecycleState::Idle => *state = LifecycleState::Restoring,
                // unreachable while the op lock is held, kept as a guard
                _ => return Err(VcsError::Busy),
            }
        }

        self.listener_enabled.store(false, Ordering::SeqCst);
        let result = self.restore_inner(reference).await;
        self.listener_enabled.store(true, Ordering::SeqCst);
        self.set_state(LifecycleState::Idle);

        match &result {
            Ok(snapshot) => {
                let _ = self.restore_events.send(RestoreEvent::Completed {
                    snapshot: snapshot.clone(),
                });
            }
            Err(e) => {
                let _ = self.restore_events.send(RestoreEvent::Failed {
                    reference: reference.to_string(),
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn restore_inner(&self, reference: &str) -> Result<Snapshot> {
        if self.revisions.has_uncommitted_changes().await? {
            return Err(VcsError::UncommittedChanges);
        }
        let target = self.revisions.resolve(reference).await?;
        self.revisions.checkout(&target).await?;

        if let Err(e) = self.load_store().await {
            return Err(self.recover_failed_load(e).await);
        }

        // Head must match the live store again afterwards: the marker
        // keeps history append-only and later restores unblocked.
        let short = &target[..target.len().min(12)];
        let snapshot = match self.revisions.commit(&format!("restore to {short}")).await {
            Ok(snapshot) => snapshot,
            // restoring the current head changes nothing in the tree
            Err(RevisionError::NothingToCommit) => self.revisions.head().await?,
            Err(e) => return Err(e.into()),
        };
        info!(id = %snapshot.id, reference, "restore completed");
        Ok(snapshot)
    }

    /// A load failure before the store swap leaves the primary untouched:
    /// roll the work tree back to head and keep the error retryable. From
    /// the swap onward the store's state is ambiguous and fatal.
    async fn recover_failed_load(&self, error: VcsError) -> VcsError {
        if let VcsError::Load(LoadError::SwapFailed {
            original_intact: false,
            ..
        }) = &error
        {
            return VcsError::CorruptedRestore(error.to_string());
        }
        match self.revisions.head().await {
            Ok(head) => {
                if let Err(rollback) = self.revisions.reset_tree_to(&head.id).await {
                    warn!(error = %rollback, "work-tree rollback after failed load");
                }
            }
            Err(e) => warn!(error = %e, "cannot resolve head for rollback"),
        }
        error
    }

    async fn dump_store(&self) -> Result<DumpSummary> {
        let source = self.store_path.clone();
        let dest = self.vcs_dir.clone();
        let exclude = self.config.exclude_units.clone();
        let summary = tokio::task::spawn_blocking(move || dump_store::dump(&source, &dest, &exclude))
            .await
            .map_err(|e| VcsError::TaskFailed(e.to_string()))??;
        Ok(summary)
    }

    async fn load_store(&self) -> Result<()> {
        let target = self.store_path.clone();
        let snapshot_dir = self.vcs_dir.clone();
        tokio::task::spawn_blocking(move || dump_store::load(&target, &snapshot_dir, true))
            .await
            .map_err(|e| VcsError::TaskFailed(e.to_string()))??;
        Ok(())
    }

    fn require_initialized(&self) -> Result<()> {
        if self.lifecycle_state() == LifecycleState::Uninitialized {
            return Err(VcsError::NotInitialized);
        }
        Ok(())
    }

    fn set_state(&self, next: LifecycleState) {
        *self.state.lock().unwrap() = next;
    }
}

#[async_trait]
impl BatchSink for SnapshotOrchestrator {
    /// Listener flush entry point. Dump/commit failures here are transient
    /// and deliberately swallowed after logging: later dumps are
    /// cumulative, so the next successful flush captures everything this
    /// cycle missed.
    async fn flush(&self, batch: PendingBatch) {
        if let Err(e) = self.commit_batch(batch).await {
            warn!(error = %e, "auto-commit failed; next flush will retry cumulatively");
        }
    }
}
