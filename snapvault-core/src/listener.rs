//! Mutation event listener
//!
//! Absorbs bursts of mutation notifications and reduces each burst to a
//! single flush. Trailing debounce: the quiet-period timer is re-armed on
//! every notification, and only a full quiet period with no activity
//! triggers a flush. An optional max-wait cap bounds how long a continuous
//! burst (e.g. a bulk import) may keep deferring the flush.
//!
//! The loop is the batch's single consumer: flushes are awaited in place,
//! so at most one is in flight and a burst arriving during a flush queues
//! in the channel rather than being dropped.

use crate::notification::{MutationNotification, PendingBatch};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tracing::debug;

/// Receives drained batches when a quiet period elapses.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn flush(&self, batch: PendingBatch);
}

/// Cloneable, non-blocking notification entry point handed to the host.
#[derive(Clone)]
pub struct ListenerHandle {
    tx: mpsc::UnboundedSender<MutationNotification>,
    enabled: Arc<AtomicBool>,
}

impl ListenerHandle {
    /// Buffer a notification for the next snapshot cycle. Never blocks the
    /// caller. While disabled, notifications are dropped without
    /// buffering.
    pub fn notify(&self, notification: MutationNotification) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        // a closed receiver means the project is shutting down; dropping
        // the notification is the correct outcome
        let _ = self.tx.send(notification);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }
}

/// The consumer half: owns the pending batch and the quiet-period timer.
pub struct MutationListener<S: BatchSink> {
    rx: mpsc::UnboundedReceiver<MutationNotification>,
    sink: Arc<S>,
    quiet_period: Duration,
    max_batch_wait: Option<Duration>,
}

impl<S: BatchSink> MutationListener<S> {
    pub fn new(
        quiet_period: Duration,
        max_batch_wait: Option<Duration>,
        sink: Arc<S>,
        enabled: Arc<AtomicBool>,
    ) -> (ListenerHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ListenerHandle { tx, enabled },
            Self {
                rx,
                sink,
                quiet_period,
                max_batch_wait,
            },
        )
    }

    /// Consume notifications until every handle is dropped, flushing a
    /// batch whenever a quiet period elapses. Spawn this on the runtime.
    pub async fn run(mut self) {
        let mut batch = PendingBatch::new();
        let mut deadline: Option<Instant> = None;

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(notification) => {
                        batch.push(notification);
                        deadline = Some(self.arm(&batch));
                    }
                    None => {
                        // project close: flush whatever is still buffered
                        let drained = batch.drain();
                        if !drained.is_empty() {
                            debug!(events = drained.len(), "flushing final batch on shutdown");
                            self.sink.flush(drained).await;
                        }
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    deadline = None;
                    let drained = batch.drain();
                    // the timer can fire against an already-drained batch;
                    // an empty flush is a no-op
                    if drained.is_empty() {
                        continue;
                    }
                    debug!(events = drained.len(), "quiet period elapsed");
                    self.sink.flush(drained).await;
                }
            }
        }
    }

    /// Next flush deadline: a full quiet period from now, clamped to the
    /// max-wait cap measured from the batch's first event.
    fn arm(&self, batch: &PendingBatch) -> Instant {
        let deadline = Instant::now() + self.quiet_period;
        match (self.max_batch_wait, batch.opened_at()) {
            (Some(cap), Some(opened)) => deadline.min(Instant::from_std(opened) + cap),
            _ => deadline,
        }
    }
}
