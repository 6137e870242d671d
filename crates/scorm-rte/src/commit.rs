//! Serialized, coalescing commit queue.
//!
//! Content-facing calls only enqueue; a single worker task per session runs
//! the commits one at a time. Requests that pile up while a commit is in
//! flight are merged into one, and the merged request is `finish` if any of
//! them was.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::transport::CommitReason;

/// Runs one commit. Implementations take their snapshot when called.
#[async_trait]
pub trait CommitExecutor: Send + Sync + 'static {
    /// Performs the commit. Failures are handled inside the executor.
    async fn execute(&self, reason: CommitReason);
}

#[derive(Debug, Clone, Copy)]
struct Ticket {
    seq: u64,
    reason: CommitReason,
}

/// Handle for enqueueing commits and waiting for them.
#[derive(Debug)]
pub struct CommitQueue {
    sender: mpsc::UnboundedSender<Ticket>,
    issued: Mutex<u64>,
    completed: watch::Receiver<u64>,
    executed: Arc<AtomicU64>,
}

impl CommitQueue {
    /// Starts the worker task and returns the queue handle.
    ///
    /// The worker exits once the queue is dropped and every queued request
    /// has run.
    #[must_use]
    pub fn spawn(executor: Arc<dyn CommitExecutor>) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (done_tx, completed) = watch::channel(0);
        let executed = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(run_worker(receiver, done_tx, executor, Arc::clone(&executed)));

        let queue = Self {
            sender,
            issued: Mutex::new(0),
            completed,
            executed,
        };
        (queue, handle)
    }

    /// Enqueues a commit without waiting for it.
    ///
    /// Returns the request's sequence number, or `None` if the worker is gone.
    pub fn request(&self, reason: CommitReason) -> Option<u64> {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let seq = *issued + 1;
        // Sending under the lock keeps channel order equal to sequence order.
        self.sender.send(Ticket { seq, reason }).ok()?;
        *issued = seq;
        debug!(seq, %reason, "Commit requested");
        Some(seq)
    }

    /// Waits until every request issued before this call has run.
    pub async fn flush(&self) {
        let target = self.requested();
        if target == 0 {
            return;
        }
        let mut completed = self.completed.clone();
        // An error means the worker stopped; nothing more will complete.
        let _ = completed.wait_for(|done| *done >= target).await;
    }

    /// Number of commit requests accepted so far.
    #[must_use]
    pub fn requested(&self) -> u64 {
        *self.issued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of commits the worker has run (after coalescing).
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::SeqCst)
    }

    /// Number of requests not yet covered by a finished commit.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.requested().saturating_sub(*self.completed.borrow())
    }
}

async fn run_worker(
    mut receiver: mpsc::UnboundedReceiver<Ticket>,
    done: watch::Sender<u64>,
    executor: Arc<dyn CommitExecutor>,
    executed: Arc<AtomicU64>,
) {
    while let Some(first) = receiver.recv().await {
        let mut reason = first.reason;
        let mut last = first.seq;
        let mut merged = 0usize;
        while let Ok(next) = receiver.try_recv() {
            reason = reason.merge(next.reason);
            last = next.seq;
            merged += 1;
        }
        if merged > 0 {
            debug!(merged, %reason, "Coalesced queued commits");
        }

        executor.execute(reason).await;
        executed.fetch_add(1, Ordering::SeqCst);
        done.send_replace(last);
    }
    debug!("Commit worker stopped");
}
