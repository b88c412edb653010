//! Serial operation queue.
//!
//! Every store mutation from async callers goes through one worker task, so
//! operations run strictly one at a time in FIFO order even when their
//! callers race. A panicking operation fails its own caller and the worker
//! moves on to the next one.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::QueueError;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<Job>,
    pending: Arc<AtomicUsize>,
}

impl OperationQueue {
    /// Spawn the worker. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!("operation queue closed");
        });
        Self {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue an async operation and wait for its result.
    pub async fn enqueue<F, Fut, T>(&self, op: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let pending = Arc::clone(&self.pending);
        let job: Job = Box::pin(async move {
            let outcome = AssertUnwindSafe(async move { op().await })
                .catch_unwind()
                .await
                .map_err(|panic| {
                    let msg = panic_message(&panic);
                    error!(panic = %msg, "queued operation panicked");
                    QueueError::Panicked(msg)
                });
            let _ = pending.fetch_sub(1, Ordering::SeqCst);
            // Caller may have stopped waiting.
            let _ = reply_tx.send(outcome);
        });

        let _ = self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(job).is_err() {
            let _ = self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(QueueError::Closed);
        }
        reply_rx.await.map_err(|_| QueueError::Closed)?
    }

    /// Queue a synchronous operation.
    pub async fn run<F, T>(&self, op: F) -> Result<T, QueueError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(move || async move { op() }).await
    }

    /// Operations queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
