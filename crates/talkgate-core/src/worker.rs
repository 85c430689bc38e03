//! Bounded background queue for side effects that must not gate the conversation
//! (metric, metadata and message persistence).
//!
//! Overflow policy: when the queue is full the new job is dropped and a warning with the
//! running drop count is logged. `shutdown` closes the queue and waits for every accepted
//! job, which gives disconnect a completion point.

use crate::error::TalkResult;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = TalkResult<()>> + Send>>;

struct QueuedJob {
    name: &'static str,
    job: Job,
}

pub struct BackgroundWorker {
    sender: Mutex<Option<mpsc::Sender<QueuedJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    dropped: AtomicU64,
}

impl BackgroundWorker {
    /// Start the worker task. `capacity` is clamped to at least one slot.
    pub fn start(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedJob>(capacity.max(1));
        let handle = tokio::spawn(async move {
            while let Some(QueuedJob { name, job }) = rx.recv().await {
                if let Err(e) = job.await {
                    warn!(job = name, error = %e, "background job failed");
                }
            }
            debug!("background worker drained");
        });
        Self {
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue a job. Returns `false` if the job was dropped (queue full or shut down).
    pub fn submit<F>(&self, name: &'static str, job: F) -> bool
    where
        F: Future<Output = TalkResult<()>> + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(sender) = sender else {
            debug!(job = name, "background worker shut down, job discarded");
            return false;
        };
        match sender.try_send(QueuedJob {
            name,
            job: Box::pin(job),
        }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(job = name, dropped, "background queue full, job dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting jobs and wait for the accepted ones to finish.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "background worker task aborted");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn accepted_jobs_complete_before_shutdown_returns() {
        let worker = BackgroundWorker::start(8);
        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..5 {
            let counter = counter.clone();
            assert!(worker.submit("count", async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        worker.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert!(!worker.submit("late", async { Ok(()) }));
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let worker = BackgroundWorker::start(1);
        let gate = Arc::new(Notify::new());
        let started = Arc::new(Notify::new());
        {
            let gate = gate.clone();
            let started = started.clone();
            worker.submit("blocker", async move {
                started.notify_one();
                gate.notified().await;
                Ok(())
            });
        }
        started.notified().await;
        assert!(worker.submit("queued", async { Ok(()) }));
        assert!(!worker.submit("overflow", async { Ok(()) }));
        assert_eq!(worker.dropped(), 1);
        gate.notify_one();
        worker.shutdown().await;
    }
}
