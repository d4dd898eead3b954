//! Bounded worker pool for query planning and execution
//!
//! A fixed `rayon` pool runs the blocking work; the async request handler
//! awaits the outcome through a oneshot channel. When every worker is busy new
//! jobs wait in the pool's queue, which is the server's only admission
//! control.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::QueryError;

pub struct WorkerPool {
    pool: rayon::ThreadPool,
    num_threads: usize,
    queued_or_running: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// `num_threads == 0` uses one thread per CPU
    pub fn new(num_threads: usize) -> Result<Self, QueryError> {
        let num_threads = if num_threads == 0 {
            num_cpus::get()
        } else {
            num_threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|i| format!("query-worker-{i}"))
            .panic_handler(|payload| {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(panic = %message, "worker_panicked");
            })
            .build()
            .map_err(|e| QueryError::internal(format!("Could not start worker pool: {e}")))?;
        tracing::info!(num_threads, "worker_pool_started");
        Ok(WorkerPool {
            pool,
            num_threads,
            queued_or_running: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Jobs submitted but not yet finished
    pub fn pending(&self) -> usize {
        self.queued_or_running.load(Ordering::Relaxed)
    }

    /// Run `job` on a worker and await its result.
    ///
    /// A job that panics resolves to [`QueryError::Internal`].
    pub async fn compute<T, F>(&self, job: F) -> Result<T, QueryError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, QueryError> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let counter = Arc::clone(&self.queued_or_running);
        counter.fetch_add(1, Ordering::Relaxed);
        self.pool.spawn(move || {
            let pending = PendingGuard(counter);
            let outcome = job();
            drop(pending);
            // The receiver is gone when the request was dropped; nothing to do
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| {
            QueryError::internal("The computation on the worker pool ended without a result")
        })?
    }
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("num_threads", &self.num_threads)
            .field("pending", &self.pending())
            .finish()
    }
}
