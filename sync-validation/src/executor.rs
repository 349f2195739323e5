//! Scheduling primitives for the two execution domains.
//!
//! - [`ValidationPool`]: bounded pool for validator calls, which are
//!   blocking and possibly CPU-heavy.
//! - [`InFlight`]: counts stage work that is queued or running, so callers
//!   can wait for the pipeline to go quiet.

use std::sync::Arc;
use tokio::sync::{watch, AcquireError, Semaphore};
use tokio::task::JoinError;

/// Errors from running a job on the validation pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The pool's semaphore was closed.
    #[error("validation pool closed")]
    Closed(#[from] AcquireError),

    /// The job panicked or was cancelled.
    #[error("validation job failed: {0}")]
    Join(#[from] JoinError),
}

/// Bounded-concurrency pool for blocking validator calls.
#[derive(Debug, Clone)]
pub struct ValidationPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl ValidationPool {
    /// Create a pool allowing `size` concurrent jobs (at least 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Maximum concurrent jobs.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on the blocking thread pool once a permit is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = Arc::clone(&self.permits).acquire_owned().await?;
        let output = tokio::task::spawn_blocking(job).await?;
        Ok(output)
    }
}

/// Counter of in-flight stage work.
///
/// Incremented before work is handed to a domain and decremented once it has
/// run, after any follow-up work has been counted.
#[derive(Debug, Clone)]
pub struct InFlight {
    count: Arc<watch::Sender<usize>>,
}

impl InFlight {
    /// Create a counter at zero.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Count one unit of work.
    pub fn begin(&self) {
        self.count.send_modify(|n| *n += 1);
    }

    /// Mark one unit of work as finished.
    pub fn finish(&self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Units of work currently queued or running.
    pub fn current(&self) -> usize {
        *self.count.borrow()
    }

    /// Resolve once no work is queued or running.
    pub async fn wait_idle(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for InFlight {
    fn default() -> Self {
        Self::new()
    }
}
