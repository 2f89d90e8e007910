// Bounded pool for blocking work (image decode/encode, file I/O, reaping).
// Jobs run on tokio's blocking threads; the semaphore caps how many run at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker pool is shut down")]
    ShutDown,
    #[error("worker job panicked")]
    Panicked,
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    closing: Arc<AtomicBool>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        tracing::info!("Worker pool started with {} slot(s)", size);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            closing: Arc::new(AtomicBool::new(false)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Runs `job` once a slot is free.
    pub async fn run<F, T>(&self, job: F) -> Result<T, WorkerError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.closing.load(Ordering::Acquire) {
            return Err(WorkerError::ShutDown);
        }

        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::ShutDown)?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job()
        })
        .await
        .map_err(|err| {
            if err.is_panic() {
                WorkerError::Panicked
            } else {
                WorkerError::ShutDown
            }
        })
    }

    /// Stops admitting jobs and waits up to `grace` for running ones.
    /// Returns `false` if the grace period ran out first.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.closing.store(true, Ordering::Release);

        let size = u32::try_from(self.size).unwrap_or(u32::MAX);
        // Waiters are served in order, so this queues ahead of any late arrivals.
        let drained = tokio::time::timeout(grace, self.permits.acquire_many(size)).await;
        self.permits.close();

        match drained {
            Ok(Ok(_all)) => {
                tracing::info!("Worker pool drained");
                true
            }
            Ok(Err(_)) => true,
            Err(_) => {
                tracing::warn!(
                    "Worker pool still busy after {:?}, abandoning in-flight jobs",
                    grace
                );
                false
            }
        }
    }
}
