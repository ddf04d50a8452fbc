//! Task spawning for background jobs.
//!
//! Job queues never poll futures themselves; they hand them to a
//! [`TaskSpawner`] and receive results over a channel.

use std::future::Future;
use std::pin::Pin;

use crate::error::{Error, Result};

/// Boxed future produced by a job.
pub type JobFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'static>>;

/// Spawns background tasks on a Tokio runtime.
#[derive(Debug, Clone)]
pub struct TaskSpawner {
    handle: tokio::runtime::Handle,
}

impl TaskSpawner {
    /// Spawn onto the given runtime.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Spawn onto the runtime the caller is running inside.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Spawn a background task that runs to completion.
    ///
    /// For tasks that need to return values, use channels (e.g.
    /// `async_channel`) to communicate results back to the caller.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        // Running jobs are never aborted, so the join handle is not kept.
        drop(self.handle.spawn(future));
    }

    /// Run a job as its own task. The returned future resolves to the job's
    /// result, or to [`Error::TaskFailed`] if the task panicked.
    pub fn spawn_job<T: Send + 'static>(&self, job: JobFuture<T>) -> JobFuture<T> {
        let handle = self.handle.spawn(job);
        Box::pin(async move {
            handle.await.unwrap_or_else(|e| {
                Err(Error::TaskFailed {
                    detail: e.to_string(),
                })
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn explode() -> u32 {
        panic!("decoder blew up")
    }

    #[tokio::test]
    async fn test_spawn_job_returns_result() {
        let spawner = TaskSpawner::current();
        let job: JobFuture<u32> = Box::pin(async { Ok(7) });
        assert_eq!(spawner.spawn_job(job).await, Ok(7));
    }

    #[tokio::test]
    async fn test_panicking_job_becomes_error() {
        let spawner = TaskSpawner::current();
        let job: JobFuture<u32> = Box::pin(async { Ok(explode()) });
        assert!(matches!(
            spawner.spawn_job(job).await,
            Err(Error::TaskFailed { .. })
        ));
    }
}
