//! Bounded job pool that stops on the first error.
//!
//! Jobs run as tokio tasks; at most `limit` run at once. The first job that
//! fails cancels the shared [`CancellationToken`], so the remaining jobs can
//! bail out, and [`ErrgroupWorker::wait`] returns that first error.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Errors raised by the worker itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// The worker was canceled or a job failed.
    #[error("worker context canceled")]
    ContextCanceled,

    /// No more jobs are accepted.
    #[error("worker already done")]
    Done,

    /// A job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// Bounded pool of fallible jobs.
pub struct ErrgroupWorker<E> {
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    first_error: Arc<Mutex<Option<E>>>,
    done: AtomicBool,
}

impl<E> ErrgroupWorker<E>
where
    E: From<WorkerError> + Send + 'static,
{
    /// Create a worker running at most `limit` jobs at once.
    pub fn new(limit: usize) -> Self {
        Self::with_cancel(limit, CancellationToken::new())
    }

    /// Create a worker whose token is a child of `parent`.
    pub fn with_cancel(limit: usize, parent: CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            first_error: Arc::new(Mutex::new(None)),
            done: AtomicBool::new(false),
        }
    }

    /// Token canceled when the worker stops.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Schedule a job, waiting for a free slot.
    pub async fn new_job<F, Fut>(&self, job: F) -> Result<(), WorkerError>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        if self.done.load(Ordering::Acquire) {
            return Err(WorkerError::Done);
        }

        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return Err(WorkerError::ContextCanceled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| WorkerError::ContextCanceled)?
            }
        };

        let cancel = self.cancel.clone();
        let first_error = self.first_error.clone();

        self.tasks.lock().spawn(async move {
            let _permit = permit;

            if cancel.is_cancelled() {
                return;
            }

            if let Err(e) = job(cancel.clone()).await {
                let mut slot = first_error.lock();
                if slot.is_none() {
                    *slot = Some(e);
                }
                cancel.cancel();
            }
        });

        Ok(())
    }

    /// Stop accepting jobs.
    pub fn done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Cancel running jobs.
    pub fn close(&self) {
        self.done();
        self.cancel.cancel();
    }

    /// Wait for every scheduled job; returns the first error.
    pub async fn wait(&self) -> Result<(), E> {
        self.done();

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                trace!(error = %e, "worker job did not finish");
                if e.is_panic() {
                    let mut slot = self.first_error.lock();
                    if slot.is_none() {
                        *slot = Some(WorkerError::Panicked(e.to_string()).into());
                    }
                    self.cancel.cancel();
                }
            }
        }

        match self.first_error.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl<E> Drop for ErrgroupWorker<E> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, PartialEq, thiserror::Error)]
    enum TestError {
        #[error("worker: {0}")]
        Worker(#[from] WorkerError),
        #[error("job {0} failed")]
        Job(usize),
    }

    #[tokio::test]
    async fn test_runs_all_jobs() {
        let worker: ErrgroupWorker<TestError> = ErrgroupWorker::new(2);
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let count = count.clone();
            worker
                .new_job(move |_| async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        worker.wait().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_first_error_cancels_others() {
        let worker: ErrgroupWorker<TestError> = ErrgroupWorker::new(4);

        worker
            .new_job(|_| async { Err(TestError::Job(1)) })
            .await
            .unwrap();
        worker
            .new_job(|cancel| async move {
                tokio::select! {
                    _ = cancel.cancelled() => Ok(()),
                    _ = tokio::time::sleep(Duration::from_secs(10)) => Err(TestError::Job(2)),
                }
            })
            .await
            .ok();

        let err = tokio::time::timeout(Duration::from_secs(1), worker.wait())
            .await
            .expect("wait should return quickly")
            .unwrap_err();
        assert_eq!(err, TestError::Job(1));
    }

    #[tokio::test]
    async fn test_rejects_jobs_after_done() {
        let worker: ErrgroupWorker<TestError> = ErrgroupWorker::new(1);
        worker.done();

        let err = worker.new_job(|_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, WorkerError::Done);
    }

    #[tokio::test]
    async fn test_canceled_worker_rejects_jobs() {
        let parent = CancellationToken::new();
        let worker: ErrgroupWorker<TestError> = ErrgroupWorker::with_cancel(1, parent.clone());
        parent.cancel();

        let err = worker.new_job(|_| async { Ok(()) }).await.unwrap_err();
        assert_eq!(err, WorkerError::ContextCanceled);
    }
}
