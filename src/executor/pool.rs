use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{ExecutorError, TaskError};
use crate::executor::{DepsAwareTask, lock};

/// Fixed-size rayon pool shared by the scheduling strategies.
///
/// Besides running jobs, the pool keeps the bookkeeping every strategy needs
/// for shutdown: whether new submissions are still accepted, whether queued
/// jobs should be discarded instead of run, and how many jobs are in flight.
pub(crate) struct WorkerPool {
    pool: rayon::ThreadPool,
    accepting: AtomicBool,
    discarding: AtomicBool,
    pending: Mutex<usize>,
    idle: Condvar,
}

impl WorkerPool {
    pub(crate) fn new(
        name: &'static str,
        threads: usize,
        stack_size: Option<usize>,
    ) -> Result<Arc<Self>, ExecutorError> {
        let mut builder = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(move |i| format!("{name}-{i}"));

        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }

        let pool = builder.build()?;
        debug!(name, threads = pool.current_num_threads(), "worker pool started");

        Ok(Arc::new(Self {
            pool,
            accepting: AtomicBool::new(true),
            discarding: AtomicBool::new(false),
            pending: Mutex::new(0),
            idle: Condvar::new(),
        }))
    }

    /// Fails if the pool no longer takes external submissions.
    pub(crate) fn admit(&self) -> Result<(), ExecutorError> {
        if self.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ExecutorError::Rejected)
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        !self.accepting.load(Ordering::Acquire)
    }

    pub(crate) fn is_discarding(&self) -> bool {
        self.discarding.load(Ordering::Acquire)
    }

    /// Queues `run` for `task` at the back of the pool's queue. If the pool is
    /// closed by the time the job is picked up, the task is rejected instead.
    pub(crate) fn spawn_task<T, F>(self: &Arc<Self>, task: DepsAwareTask<T>, run: F)
    where
        T: Clone + Send + 'static,
        F: FnOnce(DepsAwareTask<T>) + Send + 'static,
    {
        *lock(&self.pending) += 1;

        let this = Arc::clone(self);
        self.pool.spawn_fifo(move || {
            if this.is_discarding() {
                trace!(task = task.id(), "discarding queued task");
                task.reject();
            } else {
                // Scheduling code must never take a worker thread down with it.
                let guard = task.clone();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| run(task))) {
                    guard.resolve(Err(TaskError::from_panic(payload)));
                }
            }

            this.finish_one();
        });
    }

    fn finish_one(&self) {
        let mut pending = lock(&self.pending);
        *pending -= 1;
        if *pending == 0 {
            self.idle.notify_all();
        }
    }

    /// Stops accepting work and discards everything not yet started.
    pub(crate) fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        self.discarding.store(true, Ordering::Release);
    }

    /// Stops accepting work and waits up to `timeout` for queued and running
    /// jobs to drain. Whatever is left afterwards is discarded.
    pub(crate) fn shutdown(&self, timeout: Duration) -> bool {
        self.accepting.store(false, Ordering::Release);

        // A deadline too far out to represent means waiting for as long as it
        // takes.
        let deadline = Instant::now().checked_add(timeout);
        let mut pending = lock(&self.pending);

        while *pending > 0 {
            pending = match deadline {
                None => self
                    .idle
                    .wait(pending)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.idle
                        .wait_timeout(pending, deadline - now)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                }
            };
        }

        let drained = *pending == 0;
        drop(pending);

        if !drained {
            debug!("shutdown timed out, discarding remaining tasks");
            self.discarding.store(true, Ordering::Release);
        }

        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(value: usize) -> DepsAwareTask<usize> {
        DepsAwareTask::new(Box::new(move || Ok(value)), None, None)
    }

    #[test]
    fn test_runs_job() {
        let pool = WorkerPool::new("test", 2, None).unwrap();
        let task = task(3);

        pool.spawn_task(task.clone(), |task| task.call());

        assert_eq!(task.wait().unwrap(), 3);
        assert!(pool.shutdown(Duration::from_secs(10)));
    }

    #[test]
    fn test_shutdown_without_deadline() {
        let pool = WorkerPool::new("test", 1, None).unwrap();
        let task: DepsAwareTask<usize> = DepsAwareTask::new(
            Box::new(|| {
                std::thread::sleep(Duration::from_millis(20));
                Ok(3)
            }),
            None,
            None,
        );

        pool.spawn_task(task.clone(), |task| task.call());

        assert!(pool.shutdown(Duration::MAX));
        assert!(pool.is_shutdown());
        assert!(!pool.is_discarding());
        assert_eq!(task.result().unwrap().unwrap(), 3);
    }

    #[test]
    fn test_close_rejects() {
        let pool = WorkerPool::new("test", 1, None).unwrap();
        pool.close();

        assert!(pool.is_shutdown());
        assert!(matches!(pool.admit(), Err(ExecutorError::Rejected)));

        let task = task(3);
        pool.spawn_task(task.clone(), |task| task.call());
        assert!(matches!(task.wait(), Err(TaskError::Rejected)));
    }

    #[test]
    fn test_panicking_job_fails_task() {
        let pool = WorkerPool::new("test", 1, None).unwrap();
        let task = task(3);

        pool.spawn_task(task.clone(), |_| panic!("scheduler bug"));

        let err = task.wait().unwrap_err();
        assert!(err.to_string().contains("scheduler bug"));

        // The worker survived and keeps running jobs.
        let next = self::task(4);
        pool.spawn_task(next.clone(), |task| task.call());
        assert_eq!(next.wait().unwrap(), 4);
    }
}
