//! Dependency-aware executors.
//!
//! A [`DepsAwareExecutor`] runs [`DepsAwareTask`]s so that every task's
//! prerequisites and dependencies are done before its body starts, while
//! independent tasks run in parallel. Three strategies implement the same
//! contract:
//!
//! * [`RequeueExecutor`]: a worker that finds a task not ready hands it back
//!   and the task re-enters the queue once the dependency it waited for is
//!   done. Never blocks a worker.
//! * [`ToposortExecutor`]: discovers the reachable graph up front, orders it
//!   topologically (rejecting cycles) and releases tasks as their
//!   predecessors complete.
//! * [`LocalStackExecutor`]: a worker runs unfinished dependencies inline on
//!   its own stack, depth first, instead of handing them to the pool.

mod handle;
mod local_stack;
mod pool;
mod requeue;
mod task;
mod toposort;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::error::ExecutorError;

pub use crate::executor::handle::ResultHandle;
pub use crate::executor::local_stack::LocalStackExecutor;
pub use crate::executor::requeue::RequeueExecutor;
pub use crate::executor::task::{DepsAwareTask, TaskStatus};
pub use crate::executor::toposort::ToposortExecutor;

pub(crate) use crate::executor::pool::WorkerPool;

/// The computation a task runs once all of its dependencies are done.
pub type TaskBody<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

/// Produces the tasks another task waits for. May fail, which fails the task.
pub type DepsSupplier<T> = Box<dyn FnOnce() -> anyhow::Result<Vec<DepsAwareTask<T>>> + Send>;

/// Schedules [`DepsAwareTask`]s respecting their dependencies.
///
/// Tasks should be created through the executor that will run them.
/// Submitting a task that is already scheduled, running or done returns a
/// handle to the same result and never runs the body again.
pub trait DepsAwareExecutor<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// A task without dependencies.
    fn create_task(&self, body: TaskBody<T>) -> DepsAwareTask<T> {
        DepsAwareTask::new(body, None, None)
    }

    /// A task whose dependencies are produced by an infallible supplier.
    fn create_task_with_deps(
        &self,
        body: TaskBody<T>,
        deps: Box<dyn FnOnce() -> Vec<DepsAwareTask<T>> + Send>,
    ) -> DepsAwareTask<T> {
        DepsAwareTask::new(body, None, Some(Box::new(move || Ok(deps()))))
    }

    /// A task with two rounds of dependencies. `deps` is only evaluated once
    /// every task returned by `prereqs` is done.
    fn create_throwing_task(
        &self,
        body: TaskBody<T>,
        prereqs: DepsSupplier<T>,
        deps: DepsSupplier<T>,
    ) -> DepsAwareTask<T> {
        DepsAwareTask::new(body, Some(prereqs), Some(deps))
    }

    /// Schedules the task. Fails immediately once the executor is shut down.
    fn submit(&self, task: &DepsAwareTask<T>) -> Result<ResultHandle<T>, ExecutorError>;

    fn submit_all(
        &self,
        tasks: &[DepsAwareTask<T>],
    ) -> Result<Vec<ResultHandle<T>>, ExecutorError> {
        tasks.iter().map(|task| self.submit(task)).collect()
    }

    /// Stops accepting tasks and discards queued tasks that have not started.
    /// Discarded tasks resolve with [`crate::TaskError::Rejected`].
    fn close(&self);

    /// Stops accepting tasks and waits up to `timeout` for queued and running
    /// tasks to finish before discarding the rest. Returns `true` if nothing
    /// had to be discarded.
    fn shutdown(&self, timeout: Duration) -> bool;

    fn is_shutdown(&self) -> bool;
}

/// Locks a mutex, recovering the guard if a holder panicked. Panics in task
/// code are caught and turned into task failures, so the protected data is
/// still consistent.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns the first task in `tasks` that is not done yet.
pub(crate) fn first_pending<T>(tasks: &[DepsAwareTask<T>]) -> Option<&DepsAwareTask<T>> {
    tasks.iter().find(|task| !task.is_done())
}

/// Moves a started task back to `NotScheduled` and arranges for `resubmit` to
/// be called once `waiting_on` is done.
pub(crate) fn park<T, F>(task: DepsAwareTask<T>, waiting_on: &DepsAwareTask<T>, resubmit: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(DepsAwareTask<T>) + Send + 'static,
{
    if !task.compare_and_set_status(TaskStatus::Started, TaskStatus::NotScheduled) {
        // Cancelled while we were looking at it.
        return;
    }

    trace!(task = task.id(), waiting_on = waiting_on.id(), "parking task");
    waiting_on.on_done(move || resubmit(task));
}
