use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::ExecutorError;
use crate::executor::{
    DepsAwareExecutor, DepsAwareTask, ResultHandle, TaskStatus, WorkerPool, first_pending, park,
};

/// Runs every task on a shared pool and hands back tasks that are not ready.
///
/// A worker that picks up a task whose prerequisites or dependencies are
/// still unfinished schedules them, then returns the task to
/// [`TaskStatus::NotScheduled`]. The task is queued again as soon as the
/// dependency it was waiting on is done. Workers never block on other tasks.
pub struct RequeueExecutor {
    pool: Arc<WorkerPool>,
}

impl RequeueExecutor {
    pub fn new(threads: usize) -> Result<Self, ExecutorError> {
        Self::with_stack_size(threads, None)
    }

    pub fn with_stack_size(
        threads: usize,
        stack_size: Option<usize>,
    ) -> Result<Self, ExecutorError> {
        Ok(Self {
            pool: WorkerPool::new("graft-requeue", threads, stack_size)?,
        })
    }
}

/// Queues the task unless someone else already did.
fn schedule<T>(pool: &Arc<WorkerPool>, task: &DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if !task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
        return;
    }

    let this = Arc::clone(pool);
    pool.spawn_task(task.clone(), move |task| run(&this, task));
}

fn run<T>(pool: &Arc<WorkerPool>, task: DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if !task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started) {
        // Cancelled while queued.
        return;
    }

    for edges in [task.prerequisites(), task.dependencies()] {
        let edges = match edges {
            Ok(edges) => edges,
            Err(err) => {
                task.resolve(Err(err));
                return;
            }
        };

        if let Some(waiting_on) = first_pending(&edges) {
            for dep in edges.iter() {
                schedule(pool, dep);
            }

            let this = Arc::clone(pool);
            park(task, waiting_on, move |task| schedule(&this, &task));
            return;
        }
    }

    trace!(task = task.id(), "running task");
    task.call();
}

impl<T> DepsAwareExecutor<T> for RequeueExecutor
where
    T: Clone + Send + Sync + 'static,
{
    fn submit(&self, task: &DepsAwareTask<T>) -> Result<ResultHandle<T>, ExecutorError> {
        self.pool.admit()?;
        schedule(&self.pool, task);
        Ok(task.handle())
    }

    fn close(&self) {
        self.pool.close();
    }

    fn shutdown(&self, timeout: Duration) -> bool {
        self.pool.shutdown(timeout)
    }

    fn is_shutdown(&self) -> bool {
        self.pool.is_shutdown()
    }
}

impl Drop for RequeueExecutor {
    fn drop(&mut self) {
        self.pool.close();
    }
}
