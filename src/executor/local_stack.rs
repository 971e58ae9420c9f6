use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use crate::error::ExecutorError;
use crate::executor::{
    DepsAwareExecutor, DepsAwareTask, ResultHandle, TaskStatus, WorkerPool, first_pending, park,
};

/// Worker stack size used unless configured otherwise. Inline execution
/// recurses once per level of the dependency graph.
pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Dependencies deeper than this are handed to the pool instead of being run
/// inline.
const MAX_INLINE_DEPTH: usize = 256;

thread_local! {
    static DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Self {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        DepthGuard
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Runs unfinished dependencies depth first on the worker that needs them.
///
/// When a worker finds that a task's dependency has not been scheduled yet,
/// it claims the dependency and runs it right away on its own stack, then
/// continues with the task. Dependencies that some other worker is already
/// running are waited for the same way [`super::RequeueExecutor`] does: the
/// task is handed back and queued again once the dependency is done.
pub struct LocalStackExecutor {
    pool: Arc<WorkerPool>,
}

impl LocalStackExecutor {
    pub fn new(threads: usize) -> Result<Self, ExecutorError> {
        Self::with_stack_size(threads, None)
    }

    pub fn with_stack_size(
        threads: usize,
        stack_size: Option<usize>,
    ) -> Result<Self, ExecutorError> {
        let stack_size = stack_size.unwrap_or(DEFAULT_STACK_SIZE);
        Ok(Self {
            pool: WorkerPool::new("graft-stack", threads, Some(stack_size))?,
        })
    }
}

fn schedule<T>(pool: &Arc<WorkerPool>, task: &DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if task.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
        spawn(pool, task.clone());
    }
}

fn spawn<T>(pool: &Arc<WorkerPool>, task: DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    let this = Arc::clone(pool);
    pool.spawn_task(task, move |task| {
        if task.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started) {
            execute(&this, task);
        }
    });
}

/// Runs a dependency on the current stack if nobody else has claimed it.
fn run_inline<T>(pool: &Arc<WorkerPool>, dep: &DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    if !dep.compare_and_set_status(TaskStatus::NotScheduled, TaskStatus::Scheduled) {
        return;
    }

    if DEPTH.with(Cell::get) >= MAX_INLINE_DEPTH {
        trace!(task = dep.id(), "inline depth exhausted, queueing");
        spawn(pool, dep.clone());
        return;
    }

    if dep.compare_and_set_status(TaskStatus::Scheduled, TaskStatus::Started) {
        trace!(task = dep.id(), "running dependency inline");
        let _depth = DepthGuard::enter();
        execute(pool, dep.clone());
    }
}

/// Drives a started task to completion, or parks it on a dependency another
/// worker is still busy with.
fn execute<T>(pool: &Arc<WorkerPool>, task: DepsAwareTask<T>)
where
    T: Clone + Send + Sync + 'static,
{
    for edges in [task.prerequisites(), task.dependencies()] {
        let edges = match edges {
            Ok(edges) => edges,
            Err(err) => {
                task.resolve(Err(err));
                return;
            }
        };

        for dep in edges.iter() {
            if pool.is_discarding() {
                task.reject();
                return;
            }
            run_inline(pool, dep);
        }

        if let Some(waiting_on) = first_pending(&edges) {
            let this = Arc::clone(pool);
            park(task, waiting_on, move |task| schedule(&this, &task));
            return;
        }
    }

    task.call();
}

impl<T> DepsAwareExecutor<T> for LocalStackExecutor
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

impl Drop for LocalStackExecutor {
    fn drop(&mut self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TaskBody;
    use std::sync::Mutex;
    use std::thread::{self, ThreadId};

    #[test]
    fn test_dependencies_run_on_same_worker() {
        let executor = LocalStackExecutor::new(4).unwrap();
        let threads: Arc<Mutex<Vec<ThreadId>>> = Arc::default();

        let mut prev: Option<DepsAwareTask<usize>> = None;
        for i in 0..3 {
            let t = threads.clone();
            let body: TaskBody<usize> = Box::new(move || {
                t.lock().unwrap().push(thread::current().id());
                Ok(i)
            });
            let deps: Vec<_> = prev.take().into_iter().collect();
            prev = Some(executor.create_task_with_deps(body, Box::new(move || deps)));
        }

        assert_eq!(executor.submit(&prev.unwrap()).unwrap().wait().unwrap(), 2);

        let threads = threads.lock().unwrap();
        assert_eq!(threads.len(), 3);
        assert!(threads.iter().all(|id| *id == threads[0]));
    }

    #[test]
    fn test_chain_deeper_than_inline_limit() {
        let executor = LocalStackExecutor::new(2).unwrap();

        let mut prev: Option<DepsAwareTask<usize>> = None;
        for i in 0..(MAX_INLINE_DEPTH * 2) {
            let body: TaskBody<usize> = Box::new(move || Ok(i));
            let deps: Vec<_> = prev.take().into_iter().collect();
            prev = Some(executor.create_task_with_deps(body, Box::new(move || deps)));
        }

        let top = prev.unwrap();
        assert_eq!(
            executor.submit(&top).unwrap().wait().unwrap(),
            MAX_INLINE_DEPTH * 2 - 1
        );
    }
}
