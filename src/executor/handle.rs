use std::time::Duration;

use crate::error::TaskError;
use crate::executor::DepsAwareTask;

/// The asynchronous result of a submitted task.
///
/// The handle resolves exactly once, with either the computed value or the
/// failure raised while discovering dependencies or running the body. Any
/// number of handles may observe the same task.
#[derive(Debug, Clone)]
pub struct ResultHandle<T> {
    task: DepsAwareTask<T>,
}

impl<T> ResultHandle<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(task: DepsAwareTask<T>) -> Self {
        Self { task }
    }

    /// Blocks until the task is done.
    pub fn wait(&self) -> Result<T, TaskError> {
        self.task.wait()
    }

    /// Blocks for at most `timeout`. Returns `None` if the task is still
    /// pending afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, TaskError>> {
        self.task.wait_timeout(timeout)
    }

    /// The result, without blocking.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        self.task.result()
    }

    pub fn is_done(&self) -> bool {
        self.task.is_done()
    }

    /// Cancels the task if its body has not started yet, resolving the handle
    /// with [`TaskError::Cancelled`]. A body that is already running is left
    /// to finish; in that case this returns `false`.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    pub fn task(&self) -> &DepsAwareTask<T> {
        &self.task
    }
}
