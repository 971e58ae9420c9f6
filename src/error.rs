use std::any::Any;
use std::sync::Arc;

use thiserror::Error;

use crate::key::ComputationIdentifier;

/// The outcome of a task that did not produce a value.
///
/// A task's result is observed by every dependent and every caller holding a
/// handle, so the error has to be cheap to clone. User errors are kept behind
/// an `Arc` for that reason.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    /// Dependency discovery or the task body returned an error (or panicked).
    #[error(transparent)]
    Failed(Arc<anyhow::Error>),

    #[error("Task was cancelled before it started")]
    Cancelled,

    #[error("Task was discarded because the executor shut down")]
    Rejected,

    #[error("Task is part of a dependency cycle")]
    Cycle,
}

impl TaskError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(err.into()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            format!("Task panicked: {s}")
        } else if let Some(s) = payload.downcast_ref::<String>() {
            format!("Task panicked: {s}")
        } else {
            String::from("Task panicked with unknown payload")
        };

        Self::new(anyhow::anyhow!(msg))
    }

    /// Returns the underlying user error, if this failure carries one.
    pub fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(Arc::new(err))
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Executor has already been shut down")]
    Rejected,

    #[error("Couldn't build the worker pool.\n{0}")]
    PoolBuild(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Computation for {0} is registered more than once")]
    DuplicateComputation(ComputationIdentifier),

    #[error("No computation is registered for {0}")]
    MissingComputation(ComputationIdentifier),

    #[error("Key {0} was not declared as a dependency")]
    UndeclaredDependency(String),

    #[error("Result of {key} is not a {expected}")]
    WrongResultType { key: String, expected: &'static str },

    #[error("Dependency {key} failed:\n{cause}")]
    DependencyFailed { key: String, cause: TaskError },

    /// A dependency was still running when its dependent was started. The
    /// built-in executors never do this; it guards executors supplied through
    /// [`crate::EngineBuilder::executor`].
    #[error("Dependency {0} has not been computed yet")]
    DependencyPending(String),

    #[error("Engine was dropped before the computation finished")]
    EngineDropped,

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {name}")]
    InvalidVar { name: &'static str, value: String },

    #[error("Unknown scheduling strategy {0:?}")]
    UnknownStrategy(String),
}
