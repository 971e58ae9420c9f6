//! Engine and executor configuration.
//!
//! Every field has a default, so a configuration can be deserialized from a
//! partial document or built in code and adjusted field by field. A few
//! settings can be overridden from the environment:
//!
//! - `GRAFT_THREADS`: worker pool size
//! - `GRAFT_STRATEGY`: `requeue`, `toposort` or `local_stack`

use std::fmt;
use std::str::FromStr;
use std::thread;

use serde::Deserialize;

use crate::error::{ConfigError, ExecutorError};
use crate::executor::{DepsAwareExecutor, LocalStackExecutor, RequeueExecutor, ToposortExecutor};

/// How an executor orders dependent tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Hand tasks that are not ready back to the pool, see [`RequeueExecutor`].
    #[default]
    Requeue,
    /// Plan the whole reachable graph up front, see [`ToposortExecutor`].
    Toposort,
    /// Run dependencies inline on the worker that needs them, see
    /// [`LocalStackExecutor`].
    LocalStack,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Strategy::Requeue, Strategy::Toposort, Strategy::LocalStack];

    /// Builds an executor using this strategy.
    pub fn executor<T>(
        self,
        config: &EngineConfig,
    ) -> Result<Box<dyn DepsAwareExecutor<T>>, ExecutorError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let threads = config.threads;
        let stack_size = config.stack_size;

        let executor: Box<dyn DepsAwareExecutor<T>> = match self {
            Strategy::Requeue => Box::new(RequeueExecutor::with_stack_size(threads, stack_size)?),
            Strategy::Toposort => Box::new(ToposortExecutor::with_stack_size(threads, stack_size)?),
            Strategy::LocalStack => {
                Box::new(LocalStackExecutor::with_stack_size(threads, stack_size)?)
            }
        };

        Ok(executor)
    }
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "requeue" => Ok(Strategy::Requeue),
            "toposort" => Ok(Strategy::Toposort),
            "local_stack" => Ok(Strategy::LocalStack),
            _ => Err(ConfigError::UnknownStrategy(s.to_string())),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Strategy::Requeue => "requeue",
            Strategy::Toposort => "toposort",
            Strategy::LocalStack => "local_stack",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads.
    pub threads: usize,
    pub strategy: Strategy,
    /// Expected number of distinct keys, used to size the result cache.
    pub estimated_keys: usize,
    /// Stack size of each worker thread in bytes. The local stack strategy
    /// falls back to a larger default than the others.
    pub stack_size: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            strategy: Strategy::default(),
            estimated_keys: 16,
            stack_size: None,
        }
    }
}

fn default_threads() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

impl EngineConfig {
    /// The default configuration with overrides from `GRAFT_THREADS` and
    /// `GRAFT_STRATEGY` applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(
        mut self,
        var: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = var("GRAFT_THREADS") {
            self.threads = match value.trim().parse::<usize>() {
                Ok(threads) if threads > 0 => threads,
                _ => {
                    return Err(ConfigError::InvalidVar {
                        name: "GRAFT_THREADS",
                        value,
                    });
                }
            };
        }

        if let Some(value) = var("GRAFT_STRATEGY") {
            self.strategy = value.parse()?;
        }

        Ok(self)
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }
}
