#![forbid(unsafe_code)]
//! A dependency-aware incremental computation engine.
//!
//! Work is described as a graph of keyed computations. Every key type is
//! served by one [`GraphTransformer`], which declares the keys it depends on
//! and turns their results into its own. The [`GraphEngine`] memoizes results
//! per key, so shared dependencies run exactly once, and hands the resulting
//! task graph to a [`DepsAwareExecutor`] that runs independent tasks in
//! parallel on a worker pool.
//!
//! Three scheduling strategies are provided, see [`Strategy`]:
//!
//! - [`RequeueExecutor`] hands tasks that are not ready yet back to the pool,
//! - [`ToposortExecutor`] plans every reachable task up front and detects
//!   cycles,
//! - [`LocalStackExecutor`] runs dependencies inline on the worker that needs
//!   them.
//!
//! The [`composition`] module builds computations out of other computations,
//! and [`files`] contains ready-made computations over a directory tree.

pub mod composition;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod files;
pub mod key;
#[cfg(feature = "logging")]
pub mod logging;

pub use crate::composition::{
    ComposedComputation, ComposedKey, ComposedResult, Composer, Composition, Transformer,
};
pub use crate::config::{EngineConfig, Strategy};
pub use crate::engine::{
    ComputationEnvironment, ComputeHandle, Dynamic, EngineBuilder, GraphEngine, GraphTransformer,
};
pub use crate::error::{ConfigError, EngineError, ExecutorError, TaskError};
pub use crate::executor::{
    DepsAwareExecutor, DepsAwareTask, DepsSupplier, LocalStackExecutor, RequeueExecutor,
    ResultHandle, TaskBody, TaskStatus, ToposortExecutor,
};
pub use crate::key::{ComputationIdentifier, ComputeKey, ComputeResult, DynKey, KeySet, key_set};
