//! The memoizing computation engine.
//!
//! An engine is assembled from [`GraphTransformer`]s, one per key type. Asking
//! it for a key looks up (or creates) the single task responsible for that
//! key, schedules it on the configured executor and hands back a typed
//! [`ComputeHandle`]. A task discovers the keys it depends on through its
//! transformer, requests those from the engine in turn, and runs the
//! transformation only once all of them are done.

mod env;
mod stage;

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use tracing::{Level, debug, warn};

use crate::config::EngineConfig;
use crate::error::{EngineError, TaskError};
use crate::executor::{DepsAwareExecutor, DepsAwareTask, DepsSupplier, ResultHandle, TaskBody};
use crate::key::{ComputationIdentifier, ComputeKey, DynKey, KeySet};

pub use crate::engine::env::ComputationEnvironment;

use crate::engine::stage::Stage;

/// A type-erased computation result.
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// The logic turning a key into its result.
///
/// Dependency discovery happens in two rounds. The keys returned by
/// [`GraphTransformer::discover_preliminary_deps`] are computed first, and
/// their results are visible to [`GraphTransformer::discover_deps`], which
/// declares the rest. Most transformers only need the second round.
/// [`GraphTransformer::transform`] sees the results of both rounds, and
/// nothing else.
///
/// Transformers must be pure: equal keys have to produce equal results.
pub trait GraphTransformer: Send + Sync + 'static {
    type Key: ComputeKey;

    fn discover_preliminary_deps(&self, _key: &Self::Key) -> anyhow::Result<KeySet> {
        Ok(KeySet::new())
    }

    fn discover_deps(&self, key: &Self::Key, env: &ComputationEnvironment)
    -> anyhow::Result<KeySet>;

    fn transform(
        &self,
        key: &Self::Key,
        env: &ComputationEnvironment,
    ) -> anyhow::Result<<Self::Key as ComputeKey>::Output>;
}

type Resolved = Arc<OnceLock<Vec<(DynKey, DepsAwareTask<Dynamic>)>>>;

struct EngineInner {
    stages: HashMap<ComputationIdentifier, Arc<dyn Stage>>,
    tasks: RwLock<HashMap<DynKey, DepsAwareTask<Dynamic>>>,
    executor: Box<dyn DepsAwareExecutor<Dynamic>>,
}

impl EngineInner {
    /// Returns the one task for `key`, creating it on first request. Two
    /// threads asking for the same key concurrently always get the same task.
    fn task_for(self: &Arc<Self>, key: DynKey) -> DepsAwareTask<Dynamic> {
        if let Some(task) = read(&self.tasks).get(&key) {
            return task.clone();
        }

        let task = match write(&self.tasks).entry(key.clone()) {
            Entry::Occupied(entry) => return entry.get().clone(),
            Entry::Vacant(entry) => entry.insert(self.create_task(key.clone())).clone(),
        };

        self.evict_if_abandoned(key, &task);
        task
    }

    /// Forgets the task for `key` if it ends up cancelled or discarded, so the
    /// next request for the key starts over instead of inheriting the outcome.
    fn evict_if_abandoned(self: &Arc<Self>, key: DynKey, task: &DepsAwareTask<Dynamic>) {
        let engine = Arc::downgrade(self);
        let id = task.id();

        task.on_done(move || {
            let Some(engine) = engine.upgrade() else {
                return;
            };

            let mut tasks = write(&engine.tasks);
            let abandoned = tasks.get(&key).is_some_and(|task| {
                task.id() == id
                    && matches!(
                        task.result(),
                        Some(Err(TaskError::Cancelled | TaskError::Rejected))
                    )
            });

            if abandoned {
                debug!(key = ?key, "forgetting abandoned task");
                tasks.remove(&key);
            }
        });
    }

    fn tasks_for(self: &Arc<Self>, keys: KeySet) -> Vec<(DynKey, DepsAwareTask<Dynamic>)> {
        keys.into_iter()
            .map(|key| {
                let task = self.task_for(key.clone());
                (key, task)
            })
            .collect()
    }

    fn create_task(self: &Arc<Self>, key: DynKey) -> DepsAwareTask<Dynamic> {
        let identifier = key.identifier();

        let Some(stage) = self.stages.get(&identifier).cloned() else {
            return self
                .executor
                .create_task(Box::new(move || {
                    Err(EngineError::MissingComputation(identifier).into())
                }));
        };

        let preliminary: Resolved = Arc::default();
        let dependencies: Resolved = Arc::default();

        let prereqs: DepsSupplier<Dynamic> = {
            let engine = Arc::downgrade(self);
            let stage = Arc::clone(&stage);
            let key = key.clone();
            let preliminary = Arc::clone(&preliminary);

            Box::new(move || {
                let engine = upgrade(&engine)?;
                let keys = stage
                    .discover_preliminary_deps(&key)
                    .inspect_err(|err| warn!(key = ?key, "dependency discovery failed: {err:#}"))?;

                let pairs = engine.tasks_for(keys);
                let tasks = pairs.iter().map(|(_, task)| task.clone()).collect();
                let _ = preliminary.set(pairs);
                Ok(tasks)
            })
        };

        let deps: DepsSupplier<Dynamic> = {
            let engine = Arc::downgrade(self);
            let stage = Arc::clone(&stage);
            let key = key.clone();
            let preliminary = Arc::clone(&preliminary);
            let dependencies = Arc::clone(&dependencies);

            Box::new(move || {
                let engine = upgrade(&engine)?;
                let env = ComputationEnvironment::from_results(collect(&[&preliminary])?);
                let keys = stage
                    .discover_deps(&key, &env)
                    .inspect_err(|err| warn!(key = ?key, "dependency discovery failed: {err:#}"))?;

                let pairs = engine.tasks_for(keys);
                let tasks = pairs.iter().map(|(_, task)| task.clone()).collect();
                let _ = dependencies.set(pairs);
                Ok(tasks)
            })
        };

        let body: TaskBody<Dynamic> = Box::new(move || {
            let env =
                ComputationEnvironment::from_results(collect(&[&preliminary, &dependencies])?);

            let span = tracing::span!(Level::DEBUG, "compute", key = ?key, %identifier);
            let _enter = span.enter();

            stage
                .transform(&key, &env)
                .inspect_err(|err| warn!(key = ?key, "computation failed: {err:#}"))
        });

        self.executor.create_throwing_task(body, prereqs, deps)
    }
}

fn upgrade(engine: &Weak<EngineInner>) -> Result<Arc<EngineInner>, EngineError> {
    engine.upgrade().ok_or(EngineError::EngineDropped)
}

/// Gathers the results of resolved dependencies. Fails with the first
/// dependency that failed.
fn collect(rounds: &[&Resolved]) -> Result<HashMap<DynKey, Dynamic>, EngineError> {
    let mut results = HashMap::new();

    for round in rounds {
        let Some(pairs) = round.get() else {
            continue;
        };

        for (key, task) in pairs {
            match task.result() {
                Some(Ok(value)) => {
                    results.insert(key.clone(), value);
                }
                Some(Err(cause)) => {
                    return Err(EngineError::DependencyFailed {
                        key: format!("{key:?}"),
                        cause,
                    });
                }
                None => return Err(EngineError::DependencyPending(format!("{key:?}"))),
            }
        }
    }

    Ok(results)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn downcast<K: ComputeKey>(key: &K, value: Dynamic) -> Result<Arc<K::Output>, EngineError> {
    value
        .downcast::<K::Output>()
        .map_err(|_| EngineError::WrongResultType {
            key: format!("{key:?}"),
            expected: type_name::<K::Output>(),
        })
}

/// Assembles a [`GraphEngine`] from its computations.
///
/// ```
/// use graft::{ComputationEnvironment, ComputeKey, GraphEngine, GraphTransformer, KeySet, key_set};
///
/// #[derive(Clone, Debug, PartialEq, Eq, Hash)]
/// struct Fib(u64);
///
/// impl ComputeKey for Fib {
///     type Output = u64;
/// }
///
/// struct Fibonacci;
///
/// impl GraphTransformer for Fibonacci {
///     type Key = Fib;
///
///     fn discover_deps(&self, key: &Fib, _: &ComputationEnvironment) -> anyhow::Result<KeySet> {
///         Ok(match key.0 {
///             0 | 1 => KeySet::new(),
///             n => key_set([Fib(n - 1), Fib(n - 2)]),
///         })
///     }
///
///     fn transform(&self, key: &Fib, env: &ComputationEnvironment) -> anyhow::Result<u64> {
///         Ok(match key.0 {
///             0 | 1 => key.0,
///             n => env.get_dep(&Fib(n - 1))? + env.get_dep(&Fib(n - 2))?,
///         })
///     }
/// }
///
/// let engine = GraphEngine::builder().stage(Fibonacci).build()?;
/// assert_eq!(*engine.compute_unchecked(Fib(50))?, 12_586_269_025);
/// # Ok::<(), graft::EngineError>(())
/// ```
#[derive(Default)]
pub struct EngineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    config: EngineConfig,
    executor: Option<Box<dyn DepsAwareExecutor<Dynamic>>>,
}

impl EngineBuilder {
    /// Registers the computation for keys of type `G::Key`.
    pub fn stage<G: GraphTransformer>(mut self, computation: G) -> Self {
        self.stages.push(Arc::new(computation));
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs the engine on the given executor instead of building one from
    /// the configured strategy.
    pub fn executor(mut self, executor: Box<dyn DepsAwareExecutor<Dynamic>>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn build(self) -> Result<GraphEngine, EngineError> {
        let mut stages = HashMap::with_capacity(self.stages.len());

        for stage in self.stages {
            let identifier = stage.identifier();
            if stages.insert(identifier, stage).is_some() {
                return Err(EngineError::DuplicateComputation(identifier));
            }
        }

        let executor = match self.executor {
            Some(executor) => executor,
            None => self.config.strategy.executor(&self.config)?,
        };

        debug!(
            stages = stages.len(),
            strategy = ?self.config.strategy,
            threads = self.config.threads,
            "engine ready"
        );

        Ok(GraphEngine {
            inner: Arc::new(EngineInner {
                stages,
                tasks: RwLock::new(HashMap::with_capacity(self.config.estimated_keys)),
                executor,
            }),
        })
    }
}

/// Computes keys, each at most once, in dependency order.
///
/// Results (successes and failures alike) stay cached for the lifetime of the
/// engine; requesting a key again returns the cached outcome.
pub struct GraphEngine {
    inner: Arc<EngineInner>,
}

impl GraphEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Schedules the computation of `key` and returns a handle to its result.
    pub fn compute<K: ComputeKey>(&self, key: K) -> Result<ComputeHandle<K>, EngineError> {
        let task = self.inner.task_for(DynKey::new(key.clone()));
        let handle = self.inner.executor.submit(&task)?;
        Ok(ComputeHandle { key, handle })
    }

    /// Computes `key` and blocks until its result is available.
    pub fn compute_unchecked<K: ComputeKey>(&self, key: K) -> Result<Arc<K::Output>, EngineError> {
        self.compute(key)?.wait()
    }

    /// Schedules every key before waiting on any of them.
    pub fn compute_all<K: ComputeKey>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<HashMap<K, ComputeHandle<K>>, EngineError> {
        keys.into_iter()
            .map(|key| Ok((key.clone(), self.compute(key)?)))
            .collect()
    }

    pub fn compute_all_unchecked<K: ComputeKey>(
        &self,
        keys: impl IntoIterator<Item = K>,
    ) -> Result<HashMap<K, Arc<K::Output>>, EngineError> {
        self.compute_all(keys)?
            .into_iter()
            .map(|(key, handle)| Ok((key, handle.wait()?)))
            .collect()
    }

    /// The outcome for `key` if it has already been computed. Never schedules
    /// anything.
    pub fn cached<K: ComputeKey>(&self, key: &K) -> Option<Result<Arc<K::Output>, EngineError>> {
        let task = read(&self.inner.tasks)
            .get(&DynKey::new(key.clone()))
            .cloned()?;

        let result = task.result()?;
        Some(result.map_err(EngineError::from).and_then(|value| downcast(key, value)))
    }

    /// Stops the engine immediately. Computations that have not started yet
    /// fail with [`crate::TaskError::Rejected`], later requests are refused.
    pub fn close(&self) {
        self.inner.executor.close();
    }

    /// Stops accepting requests and waits up to `timeout` for pending
    /// computations. Returns `true` if all of them finished in time.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.executor.shutdown(timeout)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.executor.is_shutdown()
    }
}

impl fmt::Debug for GraphEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphEngine")
            .field("stages", &self.inner.stages.keys().collect::<Vec<_>>())
            .field("keys", &read(&self.inner.tasks).len())
            .finish()
    }
}

/// The pending result of a computed key.
pub struct ComputeHandle<K: ComputeKey> {
    key: K,
    handle: ResultHandle<Dynamic>,
}

impl<K: ComputeKey> ComputeHandle<K> {
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Blocks until the result is available.
    pub fn wait(&self) -> Result<Arc<K::Output>, EngineError> {
        downcast(&self.key, self.handle.wait()?)
    }

    /// Blocks for at most `timeout`, returns `None` if the result is still
    /// pending afterwards.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<Arc<K::Output>, EngineError>> {
        let result = self.handle.wait_timeout(timeout)?;
        Some(result.map_err(EngineError::from).and_then(|value| downcast(&self.key, value)))
    }

    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Cancels the computation if it has not started yet. Dependents already
    /// waiting on it fail, but the key itself is forgotten, so a later request
    /// computes it afresh.
    pub fn cancel(&self) -> bool {
        self.handle.cancel()
    }
}

impl<K: ComputeKey> Clone for ComputeHandle<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<K: ComputeKey> fmt::Debug for ComputeHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeHandle")
            .field("key", &self.key)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Runs `check` once per scheduling strategy, on a fresh engine with four
/// workers.
#[cfg(test)]
pub(crate) fn for_each_strategy(
    setup: impl Fn(EngineBuilder) -> EngineBuilder,
    check: impl Fn(crate::config::Strategy, GraphEngine),
) {
    use crate::config::Strategy;

    for strategy in Strategy::ALL {
        let config = EngineConfig::default()
            .with_threads(4)
            .with_strategy(strategy);
        let engine = setup(GraphEngine::builder().config(config))
            .build()
            .unwrap();
        check(strategy, engine);
    }
}
