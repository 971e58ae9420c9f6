//! Computations built out of the results of other computations.
//!
//! A [`ComposedComputation`] computes a [`ComposedKey`] in three steps:
//!
//! 1. it computes a *base* key derived from the composed key's origin,
//! 2. a [`Composer`] looks at the base result and names the keys to fan in,
//! 3. once those are computed, a [`Transformer`] reduces their results to one
//!    or more target results, collected in a [`ComposedResult`].
//!
//! From the engine's point of view a composed computation is an ordinary
//! [`GraphTransformer`]: the base key is its preliminary dependency and the
//! composer provides the rest of its dependencies.

use std::any::type_name;
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use crate::engine::{ComputationEnvironment, GraphTransformer};
use crate::error::EngineError;
use crate::key::{ComputeKey, KeySet, key_set};

/// Asks for the composition of `T` results originating from `origin`.
pub struct ComposedKey<K, T> {
    pub origin: K,
    _target: PhantomData<fn() -> T>,
}

impl<K, T> ComposedKey<K, T> {
    pub fn new(origin: K) -> Self {
        Self {
            origin,
            _target: PhantomData,
        }
    }
}

impl<K: Clone, T> ComposedKey<K, T> {
    fn from_origin(origin: &K) -> Self {
        Self::new(origin.clone())
    }
}

impl<K: Clone, T> Clone for ComposedKey<K, T> {
    fn clone(&self) -> Self {
        Self::new(self.origin.clone())
    }
}

impl<K: PartialEq, T> PartialEq for ComposedKey<K, T> {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin
    }
}

impl<K: Eq, T> Eq for ComposedKey<K, T> {}

impl<K: Hash, T> Hash for ComposedKey<K, T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
    }
}

impl<K: Debug, T> Debug for ComposedKey<K, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComposedKey")
            .field("origin", &self.origin)
            .field("target", &type_name::<T>())
            .finish()
    }
}

impl<K, T> ComputeKey for ComposedKey<K, T>
where
    K: ComputeKey,
    T: ComputeKey,
{
    type Output = ComposedResult<T>;
}

/// The target results produced by a composition, keyed by target key.
pub struct ComposedResult<T: ComputeKey> {
    results: HashMap<T, Arc<T::Output>>,
}

impl<T: ComputeKey> ComposedResult<T> {
    pub fn new(results: HashMap<T, Arc<T::Output>>) -> Self {
        Self { results }
    }

    pub fn get(&self, key: &T) -> Option<&T::Output> {
        self.results.get(key).map(Arc::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&T, &Arc<T::Output>)> {
        self.results.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &T> {
        self.results.keys()
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_inner(self) -> HashMap<T, Arc<T::Output>> {
        self.results
    }
}

impl<T: ComputeKey> Debug for ComposedResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.results.keys()).finish()
    }
}

/// Names the keys a composition fans in, given the base key and its result.
pub trait Composer<B: ComputeKey, U: ComputeKey>: Send + Sync + 'static {
    fn compose(&self, key: &B, result: &B::Output) -> anyhow::Result<HashSet<U>>;
}

impl<B, U, F> Composer<B, U> for F
where
    B: ComputeKey,
    U: ComputeKey,
    F: Fn(&B, &B::Output) -> anyhow::Result<HashSet<U>> + Send + Sync + 'static,
{
    fn compose(&self, key: &B, result: &B::Output) -> anyhow::Result<HashSet<U>> {
        self(key, result)
    }
}

/// Reduces the fanned-in results to target results. A single step may
/// produce any number of targets.
pub trait Transformer<U: ComputeKey, T: ComputeKey>: Send + Sync + 'static {
    fn transform(
        &self,
        deps: HashMap<U, Arc<U::Output>>,
    ) -> anyhow::Result<HashMap<T, Arc<T::Output>>>;
}

impl<U, T, F> Transformer<U, T> for F
where
    U: ComputeKey,
    T: ComputeKey,
    F: Fn(HashMap<U, Arc<U::Output>>) -> anyhow::Result<HashMap<T, Arc<T::Output>>>
        + Send
        + Sync
        + 'static,
{
    fn transform(
        &self,
        deps: HashMap<U, Arc<U::Output>>,
    ) -> anyhow::Result<HashMap<T, Arc<T::Output>>> {
        self(deps)
    }
}

/// Computes [`ComposedKey<K, T>`] from a base key `B`, through the fanned-in
/// keys `U`.
pub struct ComposedComputation<K, B, U, T>
where
    B: ComputeKey,
    U: ComputeKey,
    T: ComputeKey,
{
    base: fn(&K) -> B,
    composer: Arc<dyn Composer<B, U>>,
    transformer: Arc<dyn Transformer<U, T>>,
}

impl<K, U, T> ComposedComputation<K, K, U, T>
where
    K: ComputeKey,
    U: ComputeKey,
    T: ComputeKey,
{
    /// Composes over the origin key itself: the composer sees the origin's
    /// own result.
    pub fn new(composer: impl Composer<K, U>, transformer: impl Transformer<U, T>) -> Self {
        Self {
            base: K::clone,
            composer: Arc::new(composer),
            transformer: Arc::new(transformer),
        }
    }
}

impl<K, B, U, T> ComposedComputation<K, B, U, T>
where
    K: ComputeKey,
    B: ComputeKey,
    U: ComputeKey,
    T: ComputeKey,
{
    /// Chains a further composition onto this one. The new composer runs
    /// over each target result of `self`, and the union of the keys it names
    /// is fanned in.
    ///
    /// Both computations have to be registered with the engine.
    pub fn compose_left<U2, T2>(
        &self,
        composer: impl Composer<T, U2>,
        transformer: impl Transformer<U2, T2>,
    ) -> ComposedComputation<K, ComposedKey<K, T>, U2, T2>
    where
        U2: ComputeKey,
        T2: ComputeKey,
    {
        ComposedComputation {
            base: ComposedKey::from_origin,
            composer: Arc::new(LeftComposer {
                inner: Arc::new(composer),
            }),
            transformer: Arc::new(transformer),
        }
    }

    fn compose(&self, origin: &K, env: &ComputationEnvironment) -> anyhow::Result<HashSet<U>> {
        let base = (self.base)(origin);
        let result = env.get_dep(&base)?;
        self.composer.compose(&base, result)
    }
}

impl<K, B, U, T> GraphTransformer for ComposedComputation<K, B, U, T>
where
    K: ComputeKey,
    B: ComputeKey,
    U: ComputeKey,
    T: ComputeKey,
{
    type Key = ComposedKey<K, T>;

    fn discover_preliminary_deps(&self, key: &Self::Key) -> anyhow::Result<KeySet> {
        Ok(key_set([(self.base)(&key.origin)]))
    }

    fn discover_deps(
        &self,
        key: &Self::Key,
        env: &ComputationEnvironment,
    ) -> anyhow::Result<KeySet> {
        Ok(key_set(self.compose(&key.origin, env)?))
    }

    fn transform(
        &self,
        key: &Self::Key,
        env: &ComputationEnvironment,
    ) -> anyhow::Result<ComposedResult<T>> {
        // The composer is pure, so this names exactly the keys declared above.
        let deps = self
            .compose(&key.origin, env)?
            .into_iter()
            .map(|dep| {
                let result = env.get_dep_arc(&dep)?;
                Ok((dep, result))
            })
            .collect::<Result<HashMap<_, _>, EngineError>>()?;

        Ok(ComposedResult::new(self.transformer.transform(deps)?))
    }
}

/// Runs a composer over every entry of a composed result.
struct LeftComposer<T: ComputeKey, U: ComputeKey> {
    inner: Arc<dyn Composer<T, U>>,
}

impl<K, T, U> Composer<ComposedKey<K, T>, U> for LeftComposer<T, U>
where
    K: ComputeKey,
    T: ComputeKey,
    U: ComputeKey,
{
    fn compose(
        &self,
        _: &ComposedKey<K, T>,
        result: &ComposedResult<T>,
    ) -> anyhow::Result<HashSet<U>> {
        let mut keys = HashSet::new();
        for (key, value) in result.iter() {
            keys.extend(self.inner.compose(key, value)?);
        }
        Ok(keys)
    }
}

/// Constructors for common compositions.
pub struct Composition;

impl Composition {
    /// Lifts a key family into a composition whose result holds the single
    /// origin result. Useful as the start of a [`ComposedComputation::compose_left`]
    /// chain.
    pub fn as_composition<K: ComputeKey>() -> ComposedComputation<K, K, K, K> {
        ComposedComputation::new(
            |key: &K, _: &K::Output| -> anyhow::Result<HashSet<K>> {
                Ok(HashSet::from([key.clone()]))
            },
            |deps: HashMap<K, Arc<K::Output>>| -> anyhow::Result<HashMap<K, Arc<K::Output>>> {
                Ok(deps)
            },
        )
    }
}
