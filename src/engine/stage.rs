use std::sync::Arc;

use crate::engine::{ComputationEnvironment, Dynamic, GraphTransformer};
use crate::error::EngineError;
use crate::key::{ComputationIdentifier, ComputeKey, DynKey, KeySet};

/// A registered computation with its key and result types erased, so the
/// engine can hold computations for unrelated key types side by side.
pub(crate) trait Stage: Send + Sync {
    fn identifier(&self) -> ComputationIdentifier;

    fn discover_preliminary_deps(&self, key: &DynKey) -> anyhow::Result<KeySet>;

    fn discover_deps(&self, key: &DynKey, env: &ComputationEnvironment) -> anyhow::Result<KeySet>;

    fn transform(&self, key: &DynKey, env: &ComputationEnvironment) -> anyhow::Result<Dynamic>;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<G> Stage for G
where
    G: GraphTransformer,
{
    fn identifier(&self) -> ComputationIdentifier {
        ComputationIdentifier::of::<G::Key>()
    }

    fn discover_preliminary_deps(&self, key: &DynKey) -> anyhow::Result<KeySet> {
        <G as GraphTransformer>::discover_preliminary_deps(self, typed::<G::Key>(key)?)
    }

    fn discover_deps(&self, key: &DynKey, env: &ComputationEnvironment) -> anyhow::Result<KeySet> {
        <G as GraphTransformer>::discover_deps(self, typed::<G::Key>(key)?, env)
    }

    fn transform(&self, key: &DynKey, env: &ComputationEnvironment) -> anyhow::Result<Dynamic> {
        // Call the typed method, then erase the result.
        let output = <G as GraphTransformer>::transform(self, typed::<G::Key>(key)?, env)?;
        Ok(Arc::new(output))
    }
}

fn typed<K: ComputeKey>(key: &DynKey) -> Result<&K, EngineError> {
    key.downcast_ref::<K>()
        .ok_or_else(|| EngineError::MissingComputation(key.identifier()))
}
