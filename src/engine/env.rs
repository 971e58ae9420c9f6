use std::any::type_name;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::Dynamic;
use crate::error::EngineError;
use crate::key::{ComputationIdentifier, ComputeKey, DynKey};

/// The results a computation is allowed to see.
///
/// Holds exactly the results of the keys the computation declared, in either
/// round of dependency discovery. Reading anything else is an error.
#[derive(Clone, Default)]
pub struct ComputationEnvironment {
    deps: HashMap<DynKey, Dynamic>,
}

impl ComputationEnvironment {
    pub(crate) fn from_results(deps: HashMap<DynKey, Dynamic>) -> Self {
        Self { deps }
    }

    /// Adds a result by hand. Useful for exercising a transformer without an
    /// engine.
    pub fn with_dep<K: ComputeKey>(mut self, key: K, value: K::Output) -> Self {
        self.deps.insert(DynKey::new(key), Arc::new(value));
        self
    }

    /// The result of a declared dependency.
    pub fn get_dep<K: ComputeKey>(&self, key: &K) -> Result<&K::Output, EngineError> {
        let value = self.lookup(key)?;

        value
            .downcast_ref::<K::Output>()
            .ok_or_else(|| wrong_type::<K>(key))
    }

    /// Like [`ComputationEnvironment::get_dep`], but shares ownership of the
    /// result.
    pub fn get_dep_arc<K: ComputeKey>(&self, key: &K) -> Result<Arc<K::Output>, EngineError> {
        let value = self.lookup(key)?;

        Arc::clone(value)
            .downcast::<K::Output>()
            .map_err(|_| wrong_type::<K>(key))
    }

    /// Every declared result, keyed by dependency.
    pub fn get_deps(&self) -> impl Iterator<Item = (&DynKey, &Dynamic)> {
        self.deps.iter()
    }

    /// The declared results of one computation, keyed by their typed keys.
    pub fn get_deps_of<K: ComputeKey>(&self) -> HashMap<K, Arc<K::Output>> {
        let identifier = ComputationIdentifier::of::<K>();

        self.deps
            .iter()
            .filter(|(key, _)| key.identifier() == identifier)
            .filter_map(|(key, value)| {
                let key = key.downcast_ref::<K>()?.clone();
                let value = Arc::clone(value).downcast::<K::Output>().ok()?;
                Some((key, value))
            })
            .collect()
    }

    pub fn contains<K: ComputeKey>(&self, key: &K) -> bool {
        self.deps.contains_key(&DynKey::new(key.clone()))
    }

    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    fn lookup<K: ComputeKey>(&self, key: &K) -> Result<&Dynamic, EngineError> {
        self.deps
            .get(&DynKey::new(key.clone()))
            .ok_or_else(|| EngineError::UndeclaredDependency(format!("{key:?}")))
    }
}

fn wrong_type<K: ComputeKey>(key: &K) -> EngineError {
    EngineError::WrongResultType {
        key: format!("{key:?}"),
        expected: type_name::<K::Output>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Len(&'static str);

    impl ComputeKey for Len {
        type Output = usize;
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Upper(&'static str);

    impl ComputeKey for Upper {
        type Output = String;
    }

    fn env() -> ComputationEnvironment {
        ComputationEnvironment::default()
            .with_dep(Len("abc"), 3)
            .with_dep(Len("hello"), 5)
            .with_dep(Upper("abc"), String::from("ABC"))
    }

    #[test]
    fn test_get_dep() {
        let env = env();
        assert_eq!(*env.get_dep(&Len("abc")).unwrap(), 3);
        assert_eq!(env.get_dep(&Upper("abc")).unwrap(), "ABC");
        assert_eq!(*env.get_dep_arc(&Len("hello")).unwrap(), 5);
        assert!(env.contains(&Len("abc")));
        assert_eq!(env.len(), 3);
    }

    #[test]
    fn test_undeclared_dependency() {
        let env = env();
        let err = env.get_dep(&Len("missing")).unwrap_err();
        assert!(matches!(err, EngineError::UndeclaredDependency(ref key) if key == "Len(\"missing\")"));
        assert!(!env.contains(&Upper("hello")));
    }

    #[test]
    fn test_get_deps_of_identifier() {
        let env = env();
        let lens = env.get_deps_of::<Len>();

        assert_eq!(lens.len(), 2);
        assert_eq!(*lens[&Len("hello")], 5);
        assert_eq!(env.get_deps_of::<Upper>().len(), 1);
        assert_eq!(env.get_deps().count(), 3);
    }

    #[test]
    fn test_empty() {
        let env = ComputationEnvironment::default();
        assert!(env.is_empty());
        assert!(env.get_deps_of::<Len>().is_empty());
    }
}
