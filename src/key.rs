//! Identity of computations.
//!
//! A [`ComputeKey`] names one computation and statically fixes the type of the
//! value it produces. The engine stores keys of many unrelated types side by
//! side, so internally every key is wrapped in a type-erased [`DynKey`] whose
//! equality and hash are those of the concrete key plus its type. The
//! [`ComputationIdentifier`] of a key type is what the engine uses to find the
//! computation responsible for it.

use std::any::{Any, TypeId, type_name};
use std::collections::HashSet;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Anything a computation can produce.
pub trait ComputeResult: Send + Sync + 'static {}

impl<T> ComputeResult for T where T: Send + Sync + 'static {}

/// An immutable, hashable identifier of a single computation.
///
/// Two equal keys must produce equal results. The engine relies on this to
/// hand out a cached result instead of running the computation again.
pub trait ComputeKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// The value produced for this key.
    type Output: ComputeResult;
}

/// Binds a key type to its result type.
///
/// There is exactly one identifier per key type. Identifiers compare by the
/// key type alone, the result type follows from it.
#[derive(Clone, Copy)]
pub struct ComputationIdentifier {
    key: TypeId,
    key_name: &'static str,
    result_name: &'static str,
}

impl ComputationIdentifier {
    pub fn of<K: ComputeKey>() -> Self {
        Self {
            key: TypeId::of::<K>(),
            key_name: type_name::<K>(),
            result_name: type_name::<K::Output>(),
        }
    }

    pub fn key_type_name(&self) -> &'static str {
        self.key_name
    }

    pub fn result_type_name(&self) -> &'static str {
        self.result_name
    }
}

impl PartialEq for ComputationIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ComputationIdentifier {}

impl Hash for ComputationIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl Debug for ComputationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputationIdentifier({self})")
    }
}

impl Display for ComputationIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.key_name, self.result_name)
    }
}

trait ErasedKey: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn ErasedKey) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
    fn fmt_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn identifier(&self) -> ComputationIdentifier;
}

// A blanket implementation to automatically bridge the two. This is where the
// type erasure actually happens.
impl<K> ErasedKey for K
where
    K: ComputeKey,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn ErasedKey) -> bool {
        other
            .as_any()
            .downcast_ref::<K>()
            .is_some_and(|other| other == self)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<K>().hash(&mut state);
        self.hash(&mut state);
    }

    fn fmt_dyn(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }

    fn identifier(&self) -> ComputationIdentifier {
        ComputationIdentifier::of::<K>()
    }
}

/// A key of any type, usable as a map key next to keys of other types.
#[derive(Clone)]
pub struct DynKey(Arc<dyn ErasedKey>);

impl DynKey {
    pub fn new<K: ComputeKey>(key: K) -> Self {
        Self(Arc::new(key))
    }

    pub fn identifier(&self) -> ComputationIdentifier {
        self.0.identifier()
    }

    pub fn downcast_ref<K: ComputeKey>(&self) -> Option<&K> {
        self.0.as_any().downcast_ref::<K>()
    }

    pub fn is<K: ComputeKey>(&self) -> bool {
        self.0.as_any().is::<K>()
    }
}

impl PartialEq for DynKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_dyn(&*other.0)
    }
}

impl Eq for DynKey {}

impl Hash for DynKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_dyn(state);
    }
}

impl Debug for DynKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_dyn(f)
    }
}

impl<K: ComputeKey> From<K> for DynKey {
    fn from(key: K) -> Self {
        DynKey::new(key)
    }
}

/// A set of dependency keys, possibly of different types.
pub type KeySet = HashSet<DynKey>;

/// Collects keys of a single type into a [`KeySet`].
pub fn key_set<K: ComputeKey>(keys: impl IntoIterator<Item = K>) -> KeySet {
    keys.into_iter().map(DynKey::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Path(&'static str);

    impl ComputeKey for Path {
        type Output = Vec<String>;
    }

    #[derive(Clone, Debug, PartialEq, Eq, Hash)]
    struct Other(&'static str);

    impl ComputeKey for Other {
        type Output = usize;
    }

    #[test]
    fn test_identifier_is_per_key_type() {
        assert_eq!(
            ComputationIdentifier::of::<Path>(),
            ComputationIdentifier::of::<Path>()
        );
        assert_ne!(
            ComputationIdentifier::of::<Path>(),
            ComputationIdentifier::of::<Other>()
        );
        assert!(
            ComputationIdentifier::of::<Path>()
                .result_type_name()
                .contains("Vec")
        );
    }

    #[test]
    fn test_dyn_key_equality() {
        assert_eq!(DynKey::new(Path("a")), DynKey::new(Path("a")));
        assert_ne!(DynKey::new(Path("a")), DynKey::new(Path("b")));
        // Same payload, different key type.
        assert_ne!(DynKey::new(Path("a")), DynKey::new(Other("a")));
    }

    #[test]
    fn test_dyn_key_in_set() {
        let set: KeySet = [
            DynKey::new(Path("a")),
            DynKey::new(Path("a")),
            DynKey::new(Other("a")),
        ]
        .into_iter()
        .collect();

        assert_eq!(set.len(), 2);
        assert!(set.contains(&DynKey::new(Other("a"))));
    }

    #[test]
    fn test_downcast() {
        let key = DynKey::new(Path("src"));
        assert!(key.is::<Path>());
        assert_eq!(key.downcast_ref::<Path>(), Some(&Path("src")));
        assert_eq!(key.downcast_ref::<Other>(), None);
        assert_eq!(key.identifier(), ComputationIdentifier::of::<Path>());
        assert_eq!(format!("{key:?}"), "Path(\"src\")");
    }
}
