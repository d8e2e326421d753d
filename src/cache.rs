//! Cache keys and the per-run cache backends.
//!
//! Values from unrelated sources share one cache, so both identities and
//! values are stored type-erased; the per-source value type is recovered by
//! downcast when a load is resolved.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::source::{DataSource, SourceName};

/// A fetched value with its concrete type erased.
pub type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Object-safe mirror of `Eq + Hash + Debug` so identities of arbitrary
/// user types can live in one key space.
trait AnyIdentity: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_dyn(&self, other: &dyn AnyIdentity) -> bool;
    fn hash_dyn(&self, state: &mut dyn Hasher);
    fn fmt_dyn(&self, f: &mut Formatter<'_>) -> fmt::Result;
}

impl<I> AnyIdentity for I
where
    I: Eq + Hash + Debug + Send + Sync + 'static,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_dyn(&self, other: &dyn AnyIdentity) -> bool {
        other
            .as_any()
            .downcast_ref::<I>()
            .map_or(false, |other| self == other)
    }

    fn hash_dyn(&self, mut state: &mut dyn Hasher) {
        self.hash(&mut state)
    }

    fn fmt_dyn(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

/// A type-erased identity. Two keys are equal exactly when they wrap the
/// same concrete type and the wrapped values compare equal; keys of
/// different concrete types are never equal, even if they hash alike.
#[derive(Clone)]
pub struct IdentityKey(Arc<dyn AnyIdentity>);

impl IdentityKey {
    pub fn new<I>(identity: I) -> Self
    where
        I: Eq + Hash + Debug + Send + Sync + 'static,
    {
        IdentityKey(Arc::new(identity))
    }

    /// Borrow the identity back at its concrete type.
    pub fn downcast_ref<I: 'static>(&self) -> Option<&I> {
        self.0.as_any().downcast_ref()
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_dyn(&*other.0)
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_dyn(state)
    }
}

impl Debug for IdentityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        self.0.fmt_dyn(f)
    }
}

/// What a fetched value is cached under: the source name plus the identity
/// it was fetched for. Source names are the only discriminator, which is
/// why names must be disjoint across sources.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    pub source: SourceName,
    pub identity: IdentityKey,
}

impl CacheKey {
    pub fn new(source: SourceName, identity: IdentityKey) -> Self {
        CacheKey { source, identity }
    }
}

/// Pluggable per-run cache.
///
/// Implementations may be purely functional or mutable internally, as long
/// as a `put` is visible to every later `get` within the run.
pub trait FetchCache: Debug + Send {
    fn get(&self, key: &CacheKey) -> Option<ErasedValue>;
    fn put(&mut self, key: CacheKey, value: ErasedValue);
}

impl FetchCache for Box<dyn FetchCache> {
    fn get(&self, key: &CacheKey) -> Option<ErasedValue> {
        (**self).get(key)
    }

    fn put(&mut self, key: CacheKey, value: ErasedValue) {
        (**self).put(key, value)
    }
}

/// The default cache: a map that survives exactly one run, pre-seedable by
/// the caller.
#[derive(Default)]
pub struct InMemoryCache {
    entries: HashMap<CacheKey, ErasedValue>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value before a run, so the scheduler never asks the source
    /// for it.
    pub fn prime<S: DataSource>(&mut self, source: &S, identity: S::Identity, value: S::Value) {
        let key = CacheKey::new(Arc::from(source.name()), IdentityKey::new(identity));
        self.entries.insert(key, Arc::new(value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }
}

impl Debug for InMemoryCache {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        // Values are type-erased; only the keys are printable.
        f.debug_struct("InMemoryCache")
            .field("keys", &self.entries.keys())
            .finish()
    }
}

impl FetchCache for InMemoryCache {
    fn get(&self, key: &CacheKey) -> Option<ErasedValue> {
        self.entries.get(key).cloned()
    }

    fn put(&mut self, key: CacheKey, value: ErasedValue) {
        self.entries.insert(key, value);
    }
}

/// A cache that remembers nothing. `get` always misses and `put` drops the
/// value, which disables deduplication across rounds while leaving the
/// within-round guarantees intact.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForgetfulCache;

impl ForgetfulCache {
    pub fn new() -> Self {
        ForgetfulCache
    }
}

impl FetchCache for ForgetfulCache {
    fn get(&self, _key: &CacheKey) -> Option<ErasedValue> {
        None
    }

    fn put(&mut self, _key: CacheKey, _value: ErasedValue) {}
}
