//! The contract user data sources implement, and the erased handles the
//! planner carries around so sources with unrelated identity and value
//! types can share one run.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::cache::{ErasedValue, IdentityKey};
use crate::error::ErrorPayload;

/// Stable name of a data source. Two sources with the same name are the
/// same source as far as caching and batching are concerned.
pub type SourceName = Arc<str>;

/// Result alias for the source-facing failure channel.
pub type SourceResult<T> = Result<T, ErrorPayload>;

/// A user-supplied data source: something that can resolve identities to
/// values, one at a time or in batches.
///
/// Both methods must be referentially transparent with respect to identity
/// equality: fetching the same identity twice within one run must yield the
/// same value. The scheduler chooses which method to call; a source that
/// cannot batch efficiently can still implement `fetch_many` as a loop.
#[async_trait]
pub trait DataSource: Debug + Send + Sync + 'static {
    type Identity: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// The cache and batch discriminator. Names must be disjoint: two
    /// sources sharing a name while disagreeing on identity or value types
    /// is a contract violation.
    fn name(&self) -> &str;

    /// Upper bound on identities per batched call. When set, a round's
    /// identities for this source are split into chunks of at most this
    /// size, dispatched in parallel.
    fn max_batch_size(&self) -> Option<NonZeroUsize> {
        None
    }

    /// Fetch a single identity. Absent means the source does not know it.
    async fn fetch_one(&self, identity: &Self::Identity) -> SourceResult<Option<Self::Value>> {
        let mut values = self.fetch_many(std::slice::from_ref(identity)).await?;
        Ok(values.remove(identity))
    }

    /// Fetch a batch of distinct identities. The returned mapping may be
    /// partial; identities missing from it were not found.
    async fn fetch_many(
        &self,
        identities: &[Self::Identity],
    ) -> SourceResult<HashMap<Self::Identity, Self::Value>>;
}

/// How a source was asked for identities in one query of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    One(IdentityKey),
    Many(Vec<IdentityKey>),
}

impl Request {
    pub fn identities(&self) -> &[IdentityKey] {
        match self {
            Request::One(identity) => std::slice::from_ref(identity),
            Request::Many(identities) => identities,
        }
    }

    pub fn len(&self) -> usize {
        self.identities().len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities().is_empty()
    }
}

/// Object-safe face of a [DataSource], working entirely in erased
/// identities and values.
pub(crate) trait ErasedSource: Send + Sync {
    fn source_name(&self) -> SourceName;
    fn max_batch_size(&self) -> Option<NonZeroUsize>;
    fn fetch_one(
        &self,
        identity: IdentityKey,
    ) -> BoxFuture<'_, SourceResult<Vec<(IdentityKey, ErasedValue)>>>;
    fn fetch_many(
        &self,
        identities: Vec<IdentityKey>,
    ) -> BoxFuture<'_, SourceResult<Vec<(IdentityKey, ErasedValue)>>>;
}

/// Trait object [ErasedSource].
pub(crate) type DynSource = Arc<dyn ErasedSource>;

pub(crate) struct SourceHandle<S: DataSource> {
    name: SourceName,
    inner: Arc<S>,
}

impl<S: DataSource> SourceHandle<S> {
    pub fn new(source: &Arc<S>) -> Self {
        SourceHandle {
            name: Arc::from(source.name()),
            inner: Arc::clone(source),
        }
    }

    fn typed(&self, identity: &IdentityKey) -> S::Identity {
        identity
            .downcast_ref::<S::Identity>()
            .unwrap_or_else(|| {
                panic!(
                    "identity for source {} has the wrong type; source names must be disjoint",
                    self.name
                )
            })
            .clone()
    }
}

impl<S: DataSource> ErasedSource for SourceHandle<S> {
    fn source_name(&self) -> SourceName {
        Arc::clone(&self.name)
    }

    fn max_batch_size(&self) -> Option<NonZeroUsize> {
        self.inner.max_batch_size()
    }

    fn fetch_one(
        &self,
        identity: IdentityKey,
    ) -> BoxFuture<'_, SourceResult<Vec<(IdentityKey, ErasedValue)>>> {
        let typed = self.typed(&identity);
        Box::pin(async move {
            let found = self.inner.fetch_one(&typed).await?;
            Ok(found
                .map(|value| (identity, Arc::new(value) as ErasedValue))
                .into_iter()
                .collect())
        })
    }

    fn fetch_many(
        &self,
        identities: Vec<IdentityKey>,
    ) -> BoxFuture<'_, SourceResult<Vec<(IdentityKey, ErasedValue)>>> {
        let typed: Vec<S::Identity> = identities
            .iter()
            .map(|identity| self.typed(identity))
            .collect();
        Box::pin(async move {
            let mut values = self.inner.fetch_many(&typed).await?;
            Ok(identities
                .into_iter()
                .zip(typed)
                .filter_map(|(key, identity)| {
                    values
                        .remove(&identity)
                        .map(|value| (key, Arc::new(value) as ErasedValue))
                })
                .collect())
        })
    }
}
