//! The declarative description of a fetch.
//!
//! A `Fetch<A>` is a tree, not a computation: building one performs no IO.
//! Joins are the only parallel constructor, and binds are opaque past their
//! left side; that distinction is the entire basis for batching, because
//! the planner can see through a join but never into a continuation.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use crate::cache::{CacheKey, ErasedValue, IdentityKey};
use crate::error::ErrorPayload;
use crate::plan::{Frontier, FrontierEntry, RoundView};
use crate::source::{DataSource, DynSource, SourceHandle};

/// A deferred description of one or more fetches and the computation built
/// on top of them. Run it with [crate::run] or [crate::run_env].
pub struct Fetch<A> {
    node: Node<A>,
}

enum Node<A> {
    Done(A),
    Fail(ErrorPayload),
    Load(LoadNode<A>),
    Join(Box<dyn OpaqueNode<A>>),
    Bind(Box<dyn OpaqueNode<A>>),
}

/// A single deferred load. `hit` recovers the value at its concrete type
/// from a cached entry; `miss` is how an optional load resolves when its
/// identity was dispatched and came back absent. Required loads have no
/// `miss` and instead fail the whole run.
struct LoadNode<A> {
    source: DynSource,
    key: CacheKey,
    hit: fn(&ErasedValue) -> Option<A>,
    miss: Option<fn() -> A>,
}

impl<A: Send + 'static> Fetch<A> {
    /// Lift an already-known value. Runs in zero rounds.
    pub fn pure(value: A) -> Self {
        Fetch {
            node: Node::Done(value),
        }
    }

    /// Lift a failure. Reducing it fails the surrounding run.
    pub fn error<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Fetch::fail(ErrorPayload::new(error))
    }

    /// Lift a failure from a bare message.
    pub fn error_msg(message: impl Display) -> Self {
        Fetch::fail(ErrorPayload::msg(message))
    }

    pub(crate) fn fail(error: ErrorPayload) -> Self {
        Fetch {
            node: Node::Fail(error),
        }
    }

    /// Apply a function to the result once it is available. Does not add a
    /// round.
    pub fn map<B, F>(self, f: F) -> Fetch<B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.flat_map(move |value| Fetch::pure(f(value)))
    }

    /// Sequence a dependent fetch after this one. Everything the
    /// continuation requests runs in later rounds than this side's
    /// requests, necessarily: the continuation cannot even be called until
    /// this side's value exists.
    pub fn flat_map<B, K>(self, continuation: K) -> Fetch<B>
    where
        B: Send + 'static,
        K: FnOnce(A) -> Fetch<B> + Send + 'static,
    {
        Fetch {
            node: Node::Bind(Box::new(BindNode {
                left: self,
                continuation: Box::new(continuation),
            })),
        }
    }
}

/// Request a single identity from a source. The run fails with a not-found
/// error if the source does not know the identity.
pub fn request<S: DataSource>(source: &Arc<S>, identity: S::Identity) -> Fetch<S::Value> {
    let handle: DynSource = Arc::new(SourceHandle::new(source));
    let key = CacheKey::new(handle.source_name(), IdentityKey::new(identity));
    Fetch {
        node: Node::Load(LoadNode {
            source: handle,
            key,
            hit: |value| value.downcast_ref::<S::Value>().cloned(),
            miss: None,
        }),
    }
}

/// Request a single identity, tolerating absence: an unknown identity
/// resolves to `None` instead of failing the run.
pub fn request_optional<S: DataSource>(
    source: &Arc<S>,
    identity: S::Identity,
) -> Fetch<Option<S::Value>> {
    let handle: DynSource = Arc::new(SourceHandle::new(source));
    let key = CacheKey::new(handle.source_name(), IdentityKey::new(identity));
    Fetch {
        node: Node::Load(LoadNode {
            source: handle,
            key,
            hit: |value| value.downcast_ref::<S::Value>().cloned().map(Some),
            miss: Some(|| None),
        }),
    }
}

/// Request several identities from one source. Sugar for a traverse of
/// single requests, so the identities dedup and batch like any join.
pub fn request_many<S: DataSource>(
    source: &Arc<S>,
    identities: impl IntoIterator<Item = S::Identity>,
) -> Fetch<Vec<S::Value>> {
    traverse(identities, |identity| request(source, identity))
}

/// Combine two independent fetches. Their requests share rounds, and
/// requests to the same source merge into one batch.
pub fn product<A, B>(left: Fetch<A>, right: Fetch<B>) -> Fetch<(A, B)>
where
    A: Send + 'static,
    B: Send + 'static,
{
    join_with(left, right, |a, b| (a, b))
}

/// Fetch something for every item, all in parallel.
pub fn traverse<T, A, F>(items: impl IntoIterator<Item = T>, mut f: F) -> Fetch<Vec<A>>
where
    A: Send + 'static,
    F: FnMut(T) -> Fetch<A>,
{
    items.into_iter().fold(Fetch::pure(Vec::new()), |acc, item| {
        join_with(acc, f(item), |mut values, value| {
            values.push(value);
            values
        })
    })
}

/// Collapse a sequence of fetches into a fetch of a sequence.
pub fn sequence<A: Send + 'static>(fetches: impl IntoIterator<Item = Fetch<A>>) -> Fetch<Vec<A>> {
    traverse(fetches, |fetch| fetch)
}

fn join_with<X, Y, A, F>(left: Fetch<X>, right: Fetch<Y>, combine: F) -> Fetch<A>
where
    X: Send + 'static,
    Y: Send + 'static,
    A: Send + 'static,
    F: FnOnce(X, Y) -> A + Send + 'static,
{
    join_boxed(left, right, Box::new(combine))
}

fn join_boxed<X, Y, A>(
    left: Fetch<X>,
    right: Fetch<Y>,
    combine: Box<dyn FnOnce(X, Y) -> A + Send>,
) -> Fetch<A>
where
    X: Send + 'static,
    Y: Send + 'static,
    A: Send + 'static,
{
    Fetch {
        node: Node::Join(Box::new(JoinNode {
            left,
            right,
            combine,
        })),
    }
}

/// What the executor sees when it asks whether a description is finished.
pub(crate) enum Step<A> {
    Done(A),
    Fail(ErrorPayload),
    Pending(Fetch<A>),
}

impl<A: Send + 'static> Fetch<A> {
    /// Gather the frontier: every load reachable without crossing a bind,
    /// in document order.
    pub(crate) fn collect(&self, frontier: &mut Frontier) {
        match &self.node {
            Node::Done(_) | Node::Fail(_) => {}
            Node::Load(load) => frontier.push(FrontierEntry {
                source: Arc::clone(&load.source),
                key: load.key.clone(),
                required: load.miss.is_none(),
            }),
            Node::Join(node) | Node::Bind(node) => node.collect(frontier),
        }
    }

    /// Rewrite the description after a round: resolve loads whose values
    /// are now known, and collapse joins and binds over resolved children.
    pub(crate) fn advance(self, round: &RoundView<'_>) -> Fetch<A> {
        match self.node {
            Node::Load(load) => load.advance(round),
            Node::Join(node) => node.advance(round),
            Node::Bind(node) => node.advance(round),
            node => Fetch { node },
        }
    }

    pub(crate) fn step(self) -> Step<A> {
        match self.node {
            Node::Done(value) => Step::Done(value),
            Node::Fail(error) => Step::Fail(error),
            node => Step::Pending(Fetch { node }),
        }
    }
}

impl<A: Send + 'static> LoadNode<A> {
    fn advance(self, round: &RoundView<'_>) -> Fetch<A> {
        if let Some(value) = round.lookup(&self.key) {
            match (self.hit)(&value) {
                Some(value) => Fetch::pure(value),
                // A hit of the wrong type means two sources share a name.
                None => panic!(
                    "cached value for {:?} has the wrong type; source names must be disjoint",
                    self.key
                ),
            }
        } else if round.absent.contains(&self.key) {
            match self.miss {
                Some(miss) => Fetch::pure(miss()),
                // The executor fails the run on required-but-absent
                // identities before rewriting, so a required load never
                // observes its own absence here.
                None => panic!(
                    "required identity {:?} left unresolved after its round",
                    self.key
                ),
            }
        } else {
            Fetch {
                node: Node::Load(self),
            }
        }
    }
}

/// Erased join/bind storage. The node hides the intermediate value types;
/// the planner only ever needs to walk it or rewrite it.
trait OpaqueNode<A>: Send {
    fn collect(&self, frontier: &mut Frontier);
    fn advance(self: Box<Self>, round: &RoundView<'_>) -> Fetch<A>;
}

struct JoinNode<X, Y, A> {
    left: Fetch<X>,
    right: Fetch<Y>,
    combine: Box<dyn FnOnce(X, Y) -> A + Send>,
}

impl<X, Y, A> OpaqueNode<A> for JoinNode<X, Y, A>
where
    X: Send + 'static,
    Y: Send + 'static,
    A: Send + 'static,
{
    fn collect(&self, frontier: &mut Frontier) {
        self.left.collect(frontier);
        self.right.collect(frontier);
    }

    fn advance(self: Box<Self>, round: &RoundView<'_>) -> Fetch<A> {
        let JoinNode {
            left,
            right,
            combine,
        } = *self;
        let left = left.advance(round);
        let right = right.advance(round);
        match (left.node, right.node) {
            // Either side failing fails the join; the other side's results
            // are already merged and recorded by the time we get here.
            (Node::Fail(error), _) | (_, Node::Fail(error)) => Fetch::fail(error),
            (Node::Done(x), Node::Done(y)) => Fetch::pure(combine(x, y)),
            (left, right) => join_boxed(Fetch { node: left }, Fetch { node: right }, combine),
        }
    }
}

struct BindNode<X, A> {
    left: Fetch<X>,
    continuation: Box<dyn FnOnce(X) -> Fetch<A> + Send>,
}

impl<X, A> OpaqueNode<A> for BindNode<X, A>
where
    X: Send + 'static,
    A: Send + 'static,
{
    fn collect(&self, frontier: &mut Frontier) {
        self.left.collect(frontier)
    }

    fn advance(self: Box<Self>, round: &RoundView<'_>) -> Fetch<A> {
        let BindNode { left, continuation } = *self;
        match left.advance(round).node {
            Node::Fail(error) => Fetch::fail(error),
            // The continuation's result is deliberately not advanced
            // against this round: its loads were never dispatched, and
            // resolving them from the round's results would let values leak
            // across the bind boundary even under a cache that forgets.
            // The driver loop replans and resolves them from the cache
            // proper.
            Node::Done(value) => continuation(value),
            node => Fetch {
                node: Node::Bind(Box::new(BindNode {
                    left: Fetch { node },
                    continuation,
                })),
            },
        }
    }
}

impl<A> Debug for Fetch<A> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.node {
            Node::Done(_) => f.write_str("Fetch::Pure"),
            Node::Fail(error) => write!(f, "Fetch::Fail({error})"),
            Node::Load(load) => write!(f, "Fetch::Load({:?})", load.key),
            Node::Join(_) => f.write_str("Fetch::Join(<opaque>)"),
            Node::Bind(_) => f.write_str("Fetch::Bind(<opaque>)"),
        }
    }
}
