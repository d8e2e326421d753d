//! Cache behavior across rounds and across runs: priming, reuse of a
//! returned cache, and the forgetful backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::executor;

use fetchplan::{
    product, request, run_env, run_env_with_cache, CacheKey, DataSource, FetchCache,
    ForgetfulCache, IdentityKey, InMemoryCache, SourceName, SourceResult,
};

#[derive(Debug, Default)]
struct Numbers {
    calls: AtomicUsize,
    items: AtomicUsize,
}

impl Numbers {
    fn new() -> Arc<Self> {
        Arc::new(Numbers::default())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn items(&self) -> usize {
        self.items.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for Numbers {
    type Identity = u32;
    type Value = u32;

    fn name(&self) -> &str {
        "numbers"
    }

    async fn fetch_many(&self, identities: &[u32]) -> SourceResult<HashMap<u32, u32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.items.fetch_add(identities.len(), Ordering::SeqCst);
        Ok(identities
            .iter()
            .map(|&identity| (identity, identity))
            .collect())
    }
}

fn key(identity: u32) -> CacheKey {
    CacheKey::new(SourceName::from("numbers"), IdentityKey::new(identity))
}

#[test]
fn primed_identities_are_never_fetched() {
    let numbers = Numbers::new();

    let mut cache = InMemoryCache::new();
    cache.prime(&*numbers, 1, 10);

    let (env, value) =
        executor::block_on(run_env_with_cache(request(&numbers, 1), cache)).unwrap();

    // The primed value comes back, not the source's.
    assert_eq!(value, 10);
    assert!(env.rounds.is_empty());
    assert_eq!(numbers.calls(), 0);
}

#[test]
fn partially_primed_batches_fetch_the_rest() {
    let numbers = Numbers::new();

    let mut cache = InMemoryCache::new();
    cache.prime(&*numbers, 1, 10);

    let fetch = product(request(&numbers, 1), request(&numbers, 2));
    let (env, value) = executor::block_on(run_env_with_cache(fetch, cache)).unwrap();

    assert_eq!(value, (10, 2));
    assert_eq!(env.rounds.len(), 1);
    assert_eq!(env.items_fetched(), 1);
    assert_eq!(numbers.items(), 1);
}

#[test]
fn repeated_identity_across_rounds_is_fetched_once() {
    let numbers = Numbers::new();
    let inner = Arc::clone(&numbers);
    let fetch = request(&numbers, 1).flat_map(move |value| request(&inner, value));

    let (env, value) = executor::block_on(run_env(fetch)).unwrap();

    // The second round's request hits the cache, so nothing is dispatched
    // and only the first round is recorded.
    assert_eq!(value, 1);
    assert_eq!(env.rounds.len(), 1);
    assert_eq!(numbers.calls(), 1);
}

#[test]
fn rerunning_with_the_returned_cache_is_free() {
    let numbers = Numbers::new();

    let build = |source: &Arc<Numbers>| {
        let inner = Arc::clone(source);
        request(source, 1).flat_map(move |value| request(&inner, value + 1))
    };

    let (env, value) = executor::block_on(run_env(build(&numbers))).unwrap();
    assert_eq!(value, 2);
    assert_eq!(env.rounds.len(), 2);
    assert_eq!(numbers.calls(), 2);

    let (env, value) =
        executor::block_on(run_env_with_cache(build(&numbers), env.cache)).unwrap();
    assert_eq!(value, 2);
    assert!(env.rounds.is_empty());
    assert_eq!(numbers.calls(), 2);
}

#[test]
fn returned_cache_contains_every_fetched_key() {
    let numbers = Numbers::new();
    let fetch = product(request(&numbers, 1), request(&numbers, 2));

    let (env, _) = executor::block_on(run_env(fetch)).unwrap();

    for identity in [1, 2] {
        let value = env.cache.get(&key(identity)).unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&identity));
    }
    assert!(env.cache.get(&key(3)).is_none());
}

#[test]
fn forgetful_cache_refetches_across_rounds() {
    let numbers = Numbers::new();
    let inner = Arc::clone(&numbers);
    let fetch = request(&numbers, 1).flat_map(move |value| request(&inner, value));

    let (env, value) =
        executor::block_on(run_env_with_cache(fetch, ForgetfulCache::new())).unwrap();

    // Same identity on both sides of the bind: with caching disabled it is
    // dispatched again in the second round.
    assert_eq!(value, 1);
    assert_eq!(env.rounds.len(), 2);
    assert_eq!(numbers.calls(), 2);
}

#[test]
fn forgetful_cache_still_dedupes_within_a_round() {
    let numbers = Numbers::new();
    let fetch = product(request(&numbers, 1), request(&numbers, 1));

    let (env, value) =
        executor::block_on(run_env_with_cache(fetch, ForgetfulCache::new())).unwrap();

    assert_eq!(value, (1, 1));
    assert_eq!(env.rounds.len(), 1);
    assert_eq!(env.items_fetched(), 1);
    assert_eq!(numbers.items(), 1);
}
