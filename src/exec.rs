// The driver loop. Each iteration: collect the frontier, compile it
// against the cache, dispatch the compiled queries in parallel, merge
// every result into the cache in one synchronous step, record the round,
// then rewrite the description and go again. Suspension happens at exactly
// one point per round, the parallel await of the round's queries.

use std::collections::{HashMap, HashSet};

use futures::future::join_all;

use crate::cache::{CacheKey, ErasedValue, FetchCache, IdentityKey, InMemoryCache};
use crate::env::{Environment, Query, Round};
use crate::error::{ErrorPayload, FetchError, FetchResult};
use crate::fetch::{Fetch, Step};
use crate::plan::{compile_round, Frontier, PlannedQuery, RoundPlan, RoundView};
use crate::source::{Request, SourceName};

/// Run a description against a fresh in-memory cache and return its value.
pub async fn run<A>(fetch: Fetch<A>) -> FetchResult<A>
where
    A: Send + 'static,
{
    run_with_cache(fetch, InMemoryCache::new()).await
}

/// Run a description against a caller-supplied (possibly pre-seeded)
/// cache.
pub async fn run_with_cache<A, C>(fetch: Fetch<A>, cache: C) -> FetchResult<A>
where
    A: Send + 'static,
    C: FetchCache + 'static,
{
    run_env_with_cache(fetch, cache)
        .await
        .map(|(_, value)| value)
}

/// Like [run], but also return the run's bookkeeping: the rounds that were
/// dispatched and the final cache.
pub async fn run_env<A>(fetch: Fetch<A>) -> FetchResult<(Environment, A)>
where
    A: Send + 'static,
{
    run_env_with_cache(fetch, InMemoryCache::new()).await
}

/// The full entry point: caller-supplied cache, bookkeeping returned.
pub async fn run_env_with_cache<A, C>(fetch: Fetch<A>, cache: C) -> FetchResult<(Environment, A)>
where
    A: Send + 'static,
    C: FetchCache + 'static,
{
    let mut cache: Box<dyn FetchCache> = Box::new(cache);
    let mut rounds: Vec<Round> = Vec::new();
    let mut fetch = fetch;

    let no_resolved: HashMap<CacheKey, ErasedValue> = HashMap::new();
    let no_absent: HashSet<CacheKey> = HashSet::new();

    loop {
        let mut frontier = Frontier::new();
        fetch.collect(&mut frontier);
        let plan = compile_round(&frontier, &*cache);

        if plan.is_empty() {
            match fetch.step() {
                Step::Done(value) => {
                    tracing::debug!(rounds = rounds.len(), "fetch run complete");
                    return Ok((Environment { cache, rounds }, value));
                }
                Step::Fail(error) => {
                    return Err(FetchError::Unhandled {
                        env: Environment { cache, rounds },
                        error,
                    });
                }
                // Nothing to dispatch, but the description isn't terminal:
                // the frontier is empty or fully cached, so it reduces
                // without touching any source.
                Step::Pending(pending) => {
                    fetch = pending.advance(&RoundView {
                        cache: &*cache,
                        resolved: &no_resolved,
                        absent: &no_absent,
                    });
                    continue;
                }
            }
        }

        tracing::debug!(
            round = rounds.len() + 1,
            batches = plan.queries.len(),
            "dispatching round"
        );
        let results = join_all(plan.queries.iter().map(PlannedQuery::dispatch)).await;

        // Gather-then-merge: every batch result of the round lands in the
        // cache in this single synchronous pass, before anything else looks
        // at it.
        let mut resolved: HashMap<CacheKey, ErasedValue> = HashMap::new();
        let mut absent: HashSet<CacheKey> = HashSet::new();
        let mut source_error: Option<(SourceName, ErrorPayload)> = None;
        let mut queries = Vec::with_capacity(plan.queries.len());

        for (planned, result) in plan.queries.iter().zip(results) {
            let mut fetched = Vec::new();
            match result {
                Ok(pairs) => {
                    let mut values: HashMap<IdentityKey, ErasedValue> =
                        pairs.into_iter().collect();
                    for identity in &planned.identities {
                        let key = CacheKey::new(planned.name.clone(), identity.clone());
                        match values.remove(identity) {
                            Some(value) => {
                                cache.put(key.clone(), value.clone());
                                resolved.insert(key, value);
                                fetched.push(identity.clone());
                            }
                            None => {
                                absent.insert(key);
                            }
                        }
                    }
                }
                Err(error) => {
                    if source_error.is_none() {
                        source_error = Some((planned.name.clone(), error));
                    }
                }
            }
            queries.push(Query {
                source: planned.name.clone(),
                request: planned.as_request(),
                fetched,
            });
        }

        let round = Round { queries };
        tracing::trace!(
            round = rounds.len() + 1,
            items = round.items_fetched(),
            "merged round results"
        );
        rounds.push(round);

        if let Some((source_name, error)) = source_error {
            return Err(FetchError::Source { source_name, error });
        }

        let missing = missing_required(&plan, &absent);
        if missing.total > 0 {
            let env = Environment { cache, rounds };
            return Err(match missing.single {
                Some((source_name, identity)) if missing.total == 1 => FetchError::NotFound {
                    env,
                    source_name,
                    request: Request::One(identity),
                },
                _ => FetchError::MissingIdentities {
                    env,
                    missing: missing.by_source,
                },
            });
        }

        fetch = fetch.advance(&RoundView {
            cache: &*cache,
            resolved: &resolved,
            absent: &absent,
        });
    }
}

struct MissingReport {
    by_source: HashMap<SourceName, Vec<IdentityKey>>,
    single: Option<(SourceName, IdentityKey)>,
    total: usize,
}

/// Walk the round's queries in dispatch order and pick out the required
/// identities that came back absent. `single` remembers whether the first
/// of them was a one-identity query, which decides the error kind.
fn missing_required(plan: &RoundPlan, absent: &HashSet<CacheKey>) -> MissingReport {
    let mut report = MissingReport {
        by_source: HashMap::new(),
        single: None,
        total: 0,
    };

    for planned in &plan.queries {
        for identity in &planned.identities {
            let key = CacheKey::new(planned.name.clone(), identity.clone());
            if absent.contains(&key) && plan.required.contains(&key) {
                report.total += 1;
                if planned.identities.len() == 1 && report.single.is_none() {
                    report.single = Some((planned.name.clone(), identity.clone()));
                }
                report
                    .by_source
                    .entry(planned.name.clone())
                    .or_default()
                    .push(identity.clone());
            }
        }
    }

    report
}
