//! Failure paths: identities a source doesn't know, lifted failures,
//! failing sources, and the diagnostics recorded alongside each.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::executor;

use fetchplan::{
    product, request, request_optional, run, run_env, traverse, DataSource, ErrorPayload, Fetch,
    FetchError, IdentityKey, Request, SourceResult,
};

/// Source that only knows even identities.
#[derive(Debug, Default)]
struct Evens {
    calls: AtomicUsize,
}

impl Evens {
    fn new() -> Arc<Self> {
        Arc::new(Evens::default())
    }
}

#[async_trait]
impl DataSource for Evens {
    type Identity = u32;
    type Value = u32;

    fn name(&self) -> &str {
        "evens"
    }

    async fn fetch_many(&self, identities: &[u32]) -> SourceResult<HashMap<u32, u32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(identities
            .iter()
            .filter(|&&identity| identity % 2 == 0)
            .map(|&identity| (identity, identity))
            .collect())
    }
}

/// Source whose every call fails.
#[derive(Debug, Default)]
struct Flaky;

#[async_trait]
impl DataSource for Flaky {
    type Identity = u32;
    type Value = u32;

    fn name(&self) -> &str {
        "flaky"
    }

    async fn fetch_many(&self, _identities: &[u32]) -> SourceResult<HashMap<u32, u32>> {
        Err(ErrorPayload::msg("connection refused"))
    }
}

#[test]
fn unknown_single_identity_is_not_found() {
    let evens = Evens::new();

    let error = executor::block_on(run(request(&evens, 3))).unwrap_err();
    match error {
        FetchError::NotFound {
            env,
            source_name,
            request,
        } => {
            assert_eq!(&*source_name, "evens");
            assert_eq!(request, Request::One(IdentityKey::new(3u32)));
            // The round that observed the absence is on record, with
            // nothing fetched.
            assert_eq!(env.rounds.len(), 1);
            assert_eq!(env.items_fetched(), 0);
        }
        other => panic!("expected NotFound, got {other}"),
    }
}

#[test]
fn unknown_identities_in_a_batch_are_missing_identities() {
    let evens = Evens::new();
    let fetch = traverse([1, 3, 4], |identity| request(&evens, identity));

    let error = executor::block_on(run(fetch)).unwrap_err();
    match error {
        FetchError::MissingIdentities { env, missing } => {
            assert_eq!(
                missing.get("evens").map(Vec::as_slice),
                Some(&[IdentityKey::new(1u32), IdentityKey::new(3u32)][..]),
            );
            // The even identity still made it into the record.
            assert_eq!(env.items_fetched(), 1);
        }
        other => panic!("expected MissingIdentities, got {other}"),
    }
}

#[test]
fn lifted_errors_fail_the_run() {
    let error = executor::block_on(run(Fetch::<u32>::error_msg("boom"))).unwrap_err();
    match error {
        FetchError::Unhandled { env, error } => {
            assert_eq!(error.to_string(), "boom");
            assert!(env.rounds.is_empty());
        }
        other => panic!("expected Unhandled, got {other}"),
    }
}

#[test]
fn join_failure_still_records_the_other_side() {
    let evens = Evens::new();
    let fetch = product(Fetch::<u32>::error_msg("boom"), request(&evens, 2));

    let error = executor::block_on(run(fetch)).unwrap_err();
    match error {
        FetchError::Unhandled { env, .. } => {
            // The healthy side of the join was dispatched and recorded
            // before the failure surfaced.
            assert_eq!(env.rounds.len(), 1);
            assert_eq!(env.items_fetched(), 1);
            assert_eq!(evens.calls.load(Ordering::SeqCst), 1);
        }
        other => panic!("expected Unhandled, got {other}"),
    }
}

#[test]
fn source_failures_propagate() {
    let evens = Evens::new();
    let flaky = Arc::new(Flaky);
    let fetch = product(request(&evens, 2), request(&flaky, 1));

    let error = executor::block_on(run(fetch)).unwrap_err();
    match error {
        FetchError::Source { source_name, error } => {
            assert_eq!(&*source_name, "flaky");
            assert_eq!(error.to_string(), "connection refused");
        }
        other => panic!("expected Source, got {other}"),
    }

    // The healthy source in the same round was still called exactly once.
    assert_eq!(evens.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn optional_requests_tolerate_absence() {
    let evens = Evens::new();

    let (env, value) = executor::block_on(run_env(request_optional(&evens, 3))).unwrap();

    assert_eq!(value, None);
    assert_eq!(env.rounds.len(), 1);
    assert_eq!(env.rounds[0].queries[0].fetched.len(), 0);
}

#[test]
fn optional_requests_still_return_known_values() {
    let evens = Evens::new();

    let value = executor::block_on(run(request_optional(&evens, 4))).unwrap();
    assert_eq!(value, Some(4));
}

#[test]
fn required_wins_when_deduped_with_optional() {
    let evens = Evens::new();
    let fetch = product(request_optional(&evens, 3), request(&evens, 3));

    let error = executor::block_on(run(fetch)).unwrap_err();
    assert!(matches!(error, FetchError::NotFound { .. }));
}

#[test]
fn failures_are_ordinary_results() {
    let evens = Evens::new();

    // A failed run is just an Err: recover and go again.
    let fallback = match executor::block_on(run(request(&evens, 5))) {
        Ok(value) => value,
        Err(_) => executor::block_on(run(request(&evens, 6))).unwrap(),
    };
    assert_eq!(fallback, 6);
}
