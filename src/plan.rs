//! Round planning: frontier bookkeeping and batch compilation.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::cache::{CacheKey, ErasedValue, FetchCache, IdentityKey};
use crate::source::{DynSource, Request, SourceName, SourceResult};

/// One load occurrence on the frontier. Duplicates are kept here and
/// resolved during compilation, because required-ness has to be unioned
/// across occurrences before deduplication.
pub(crate) struct FrontierEntry {
    pub source: DynSource,
    pub key: CacheKey,
    pub required: bool,
}

/// Loads executable right now, in first-encounter order.
#[derive(Default)]
pub(crate) struct Frontier {
    entries: Vec<FrontierEntry>,
}

impl Frontier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: FrontierEntry) {
        self.entries.push(entry)
    }

    pub fn entries(&self) -> &[FrontierEntry] {
        &self.entries
    }
}

/// One compiled call to one source: a deduplicated, nonempty set of
/// identities, all belonging to that source.
pub(crate) struct PlannedQuery {
    pub source: DynSource,
    pub name: SourceName,
    pub identities: Vec<IdentityKey>,
}

impl PlannedQuery {
    /// Single identities go through the source's one-shot path; anything
    /// larger goes through the batch path.
    pub fn dispatch(&self) -> BoxFuture<'_, SourceResult<Vec<(IdentityKey, ErasedValue)>>> {
        match self.identities.as_slice() {
            [identity] => self.source.fetch_one(identity.clone()),
            _ => self.source.fetch_many(self.identities.clone()),
        }
    }

    pub fn as_request(&self) -> Request {
        match self.identities.as_slice() {
            [identity] => Request::One(identity.clone()),
            _ => Request::Many(self.identities.clone()),
        }
    }
}

/// A compiled round, plus the set of keys that must come back for the run
/// to continue.
#[derive(Default)]
pub(crate) struct RoundPlan {
    pub queries: Vec<PlannedQuery>,
    pub required: HashSet<CacheKey>,
}

impl RoundPlan {
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}

/// Compile a frontier into the round's queries: drop everything the cache
/// already has, group the rest by source name, dedup identities within
/// each group, and finally split groups that exceed their source's batch
/// size limit. Grouping and identities both keep first-encounter order so
/// the round log is deterministic.
pub(crate) fn compile_round(frontier: &Frontier, cache: &dyn FetchCache) -> RoundPlan {
    struct Group {
        source: DynSource,
        name: SourceName,
        identities: Vec<IdentityKey>,
    }

    let mut groups: Vec<Group> = Vec::new();
    let mut by_name: HashMap<SourceName, usize> = HashMap::new();
    let mut seen: HashSet<CacheKey> = HashSet::new();
    let mut required: HashSet<CacheKey> = HashSet::new();

    for entry in frontier.entries() {
        if cache.get(&entry.key).is_some() {
            continue;
        }

        // Union required-ness across duplicate occurrences before dedup,
        // so an optional load never masks a required one for the same key.
        if entry.required {
            required.insert(entry.key.clone());
        }

        if !seen.insert(entry.key.clone()) {
            continue;
        }

        match by_name.entry(entry.key.source.clone()) {
            Entry::Occupied(slot) => {
                groups[*slot.get()].identities.push(entry.key.identity.clone())
            }
            Entry::Vacant(slot) => {
                slot.insert(groups.len());
                groups.push(Group {
                    source: Arc::clone(&entry.source),
                    name: entry.key.source.clone(),
                    identities: vec![entry.key.identity.clone()],
                });
            }
        }
    }

    let mut queries = Vec::with_capacity(groups.len());
    for group in groups {
        match group.source.max_batch_size() {
            None => queries.push(PlannedQuery {
                source: group.source,
                name: group.name,
                identities: group.identities,
            }),
            Some(max) => {
                for chunk in group.identities.chunks(max.get()) {
                    queries.push(PlannedQuery {
                        source: Arc::clone(&group.source),
                        name: group.name.clone(),
                        identities: chunk.to_vec(),
                    });
                }
            }
        }
    }

    RoundPlan { queries, required }
}

/// Everything a rewrite pass may resolve loads from: the round's own
/// results first (so values reach their loads even under a cache that
/// forgets), then the cache, plus the identities that were dispatched and
/// came back absent.
pub(crate) struct RoundView<'a> {
    pub cache: &'a dyn FetchCache,
    pub resolved: &'a HashMap<CacheKey, ErasedValue>,
    pub absent: &'a HashSet<CacheKey>,
}

impl RoundView<'_> {
    pub fn lookup(&self, key: &CacheKey) -> Option<ErasedValue> {
        self.resolved
            .get(key)
            .cloned()
            .or_else(|| self.cache.get(key))
    }
}
