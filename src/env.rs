//! The observable artifact of a run: the ordered log of dispatched rounds
//! plus the final cache.

use crate::cache::{FetchCache, IdentityKey};
use crate::source::{Request, SourceName};

/// Bookkeeping handed back by `run_env`, or carried inside a failure.
///
/// The cache can be fed into a later run; rerunning the same description
/// against it dispatches nothing.
#[derive(Debug)]
pub struct Environment {
    pub cache: Box<dyn FetchCache>,
    pub rounds: Vec<Round>,
}

impl Environment {
    /// Total identities fetched across all rounds.
    pub fn items_fetched(&self) -> usize {
        self.rounds.iter().map(Round::items_fetched).sum()
    }
}

/// One parallel dispatch: every query here ran concurrently.
#[derive(Debug, Clone)]
pub struct Round {
    pub queries: Vec<Query>,
}

impl Round {
    pub fn batch_count(&self) -> usize {
        self.queries.len()
    }

    pub fn items_fetched(&self) -> usize {
        self.queries.iter().map(|query| query.fetched.len()).sum()
    }
}

/// One call to one source within a round, and which of the requested
/// identities actually came back.
#[derive(Debug, Clone)]
pub struct Query {
    pub source: SourceName,
    pub request: Request,
    pub fetched: Vec<IdentityKey>,
}
