//! Declarative data fetching: describe what you need, and the scheduler
//! fetches it in the minimum number of round-trips, deduplicated, batched
//! per source, and fanned out in parallel across independent sources.

mod cache;
mod env;
mod error;
mod exec;
mod fetch;
mod plan;
mod source;


pub use cache::{CacheKey, ErasedValue, FetchCache, ForgetfulCache, IdentityKey, InMemoryCache};
pub use env::{Environment, Query, Round};
pub use error::{ErrorPayload, FetchError, FetchResult};
pub use exec::{run, run_env, run_env_with_cache, run_with_cache};
pub use fetch::{product, request, request_many, request_optional, sequence, traverse, Fetch};
pub use source::{DataSource, Request, SourceName, SourceResult};
