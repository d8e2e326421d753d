//! Failure surface of a fetch run.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::sync::Arc;

use crate::cache::IdentityKey;
use crate::env::Environment;
use crate::source::{Request, SourceName};

/// A clonable, type-erased failure payload.
///
/// Payloads are what `Fetch::error` lifts into a description and what data
/// sources return through their failure channel. The concrete error type is
/// erased so that descriptions built against unrelated sources can flow
/// through the same run.
#[derive(Clone)]
pub struct ErrorPayload(Arc<dyn std::error::Error + Send + Sync>);

impl ErrorPayload {
    /// Wrap a concrete error.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ErrorPayload(Arc::new(error))
    }

    /// Construct a payload from a bare message.
    pub fn msg(message: impl Display) -> Self {
        ErrorPayload(Arc::new(Message(message.to_string())))
    }
}

impl Debug for ErrorPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for ErrorPayload {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl std::error::Error for ErrorPayload {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[derive(Debug)]
struct Message(String);

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for Message {}

/// Result alias for the `run` family of entry points.
pub type FetchResult<T> = Result<T, FetchError>;

/// Why a run failed.
///
/// The first three kinds carry the environment as it stood when the failure
/// was observed, including every round that completed, so diagnostics see
/// the whole picture even when only half of a parallel join went wrong.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// A required single-identity query resolved, but the source had no
    /// value for it.
    #[error("source {source_name} has no value for {request:?}")]
    NotFound {
        env: Environment,
        source_name: SourceName,
        request: Request,
    },

    /// Batched queries resolved with some required identities absent.
    #[error("required identities were not returned: {missing:?}")]
    MissingIdentities {
        env: Environment,
        missing: HashMap<SourceName, Vec<IdentityKey>>,
    },

    /// A failure lifted into the description with `Fetch::error` was
    /// reduced.
    #[error("unhandled failure in fetch description: {error}")]
    Unhandled { env: Environment, error: ErrorPayload },

    /// A data source call itself failed. The payload is propagated as the
    /// source produced it.
    #[error("source {source_name} failed: {error}")]
    Source {
        source_name: SourceName,
        error: ErrorPayload,
    },
}

impl FetchError {
    /// The environment at the point of failure, if this kind carries one.
    pub fn env(&self) -> Option<&Environment> {
        match self {
            FetchError::NotFound { env, .. }
            | FetchError::MissingIdentities { env, .. }
            | FetchError::Unhandled { env, .. } => Some(env),
            FetchError::Source { .. } => None,
        }
    }
}
