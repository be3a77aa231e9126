//! Error taxonomy shared by every layer of the client runtime.

use std::time::Duration;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the client runtime.
///
/// Only [`Error::RateLimited`] is ever retried (by the
/// [`RetryPolicy`](crate::fod::RetryPolicy)); everything else propagates to the
/// caller immediately with enough context to diagnose it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad connection string, bad setting or unresolved target entity.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Obtaining or refreshing the access token failed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server asked us to back off. Consumed by the retry policy.
    #[error("rate limited by server (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The retry budget was exhausted while the server kept throttling.
    #[error("rate limit still in effect after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    /// `get_unique` found no matching document.
    #[error("query returned no results, expected exactly one")]
    NotUnique,

    /// `get_unique` found more than one matching document.
    #[error("query returned {count} results, expected exactly one")]
    MultipleResults { count: usize },

    /// A download task failed; the destination was left untouched.
    #[error("download of {target} failed: {source}")]
    Download {
        target: String,
        #[source]
        source: Box<Error>,
    },

    /// A document value did not have the requested shape.
    #[error("value at '{key}' is not {expected}")]
    TypeMismatch { key: String, expected: &'static str },

    /// The server answered with an unexpected status.
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    /// A failure of a computation that several callers waited for.
    #[error(transparent)]
    Shared(std::sync::Arc<Error>),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.root(), Error::RateLimited { .. })
    }

    /// Looks through [`Error::Shared`] wrappers to the underlying failure.
    pub fn root(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root(),
            other => other,
        }
    }

    pub(crate) fn download(target: impl Into<String>, source: Error) -> Self {
        Error::Download {
            target: target.into(),
            source: Box::new(source),
        }
    }
}
