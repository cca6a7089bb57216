use std::sync::Arc;

use thiserror::Error;

/// Error type returned by fetchers, mutation functions and persisters.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A fetcher error that can be handed to every deduplicated caller.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias used throughout the crate.
pub type QueryResult<T> = Result<T, QueryError>;

/// Errors surfaced by queries, mutations and the cache.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    /// The attempt was superseded or explicitly cancelled.
    #[error("fetch cancelled: {}", cancel_reason(.reason))]
    Cancelled {
        /// Reason given to [`CancelToken::cancel`](crate::CancelToken::cancel).
        reason: Option<String>,
    },

    /// The fetcher failed and every retry was exhausted.
    #[error("fetch failed: {0}")]
    FetchFailed(SharedError),

    /// The network is unavailable and the operation cannot be queued.
    #[error("network unavailable")]
    Offline,

    /// A mutation payload could not be encoded as a JSON object.
    #[error("failed to serialize payload: {0}")]
    SerializationFailed(String),

    /// A persisted entry could not be read or decoded.
    #[error("failed to hydrate `{key}`: {message}")]
    HydrationFailed {
        /// Normalized key of the entry.
        key: String,
        /// What went wrong.
        message: String,
    },

    /// The query was used after [`dispose`](crate::Query::dispose).
    #[error("query `{0}` has been disposed")]
    Disposed(String),

    /// A selector of a [`DerivedQuery`](crate::DerivedQuery) failed.
    #[error("selector failed: {0}")]
    SelectFailed(SharedError),

    /// The mutation function failed.
    #[error("mutation failed: {0}")]
    MutationFailed(SharedError),

    /// A queued job has no registered replay handler.
    #[error("no replay handler registered for mutation `{0}`")]
    MissingHandler(String),

    /// Two queries with different value types share a key.
    #[error("value stored under `{0}` has a different type")]
    TypeMismatch(String),

    /// A background task was requested outside of a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

fn cancel_reason(reason: &Option<String>) -> &str {
    reason.as_deref().unwrap_or("superseded")
}

impl QueryError {
    pub(crate) fn fetch_failed(error: BoxError) -> Self {
        QueryError::FetchFailed(Arc::from(error))
    }

    pub(crate) fn mutation_failed(error: BoxError) -> Self {
        QueryError::MutationFailed(Arc::from(error))
    }

    pub(crate) fn select_failed(error: BoxError) -> Self {
        QueryError::SelectFailed(Arc::from(error))
    }

    /// Whether this error only signals a superseded attempt.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QueryError::Cancelled { .. })
    }

    /// Programmer errors are never retried nor swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueryError::Disposed(_)
                | QueryError::SerializationFailed(_)
                | QueryError::TypeMismatch(_)
        )
    }
}
