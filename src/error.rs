//! Error types shared by queries and mutations.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Error returned when a fetch or mutation is cancelled.
///
/// `revert` restores the state captured before the fetch started;
/// `silent` suppresses the state transition entirely.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[error("CancelledError")]
pub struct CancelledError {
    pub revert: bool,
    pub silent: bool,
}

impl CancelledError {
    /// Creates a cancellation error from the given options.
    #[must_use]
    pub const fn new(options: CancelOptions) -> Self {
        Self {
            revert: options.revert,
            silent: options.silent,
        }
    }
}

/// Options controlling how a cancellation settles the cancelled entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOptions {
    /// Restore the state from before the fetch started.
    pub revert: bool,
    /// Do not dispatch any state transition.
    pub silent: bool,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }
}

impl CancelOptions {
    /// Cancel without touching state.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            revert: true,
            silent: true,
        }
    }

    /// Cancel and record the cancellation as the query error.
    #[must_use]
    pub const fn keep_state() -> Self {
        Self {
            revert: false,
            silent: false,
        }
    }
}

/// Error type for query and mutation operations.
#[derive(Error, Debug, Clone)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    FetchError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    /// An error produced by a user-supplied function, passed through as-is.
    #[error(transparent)]
    Custom(Arc<dyn StdError + Send + Sync>),

    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    #[error("Missing queryFn: '{query_hash}'")]
    MissingQueryFn { query_hash: String },

    #[error("No mutationFn found")]
    MissingMutationFn,

    #[error("{query_hash} data is undefined")]
    UndefinedData { query_hash: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl QueryError {
    /// Wraps any error type so it can be surfaced unmodified.
    pub fn custom<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(error))
    }

    /// Returns `true` for programmer-misuse errors, which are never retried.
    #[must_use]
    pub const fn is_invariant(&self) -> bool {
        matches!(
            self,
            Self::MissingQueryFn { .. } | Self::MissingMutationFn | Self::UndefinedData { .. }
        )
    }

    /// Returns the cancellation details if this is a cancellation.
    #[must_use]
    pub const fn as_cancelled(&self) -> Option<&CancelledError> {
        match self {
            Self::Cancelled(cancelled) => Some(cancelled),
            _ => None,
        }
    }

    /// Attempts to view a [`QueryError::Custom`] payload as a concrete type.
    #[must_use]
    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        match self {
            Self::Custom(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl PartialEq for QueryError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::FetchError(a), Self::FetchError(b))
            | (Self::NetworkError(a), Self::NetworkError(b))
            | (Self::Serialization(a), Self::Serialization(b)) => a == b,
            (Self::Custom(a), Self::Custom(b)) => Arc::ptr_eq(a, b),
            (Self::Cancelled(a), Self::Cancelled(b)) => a == b,
            (Self::MissingQueryFn { query_hash: a }, Self::MissingQueryFn { query_hash: b })
            | (Self::UndefinedData { query_hash: a }, Self::UndefinedData { query_hash: b }) => {
                a == b
            }
            (Self::MissingMutationFn, Self::MissingMutationFn) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for QueryError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Returns `true` if the error is a [`CancelledError`].
#[must_use]
pub const fn is_cancelled_error(error: &QueryError) -> bool {
    matches!(error, QueryError::Cancelled(_))
}

/// Error raised while restoring a dehydrated snapshot.
#[derive(Error, Debug)]
pub enum HydrationError {
    #[error("failed to decode data for query {query_hash}: {source}")]
    QueryData {
        query_hash: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode variables for mutation {mutation_key}: {source}")]
    MutationVariables {
        mutation_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("teapot")]
    struct Teapot;

    #[test]
    fn test_query_error_display() {
        let err = QueryError::FetchError("test error".to_string());
        assert_eq!(err.to_string(), "Fetch failed: test error");

        let err = QueryError::NetworkError("network error".to_string());
        assert_eq!(err.to_string(), "Network error: network error");

        let err = QueryError::MissingQueryFn {
            query_hash: "[\"todos\"]".to_string(),
        };
        assert_eq!(err.to_string(), "Missing queryFn: '[\"todos\"]'");
    }

    #[test]
    fn test_custom_error_passes_through() {
        let err = QueryError::custom(Teapot);
        assert_eq!(err.to_string(), "teapot");
        assert!(err.downcast_ref::<Teapot>().is_some());
        assert_eq!(err.clone(), err);
        assert_ne!(err, QueryError::custom(Teapot));
    }

    #[test]
    fn test_cancelled_error_detection() {
        let err = QueryError::from(CancelledError::new(CancelOptions::default()));
        assert!(is_cancelled_error(&err));
        assert!(err.as_cancelled().is_some_and(|c| c.revert && !c.silent));
        assert!(!is_cancelled_error(&QueryError::MissingMutationFn));
    }

    #[test]
    fn test_invariant_errors() {
        assert!(QueryError::MissingMutationFn.is_invariant());
        assert!(
            QueryError::UndefinedData {
                query_hash: String::new()
            }
            .is_invariant()
        );
        assert!(!QueryError::FetchError(String::new()).is_invariant());
    }
}
