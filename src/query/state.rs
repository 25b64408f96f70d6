//! Query state and its transitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::key::QueryKey;
use crate::time::now_millis;

/// Whether a query has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    #[default]
    Pending,
    Success,
    Error,
}

/// Whether the query function is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Fetching,
    /// Wanted to fetch but is waiting for the network or focus.
    Paused,
    #[default]
    Idle,
}

/// Direction of an infinite query page fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchDirection {
    Forward,
    Backward,
}

/// Extra information attached to a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchMeta {
    pub fetch_more: Option<FetchDirection>,
}

/// The complete state of one query.
#[derive(Debug)]
pub struct QueryState<T> {
    pub data: Option<Arc<T>>,
    pub data_update_count: u32,
    /// Epoch milliseconds of the last successful update, 0 if never.
    pub data_updated_at: u64,
    pub error: Option<QueryError>,
    pub error_update_count: u32,
    pub error_updated_at: u64,
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<QueryError>,
    pub fetch_meta: Option<FetchMeta>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: self.error.clone(),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            fetch_failure_reason: self.fetch_failure_reason.clone(),
            fetch_meta: self.fetch_meta,
            is_invalidated: self.is_invalidated,
            status: self.status,
            fetch_status: self.fetch_status,
        }
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            data_update_count: 0,
            data_updated_at: 0,
            error: None,
            error_update_count: 0,
            error_updated_at: 0,
            fetch_failure_count: 0,
            fetch_failure_reason: None,
            fetch_meta: None,
            is_invalidated: false,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
        }
    }
}

impl<T> QueryState<T> {
    /// Initial state, optionally seeded with data.
    pub fn initial(data: Option<Arc<T>>, data_updated_at: Option<u64>) -> Self {
        match data {
            Some(data) => Self {
                data: Some(data),
                data_updated_at: data_updated_at.unwrap_or_else(now_millis),
                status: QueryStatus::Success,
                ..Self::default()
            },
            None => Self::default(),
        }
    }

    #[must_use]
    pub const fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// The state a fetch moves to: fetching (or paused when it cannot
    /// start), and pending if there is no data yet.
    pub(crate) fn fetching(&self, can_fetch: bool) -> Self {
        let mut next = self.clone();
        next.fetch_failure_count = 0;
        next.fetch_failure_reason = None;
        next.fetch_status = if can_fetch {
            FetchStatus::Fetching
        } else {
            FetchStatus::Paused
        };
        if next.data.is_none() {
            next.error = None;
            next.status = QueryStatus::Pending;
        }
        next
    }

    /// Reads the untyped parts of the state.
    pub(crate) fn snapshot(&self, query_key: &QueryKey, query_hash: &str) -> QuerySnapshot {
        QuerySnapshot {
            query_key: query_key.clone(),
            query_hash: query_hash.to_string(),
            status: self.status,
            fetch_status: self.fetch_status,
            has_data: self.data.is_some(),
            data_updated_at: self.data_updated_at,
            data_update_count: self.data_update_count,
            error_updated_at: self.error_updated_at,
            error_update_count: self.error_update_count,
            fetch_failure_count: self.fetch_failure_count,
            is_invalidated: self.is_invalidated,
            fetch_meta: self.fetch_meta,
        }
    }
}

/// A partial update applied with [`Action::SetState`].
pub type StatePatch<T> = Box<dyn FnOnce(&mut QueryState<T>) + Send>;

/// A state transition.
pub(crate) enum Action<T> {
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Fetch {
        meta: Option<FetchMeta>,
        can_fetch: bool,
    },
    Success {
        data: Arc<T>,
        data_updated_at: Option<u64>,
        /// Written directly rather than by a fetch; leaves the fetch status
        /// alone.
        manual: bool,
    },
    Error {
        error: QueryError,
    },
    Invalidate,
    SetState(StatePatch<T>),
}

/// Kind of the last action, reported with cache update events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Failed,
    Pause,
    Continue,
    Fetch,
    Success,
    Error,
    Invalidate,
    SetState,
}

impl<T> Action<T> {
    pub const fn kind(&self) -> ActionKind {
        match self {
            Self::Failed { .. } => ActionKind::Failed,
            Self::Pause => ActionKind::Pause,
            Self::Continue => ActionKind::Continue,
            Self::Fetch { .. } => ActionKind::Fetch,
            Self::Success { .. } => ActionKind::Success,
            Self::Error { .. } => ActionKind::Error,
            Self::Invalidate => ActionKind::Invalidate,
            Self::SetState(_) => ActionKind::SetState,
        }
    }
}

/// Applies `action` to `state`. `revert_state` is the state captured when
/// the running fetch started.
pub(crate) fn reduce<T>(
    state: &QueryState<T>,
    action: Action<T>,
    revert_state: &mut Option<QueryState<T>>,
) -> QueryState<T> {
    match action {
        Action::Failed {
            failure_count,
            error,
        } => QueryState {
            fetch_failure_count: failure_count,
            fetch_failure_reason: Some(error),
            ..state.clone()
        },
        Action::Pause => QueryState {
            fetch_status: FetchStatus::Paused,
            ..state.clone()
        },
        Action::Continue => QueryState {
            fetch_status: FetchStatus::Fetching,
            ..state.clone()
        },
        Action::Fetch { meta, can_fetch } => QueryState {
            fetch_meta: meta,
            ..state.fetching(can_fetch)
        },
        Action::Success {
            data,
            data_updated_at,
            manual,
        } => {
            *revert_state = None;
            let mut next = QueryState {
                data: Some(data),
                data_update_count: state.data_update_count + 1,
                data_updated_at: data_updated_at.unwrap_or_else(now_millis),
                error: None,
                is_invalidated: false,
                status: QueryStatus::Success,
                ..state.clone()
            };
            if !manual {
                next.fetch_status = FetchStatus::Idle;
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
            }
            next
        }
        Action::Error { error } => {
            if let Some(cancelled) = error.as_cancelled()
                && cancelled.revert
                && let Some(revert) = revert_state.take()
            {
                return QueryState {
                    fetch_status: FetchStatus::Idle,
                    ..revert
                };
            }
            QueryState {
                error: Some(error.clone()),
                error_update_count: state.error_update_count + 1,
                error_updated_at: now_millis(),
                fetch_failure_count: state.fetch_failure_count + 1,
                fetch_failure_reason: Some(error),
                fetch_status: FetchStatus::Idle,
                status: QueryStatus::Error,
                ..state.clone()
            }
        }
        Action::Invalidate => QueryState {
            is_invalidated: true,
            ..state.clone()
        },
        Action::SetState(patch) => {
            let mut next = state.clone();
            patch(&mut next);
            next
        }
    }
}

/// Type-independent view of a query, handed to option resolvers, filters
/// and predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySnapshot {
    pub query_key: QueryKey,
    pub query_hash: String,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub has_data: bool,
    pub data_updated_at: u64,
    pub data_update_count: u32,
    pub error_updated_at: u64,
    pub error_update_count: u32,
    pub fetch_failure_count: u32,
    pub is_invalidated: bool,
    pub fetch_meta: Option<FetchMeta>,
}

impl QuerySnapshot {
    /// Snapshot of a query that has never been fetched.
    #[must_use]
    pub fn detached(query_key: QueryKey) -> Self {
        let query_hash = query_key.hash();
        QueryState::<()>::default().snapshot(&query_key, &query_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CancelOptions, CancelledError};

    fn success(state: &QueryState<i32>, value: i32) -> QueryState<i32> {
        reduce(
            state,
            Action::Success {
                data: Arc::new(value),
                data_updated_at: Some(100),
                manual: false,
            },
            &mut None,
        )
    }

    #[test]
    fn test_initial_state() {
        let state = QueryState::<i32>::initial(None, None);
        assert_eq!(state.status, QueryStatus::Pending);
        assert_eq!(state.fetch_status, FetchStatus::Idle);

        let state = QueryState::initial(Some(Arc::new(1)), Some(42));
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data_updated_at, 42);
        assert_eq!(state.data_update_count, 0);
    }

    #[test]
    fn test_fetch_then_success() {
        let state = QueryState::<i32>::default();
        let fetching = reduce(
            &state,
            Action::Fetch {
                meta: None,
                can_fetch: true,
            },
            &mut None,
        );
        assert_eq!(fetching.fetch_status, FetchStatus::Fetching);
        assert_eq!(fetching.status, QueryStatus::Pending);

        let done = success(&fetching, 7);
        assert_eq!(done.status, QueryStatus::Success);
        assert_eq!(done.fetch_status, FetchStatus::Idle);
        assert_eq!(done.data.as_deref(), Some(&7));
        assert_eq!(done.data_update_count, 1);
    }

    #[test]
    fn test_fetch_while_offline_is_paused() {
        let state = QueryState::<i32>::default();
        let next = reduce(
            &state,
            Action::Fetch {
                meta: None,
                can_fetch: false,
            },
            &mut None,
        );
        assert_eq!(next.fetch_status, FetchStatus::Paused);
    }

    #[test]
    fn test_manual_success_keeps_fetch_status() {
        let fetching = QueryState::<i32>::default().fetching(true);
        let next = reduce(
            &fetching,
            Action::Success {
                data: Arc::new(1),
                data_updated_at: None,
                manual: true,
            },
            &mut None,
        );
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.fetch_status, FetchStatus::Fetching);
    }

    #[test]
    fn test_error_counts_failures() {
        let fetching = QueryState::<i32>::default().fetching(true);
        let next = reduce(
            &fetching,
            Action::Error {
                error: QueryError::FetchError("boom".to_string()),
            },
            &mut None,
        );
        assert_eq!(next.status, QueryStatus::Error);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
        assert_eq!(next.error_update_count, 1);
        assert_eq!(next.fetch_failure_count, 1);
    }

    #[test]
    fn test_reverting_cancellation_restores_previous_state() {
        let before = success(&QueryState::default(), 1);
        let mut revert = Some(before.clone());
        let fetching = before.fetching(true);
        let cancelled = QueryError::from(CancelledError::new(CancelOptions::default()));
        let next = reduce(&fetching, Action::Error { error: cancelled }, &mut revert);
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
        assert!(next.error.is_none());
        assert!(revert.is_none());
    }

    #[test]
    fn test_non_reverting_cancellation_records_error() {
        let mut revert = Some(QueryState::<i32>::default());
        let fetching = QueryState::<i32>::default().fetching(true);
        let cancelled = QueryError::from(CancelledError::new(CancelOptions::keep_state()));
        let next = reduce(&fetching, Action::Error { error: cancelled }, &mut revert);
        assert_eq!(next.status, QueryStatus::Error);
        assert!(next.error.as_ref().is_some_and(crate::is_cancelled_error));
    }

    #[test]
    fn test_invalidate() {
        let state = success(&QueryState::default(), 1);
        let next = reduce(&state, Action::Invalidate, &mut None);
        assert!(next.is_invalidated);
        let refreshed = success(&next, 2);
        assert!(!refreshed.is_invalidated);
    }

    #[test]
    fn test_snapshot_detached() {
        let snapshot = QuerySnapshot::detached(QueryKey::from("todos"));
        assert_eq!(snapshot.query_hash, "[\"todos\"]");
        assert!(!snapshot.has_data);
        assert_eq!(snapshot.status, QueryStatus::Pending);
    }
}
