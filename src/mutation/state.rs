//! Mutation state and its transitions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::time::now_millis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// The complete state of one mutation.
#[derive(Debug)]
pub struct MutationState<T, V, C> {
    /// Returned by `on_mutate`, handed to the later callbacks.
    pub context: Option<Arc<C>>,
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    /// Waiting for the network, focus, or an earlier mutation of the same
    /// scope.
    pub is_paused: bool,
    pub status: MutationStatus,
    pub variables: Option<Arc<V>>,
    pub submitted_at: u64,
}

impl<T, V, C> Clone for MutationState<T, V, C> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            data: self.data.clone(),
            error: self.error.clone(),
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_paused: self.is_paused,
            status: self.status,
            variables: self.variables.clone(),
            submitted_at: self.submitted_at,
        }
    }
}

impl<T, V, C> Default for MutationState<T, V, C> {
    fn default() -> Self {
        Self {
            context: None,
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Idle,
            variables: None,
            submitted_at: 0,
        }
    }
}

pub(crate) enum MutationAction<T, V, C> {
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Pending {
        variables: Arc<V>,
        context: Option<Arc<C>>,
        is_paused: bool,
    },
    Success {
        data: Arc<T>,
    },
    Error {
        error: QueryError,
    },
}

/// Which transition a mutation went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationActionKind {
    Failed,
    Pause,
    Continue,
    Pending,
    Success,
    Error,
}

impl<T, V, C> MutationAction<T, V, C> {
    pub(crate) const fn kind(&self) -> MutationActionKind {
        match self {
            Self::Failed { .. } => MutationActionKind::Failed,
            Self::Pause => MutationActionKind::Pause,
            Self::Continue => MutationActionKind::Continue,
            Self::Pending { .. } => MutationActionKind::Pending,
            Self::Success { .. } => MutationActionKind::Success,
            Self::Error { .. } => MutationActionKind::Error,
        }
    }
}

pub(crate) fn reduce<T, V, C>(
    state: &MutationState<T, V, C>,
    action: MutationAction<T, V, C>,
) -> MutationState<T, V, C> {
    match action {
        MutationAction::Failed {
            failure_count,
            error,
        } => MutationState {
            failure_count,
            failure_reason: Some(error),
            ..state.clone()
        },
        MutationAction::Pause => MutationState {
            is_paused: true,
            ..state.clone()
        },
        MutationAction::Continue => MutationState {
            is_paused: false,
            ..state.clone()
        },
        MutationAction::Pending {
            variables,
            context,
            is_paused,
        } => MutationState {
            context,
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused,
            status: MutationStatus::Pending,
            variables: Some(variables),
            submitted_at: now_millis(),
        },
        MutationAction::Success { data } => MutationState {
            data: Some(data),
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Success,
            ..state.clone()
        },
        MutationAction::Error { error } => MutationState {
            data: None,
            failure_count: state.failure_count + 1,
            failure_reason: Some(error.clone()),
            error: Some(error),
            is_paused: false,
            status: MutationStatus::Error,
            ..state.clone()
        },
    }
}
