//! Serializable snapshots of a client's caches.
//!
//! [`dehydrate`] captures successful queries and paused mutations as JSON
//! values; [`hydrate`] merges such a snapshot into another client. Query
//! entries whose type is not known yet are stored untyped and converted on
//! first typed access. Mutations are rebuilt through the typed defaults
//! registered with [`QueryClient::set_mutation_defaults`].

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::QueryClient;
use crate::config::MutationScope;
use crate::error::{HydrationError, QueryError};
use crate::key::QueryKey;
use crate::mutation::{AnyMutation, MutationState, MutationStatus};
use crate::query::{AnyQuery, FetchStatus, QueryOptions, QueryState, QueryStatus};

/// An error restored from a snapshot. Only its message survives.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RestoredError(pub String);

fn restore_error(message: Option<String>) -> Option<QueryError> {
    message.map(|message| QueryError::custom(RestoredError(message)))
}

fn to_value<T: Serialize>(value: Option<&Arc<T>>) -> Result<Option<Value>, serde_json::Error> {
    value.map(|v| serde_json::to_value(&**v)).transpose()
}

fn from_value<T: DeserializeOwned>(value: Option<Value>) -> Result<Option<Arc<T>>, serde_json::Error> {
    value
        .map(|v| serde_json::from_value(v).map(Arc::new))
        .transpose()
}

/// Serializable form of a [`QueryState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQueryState {
    pub data: Option<Value>,
    pub data_update_count: u32,
    pub data_updated_at: u64,
    pub error: Option<String>,
    pub error_update_count: u32,
    pub error_updated_at: u64,
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<String>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl DehydratedQueryState {
    pub fn from_state<T: Serialize>(state: &QueryState<T>) -> Result<Self, serde_json::Error> {
        Ok(Self {
            data: to_value(state.data.as_ref())?,
            data_update_count: state.data_update_count,
            data_updated_at: state.data_updated_at,
            error: state.error.as_ref().map(ToString::to_string),
            error_update_count: state.error_update_count,
            error_updated_at: state.error_updated_at,
            fetch_failure_count: state.fetch_failure_count,
            fetch_failure_reason: state.fetch_failure_reason.as_ref().map(ToString::to_string),
            is_invalidated: state.is_invalidated,
            status: state.status,
            fetch_status: state.fetch_status,
        })
    }

    /// Decodes the state as `T`. A restored query is never fetching.
    pub fn into_state<T: DeserializeOwned>(self) -> Result<QueryState<T>, serde_json::Error> {
        Ok(QueryState {
            data: from_value(self.data)?,
            data_update_count: self.data_update_count,
            data_updated_at: self.data_updated_at,
            error: restore_error(self.error),
            error_update_count: self.error_update_count,
            error_updated_at: self.error_updated_at,
            fetch_failure_count: self.fetch_failure_count,
            fetch_failure_reason: restore_error(self.fetch_failure_reason),
            fetch_meta: None,
            is_invalidated: self.is_invalidated,
            status: self.status,
            fetch_status: FetchStatus::Idle,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedQuery {
    pub query_key: QueryKey,
    pub query_hash: String,
    pub state: DehydratedQueryState,
    pub meta: Option<Value>,
}

/// Serializable form of a [`MutationState`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedMutationState {
    pub context: Option<Value>,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub failure_count: u32,
    pub failure_reason: Option<String>,
    pub is_paused: bool,
    pub status: MutationStatus,
    pub variables: Option<Value>,
    pub submitted_at: u64,
}

impl DehydratedMutationState {
    pub fn from_state<T: Serialize, V: Serialize, C: Serialize>(
        state: &MutationState<T, V, C>,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            context: to_value(state.context.as_ref())?,
            data: to_value(state.data.as_ref())?,
            error: state.error.as_ref().map(ToString::to_string),
            failure_count: state.failure_count,
            failure_reason: state.failure_reason.as_ref().map(ToString::to_string),
            is_paused: state.is_paused,
            status: state.status,
            variables: to_value(state.variables.as_ref())?,
            submitted_at: state.submitted_at,
        })
    }

    pub fn into_state<T: DeserializeOwned, V: DeserializeOwned, C: DeserializeOwned>(
        self,
    ) -> Result<MutationState<T, V, C>, serde_json::Error> {
        Ok(MutationState {
            context: from_value(self.context)?,
            data: from_value(self.data)?,
            error: restore_error(self.error),
            failure_count: self.failure_count,
            failure_reason: restore_error(self.failure_reason),
            is_paused: self.is_paused,
            status: self.status,
            variables: from_value(self.variables)?,
            submitted_at: self.submitted_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DehydratedMutation {
    pub mutation_key: Option<QueryKey>,
    pub state: DehydratedMutationState,
    pub meta: Option<Value>,
    pub scope: Option<MutationScope>,
}

/// A snapshot of a client's caches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DehydratedState {
    pub queries: Vec<DehydratedQuery>,
    pub mutations: Vec<DehydratedMutation>,
}

type QueryPredicate = Arc<dyn Fn(&dyn AnyQuery) -> bool + Send + Sync>;
type MutationPredicate = Arc<dyn Fn(&dyn AnyMutation) -> bool + Send + Sync>;

/// Chooses which entities [`dehydrate`] captures.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    pub should_dehydrate_query: Option<QueryPredicate>,
    pub should_dehydrate_mutation: Option<MutationPredicate>,
}

impl fmt::Debug for DehydrateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DehydrateOptions")
            .field("should_dehydrate_query", &self.should_dehydrate_query.is_some())
            .field("should_dehydrate_mutation", &self.should_dehydrate_mutation.is_some())
            .finish()
    }
}

impl DehydrateOptions {
    #[must_use]
    pub fn should_dehydrate_query(
        mut self,
        f: impl Fn(&dyn AnyQuery) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_dehydrate_query = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn should_dehydrate_mutation(
        mut self,
        f: impl Fn(&dyn AnyMutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_dehydrate_mutation = Some(Arc::new(f));
        self
    }
}

/// Default query selection: successful queries.
#[must_use]
pub fn default_should_dehydrate_query(query: &dyn AnyQuery) -> bool {
    query.snapshot().status == QueryStatus::Success
}

/// Default mutation selection: paused mutations.
#[must_use]
pub fn default_should_dehydrate_mutation(mutation: &dyn AnyMutation) -> bool {
    mutation.is_paused()
}

/// Captures the selected queries and mutations of `client`.
pub fn dehydrate(
    client: &QueryClient,
    options: &DehydrateOptions,
) -> Result<DehydratedState, HydrationError> {
    let queries = client
        .get_query_cache()
        .get_all()
        .into_iter()
        .filter(|query| {
            options
                .should_dehydrate_query
                .as_ref()
                .map_or_else(|| default_should_dehydrate_query(query.as_ref()), |f| f(query.as_ref()))
        })
        .map(|query| query.dehydrate())
        .collect::<Result<Vec<_>, _>>()?;
    let mutations = client
        .get_mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| {
            options.should_dehydrate_mutation.as_ref().map_or_else(
                || default_should_dehydrate_mutation(mutation.as_ref()),
                |f| f(mutation.as_ref()),
            )
        })
        .map(|mutation| mutation.dehydrate())
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(
        queries = queries.len(),
        mutations = mutations.len(),
        "dehydrated client"
    );
    Ok(DehydratedState { queries, mutations })
}

/// Merges `state` into `client`.
///
/// Existing queries are overwritten only by strictly newer data. Unknown
/// queries are added untyped. Mutations without a matching
/// [`QueryClient::set_mutation_defaults`] registration are skipped.
pub fn hydrate(client: &QueryClient, state: DehydratedState) -> Result<(), HydrationError> {
    let cache = client.get_query_cache();
    for dehydrated in state.queries {
        if let Some(existing) = cache.get_any(&dehydrated.query_hash) {
            existing.hydrate(dehydrated.state)?;
            continue;
        }
        let query_hash = dehydrated.query_hash.clone();
        let restored = dehydrated
            .state
            .into_state::<Value>()
            .map_err(|source| HydrationError::QueryData { query_hash, source })?;
        let options = QueryOptions::<Value>::key(dehydrated.query_key);
        let options = match dehydrated.meta {
            Some(meta) => options.meta(meta),
            None => options,
        };
        cache.insert_untyped(client.default_query_options(options), restored);
    }

    for dehydrated in state.mutations {
        if !client.hydrate_mutation(dehydrated)? {
            tracing::warn!("no mutation defaults registered for a dehydrated mutation, skipping it");
        }
    }
    Ok(())
}
