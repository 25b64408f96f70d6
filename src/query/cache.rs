//! The query cache: every live query of one client, keyed by hash.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{AnyQuery, Query, QueryData, QueryOptions, QueryState, downcast_query};
use crate::client::{Environment, QueryClient};
use crate::error::QueryError;
use crate::filters::QueryFilters;
use crate::gc::EntityId;
use crate::query::state::ActionKind;
use crate::subscription::{Listeners, Unsubscribe};

type ErrorCallback = Arc<dyn Fn(&QueryError, &dyn AnyQuery) + Send + Sync>;
type SuccessCallback = Arc<dyn Fn(&dyn AnyQuery) + Send + Sync>;
type SettledCallback = Arc<dyn Fn(Option<&QueryError>, &dyn AnyQuery) + Send + Sync>;

/// Cache-wide callbacks, invoked for every query before its observers see
/// the outcome. Cancellations invoke none of them.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    pub on_error: Option<ErrorCallback>,
    pub on_success: Option<SuccessCallback>,
    pub on_settled: Option<SettledCallback>,
}

impl fmt::Debug for QueryCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCacheConfig")
            .field("on_error", &self.on_error.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl QueryCacheConfig {
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&QueryError, &dyn AnyQuery) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_success(mut self, f: impl Fn(&dyn AnyQuery) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&QueryError>, &dyn AnyQuery) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Events emitted by the query cache.
#[derive(Clone)]
pub enum QueryCacheEvent {
    Added {
        query: Arc<dyn AnyQuery>,
    },
    Removed {
        query: Arc<dyn AnyQuery>,
    },
    Updated {
        query: Arc<dyn AnyQuery>,
        action: ActionKind,
    },
    ObserverAdded {
        query: Arc<dyn AnyQuery>,
        observer: EntityId,
    },
    ObserverRemoved {
        query: Arc<dyn AnyQuery>,
        observer: EntityId,
    },
    ObserverResultsUpdated {
        query: Arc<dyn AnyQuery>,
    },
    ObserverOptionsUpdated {
        query: Arc<dyn AnyQuery>,
        observer: EntityId,
    },
}

impl QueryCacheEvent {
    #[must_use]
    pub fn query(&self) -> &Arc<dyn AnyQuery> {
        match self {
            Self::Added { query }
            | Self::Removed { query }
            | Self::Updated { query, .. }
            | Self::ObserverAdded { query, .. }
            | Self::ObserverRemoved { query, .. }
            | Self::ObserverResultsUpdated { query }
            | Self::ObserverOptionsUpdated { query, .. } => query,
        }
    }
}

impl fmt::Debug for QueryCacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added { .. } => "Added",
            Self::Removed { .. } => "Removed",
            Self::Updated { .. } => "Updated",
            Self::ObserverAdded { .. } => "ObserverAdded",
            Self::ObserverRemoved { .. } => "ObserverRemoved",
            Self::ObserverResultsUpdated { .. } => "ObserverResultsUpdated",
            Self::ObserverOptionsUpdated { .. } => "ObserverOptionsUpdated",
        };
        let mut s = f.debug_struct(name);
        s.field("query_hash", &self.query().query_hash());
        if let Self::Updated { action, .. } = self {
            s.field("action", action);
        }
        s.finish()
    }
}

type CacheListener = dyn Fn(&QueryCacheEvent) + Send + Sync;

pub(crate) struct CacheShared {
    queries: DashMap<String, Arc<dyn AnyQuery>>,
    listeners: Listeners<CacheListener>,
    config: QueryCacheConfig,
    env: Environment,
}

/// Holds every query of a client.
///
/// Cheap to clone; clones share the same map.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<CacheShared>,
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.inner.queries.len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl QueryCache {
    pub(crate) fn new(config: QueryCacheConfig, env: Environment) -> Self {
        Self {
            inner: Arc::new(CacheShared {
                queries: DashMap::new(),
                listeners: Listeners::default(),
                config,
                env,
            }),
        }
    }

    pub(crate) const fn from_shared(inner: Arc<CacheShared>) -> Self {
        Self { inner }
    }

    /// Returns the query for `options`' key, creating it with the client's
    /// defaults applied if it does not exist.
    pub fn build<T: QueryData>(&self, client: &QueryClient, options: QueryOptions<T>) -> Arc<Query<T>> {
        self.build_with_state(client, options, None)
    }

    pub(crate) fn build_with_state<T: QueryData>(
        &self,
        client: &QueryClient,
        options: QueryOptions<T>,
        state: Option<QueryState<T>>,
    ) -> Arc<Query<T>> {
        let options = client.default_query_options(options);
        let mut replaced = None;
        let (query, added) = match self.inner.queries.entry(options.query_hash()) {
            Entry::Occupied(mut entry) => {
                if let Some(query) = downcast_query::<T>(entry.get()) {
                    (query, false)
                } else {
                    let previous = entry.get().clone();
                    let state = state.or_else(|| convert_state(previous.as_ref()));
                    let query = self.create(options, state);
                    entry.insert(query.clone());
                    replaced = Some(previous);
                    (query, true)
                }
            }
            Entry::Vacant(entry) => {
                let query = self.create(options, state);
                entry.insert(query.clone());
                (query, true)
            }
        };
        if let Some(previous) = replaced {
            previous.destroy();
            self.notify(&QueryCacheEvent::Removed { query: previous });
        }
        if added {
            self.notify(&QueryCacheEvent::Added {
                query: query.clone(),
            });
        }
        query
    }

    /// Inserts an untyped entry unless the hash is taken.
    pub(crate) fn insert_untyped(
        &self,
        options: QueryOptions<serde_json::Value>,
        state: QueryState<serde_json::Value>,
    ) -> Option<Arc<dyn AnyQuery>> {
        let query: Arc<dyn AnyQuery> = match self.inner.queries.entry(options.query_hash()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(entry) => {
                let query: Arc<dyn AnyQuery> = self.create(options, Some(state));
                entry.insert(query.clone());
                query
            }
        };
        self.notify(&QueryCacheEvent::Added {
            query: query.clone(),
        });
        Some(query)
    }

    fn create<T: QueryData>(
        &self,
        options: QueryOptions<T>,
        state: Option<QueryState<T>>,
    ) -> Arc<Query<T>> {
        Query::new(
            Arc::downgrade(&self.inner),
            self.inner.env.clone(),
            options,
            state,
        )
    }

    /// The typed query stored under `query_hash`.
    ///
    /// An entry of another type (e.g. one restored by hydration) is
    /// converted through its serialized form; if that fails the entry is
    /// treated as missing.
    #[must_use]
    pub fn get<T: QueryData>(&self, query_hash: &str) -> Option<Arc<Query<T>>> {
        let existing = self.get_any(query_hash)?;
        if let Some(query) = downcast_query::<T>(&existing) {
            return Some(query);
        }
        let state = convert_state::<T>(existing.as_ref())?;
        let options = QueryOptions::<T>::key(existing.query_key().clone())
            .gc_time(existing.gc_time());
        let options = match existing.meta() {
            Some(meta) => options.meta(meta),
            None => options,
        };
        let query = self.create(options, Some(state));
        let swapped = self
            .inner
            .queries
            .get_mut(query_hash)
            .filter(|entry| entry.id() == existing.id())
            .map(|mut entry| *entry = query.clone() as Arc<dyn AnyQuery>)
            .is_some();
        if !swapped {
            query.destroy();
            return self.get_any(query_hash).and_then(|q| downcast_query(&q));
        }
        existing.destroy();
        self.notify(&QueryCacheEvent::Removed { query: existing });
        self.notify(&QueryCacheEvent::Added {
            query: query.clone(),
        });
        Some(query)
    }

    /// The type-erased entry stored under `query_hash`.
    #[must_use]
    pub fn get_any(&self, query_hash: &str) -> Option<Arc<dyn AnyQuery>> {
        self.inner.queries.get(query_hash).map(|q| q.value().clone())
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<dyn AnyQuery>> {
        self.inner
            .queries
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queries.is_empty()
    }

    /// First query matching `filters`. Unlike [`QueryCache::find_all`], a
    /// key filter matches exactly unless the caller builds the filter by
    /// hand with `exact: false`.
    #[must_use]
    pub fn find(&self, filters: &QueryFilters) -> Option<Arc<dyn AnyQuery>> {
        self.get_all().into_iter().find(|q| filters.matches(q.as_ref()))
    }

    #[must_use]
    pub fn find_all(&self, filters: &QueryFilters) -> Vec<Arc<dyn AnyQuery>> {
        self.get_all()
            .into_iter()
            .filter(|q| filters.matches(q.as_ref()))
            .collect()
    }

    /// Removes `query` if it is still the cached entry for its hash.
    pub fn remove_query(&self, query: &dyn AnyQuery) {
        self.remove(query.id(), query.query_hash());
    }

    pub(crate) fn remove(&self, id: EntityId, query_hash: &str) {
        let removed = self
            .inner
            .queries
            .remove_if(query_hash, |_, query| query.id() == id)
            .map(|(_, query)| query);
        if let Some(query) = removed {
            query.destroy();
            self.notify(&QueryCacheEvent::Removed { query });
        }
    }

    /// Removes every query.
    pub fn clear(&self) {
        let queries = self.get_all();
        self.inner.env.notify.batch(|| {
            for query in queries {
                self.remove_query(query.as_ref());
            }
        });
    }

    /// Subscribes to cache events.
    pub fn subscribe(&self, listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static) -> Unsubscribe {
        let (key, _) = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(key);
            }
        })
    }

    pub(crate) fn notify(&self, event: &QueryCacheEvent) {
        let listeners = self.inner.listeners.snapshot();
        self.inner.env.notify.batch(|| {
            for (_, listener) in listeners {
                listener(event);
            }
        });
    }

    pub(crate) fn on_success(&self, query: &dyn AnyQuery) {
        let config = &self.inner.config;
        if let Some(on_success) = &config.on_success {
            on_success(query);
        }
        if let Some(on_settled) = &config.on_settled {
            on_settled(None, query);
        }
    }

    pub(crate) fn on_error(&self, error: &QueryError, query: &dyn AnyQuery) {
        let config = &self.inner.config;
        if let Some(on_error) = &config.on_error {
            on_error(error, query);
        }
        if let Some(on_settled) = &config.on_settled {
            on_settled(Some(error), query);
        }
    }

    /// Lets every query react to regained focus.
    pub fn on_focus(&self) {
        let queries = self.get_all();
        self.inner.env.notify.batch(|| {
            for query in queries {
                query.on_focus();
            }
        });
    }

    /// Lets every query react to a regained connection.
    pub fn on_online(&self) {
        let queries = self.get_all();
        self.inner.env.notify.batch(|| {
            for query in queries {
                query.on_online();
            }
        });
    }
}

/// Reads another entry's state as `T` through its serialized form.
fn convert_state<T: QueryData>(query: &dyn AnyQuery) -> Option<QueryState<T>> {
    let converted = query
        .dehydrate()
        .map_err(QueryError::from)
        .and_then(|dehydrated| dehydrated.state.into_state::<T>().map_err(QueryError::from));
    match converted {
        Ok(state) => {
            tracing::debug!(query_hash = query.query_hash(), "converted cached query to a new type");
            Some(state)
        }
        Err(error) => {
            tracing::warn!(
                query_hash = query.query_hash(),
                %error,
                "cached query has an incompatible type, replacing it"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{FetchOptions, QueryStatus, SetDataOptions};
    use parking_lot::Mutex;
    use serde_json::json;

    fn event_log(cache: &QueryCache) -> (Arc<Mutex<Vec<String>>>, Unsubscribe) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let unsubscribe = cache.subscribe(move |event| l.lock().push(format!("{event:?}")));
        (log, unsubscribe)
    }

    #[tokio::test]
    async fn test_build_returns_existing_query() {
        let client = QueryClient::new();
        let cache = client.get_query_cache();
        let a = cache.build(&client, QueryOptions::<u32>::key("todos"));
        let b = cache.build(&client, QueryOptions::<u32>::key("todos"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_added_and_removed_events() {
        let client = QueryClient::new();
        let cache = client.get_query_cache();
        let (log, _unsubscribe) = event_log(&cache);

        let query = cache.build(&client, QueryOptions::<u32>::key("todos"));
        cache.remove_query(query.as_ref());

        let log = log.lock();
        assert!(log[0].starts_with("Added"));
        assert!(log[1].starts_with("Removed"));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_find_all_by_prefix_and_status() {
        let client = QueryClient::new();
        let cache = client.get_query_cache();
        let done = cache.build(&client, QueryOptions::<u32>::key(json!(["todos", 1])));
        done.set_data(1, SetDataOptions::default())
            .expect("sharing succeeds");
        cache.build(&client, QueryOptions::<u32>::key(json!(["todos", 2])));
        cache.build(&client, QueryOptions::<u32>::key("posts"));

        assert_eq!(cache.find_all(&QueryFilters::key("todos")).len(), 2);
        assert_eq!(
            cache
                .find_all(&QueryFilters::key("todos").status(QueryStatus::Success))
                .len(),
            1
        );
        assert!(cache.find(&QueryFilters::exact(json!(["todos", 2]))).is_some());
        assert!(cache.find(&QueryFilters::exact("todos")).is_none());
    }

    #[tokio::test]
    async fn test_untyped_entry_upgrades_on_typed_access() {
        let client = QueryClient::new();
        let cache = client.get_query_cache();
        let state = QueryState::initial(Some(Arc::new(json!(7))), Some(10));
        cache.insert_untyped(QueryOptions::key("n"), state);

        let query = cache
            .get::<u32>(&crate::QueryKey::from("n").hash())
            .expect("entry converts");
        assert_eq!(query.data().as_deref(), Some(&7));
        assert_eq!(query.state().data_updated_at, 10);
        assert!(Arc::ptr_eq(
            &query,
            &cache.get::<u32>(query.query_hash()).expect("typed now")
        ));
    }

    #[tokio::test]
    async fn test_incompatible_entry_is_replaced_on_build() {
        let client = QueryClient::new();
        let cache = client.get_query_cache();
        let text = cache.build(&client, QueryOptions::<String>::key("k"));
        text.set_data("not a number".to_string(), SetDataOptions::default())
            .expect("sharing succeeds");

        let number = cache.build(&client, QueryOptions::<u32>::key("k"));
        assert!(number.data().is_none());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_callbacks_skip_cancellation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (e, s) = (seen.clone(), seen.clone());
        let client = QueryClient::builder()
            .query_cache(
                QueryCacheConfig::default()
                    .on_error(move |error, _| e.lock().push(format!("error {error}")))
                    .on_success(move |query| s.lock().push(format!("success {}", query.query_hash()))),
            )
            .build();

        let ok = QueryOptions::<u32>::new("ok", |_| async { Ok(1) });
        client
            .fetch_query(ok)
            .await
            .expect("fetch succeeds");
        let failing = QueryOptions::<u32>::new("bad", |_| async {
            Err(QueryError::FetchError("boom".to_string()))
        });
        assert!(client.fetch_query(failing).await.is_err());

        let slow = QueryOptions::<u32>::new("slow", |ctx| async move {
            ctx.signal.aborted().await;
            Ok(0)
        });
        let query = client.get_query_cache().build(&client, slow.clone());
        let pending = query.fetch(Some(slow), FetchOptions::default());
        tokio::task::yield_now().await;
        query.cancel(crate::CancelOptions::default()).await;
        assert!(pending.await.is_err());

        assert_eq!(
            *seen.lock(),
            vec![
                "success [\"ok\"]".to_string(),
                "error Fetch failed: boom".to_string()
            ]
        );
    }
}
