//! The query client.
//!
//! [`QueryClient`] is the entry point of the engine. It owns the query and
//! mutation caches, the default options and the environment managers, and
//! offers the bulk operations (invalidate, refetch, cancel, ...) that act
//! on every query matching a [`QueryFilters`].
//!
//! ```
//! use tears_query::{QueryClient, QueryConfig};
//! use std::time::Duration;
//!
//! let client = QueryClient::builder()
//!     .default_query_config(QueryConfig::new(
//!         Duration::from_secs(30),  // stale_time
//!         Duration::from_secs(300), // gc_time
//!     ))
//!     .build();
//! assert!(client.get_query_cache().is_empty());
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};

use crate::config::{MutationConfig, QueryConfig};
use crate::error::{CancelOptions, HydrationError, QueryError, is_cancelled_error};
use crate::filters::{MutationFilters, QueryFilters, QueryTypeFilter};
use crate::gc::GcManager;
use crate::hydration::DehydratedMutation;
use crate::key::QueryKey;
use crate::mutation::{MutationCache, MutationCacheConfig, MutationOptions, MutationStatus};
use crate::notify::NotifyManager;
use crate::query::infinite::{InfiniteData, InfiniteQueryOptions};
use crate::query::{
    FetchOptions, FetchStatus, QueryCache, QueryCacheConfig, QueryData, QueryOptions, QueryState,
    SetDataOptions,
};
use crate::subscription::Unsubscribe;
use crate::subscription::focus::FocusManager;
use crate::subscription::online::OnlineManager;

/// The managers shared by every entity of one client.
#[derive(Clone)]
pub(crate) struct Environment {
    pub notify: NotifyManager,
    pub gc: GcManager,
    pub focus: FocusManager,
    pub online: OnlineManager,
}

/// Client-wide fallbacks for options left unset.
#[derive(Debug, Clone, Default)]
pub struct DefaultOptions {
    pub queries: QueryConfig,
    pub mutations: MutationConfig,
}

/// Which queries an invalidation refetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchType {
    #[default]
    Active,
    Inactive,
    All,
    /// Only mark the queries stale.
    None,
}

/// Options of [`QueryClient::refetch_queries`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefetchOptions {
    /// Cancel running fetches instead of joining them.
    pub cancel_refetch: bool,
    /// Return the first failure instead of swallowing it.
    pub throw_on_error: bool,
}

impl Default for RefetchOptions {
    fn default() -> Self {
        Self {
            cancel_refetch: true,
            throw_on_error: false,
        }
    }
}

type MutationHydrator =
    Arc<dyn Fn(&QueryClient, DehydratedMutation) -> Result<(), HydrationError> + Send + Sync>;

struct QueryDefaults {
    query_key: QueryKey,
    config: QueryConfig,
}

struct MutationDefaults {
    mutation_key: QueryKey,
    config: MutationConfig,
    options: Arc<dyn Any + Send + Sync>,
    hydrate: MutationHydrator,
}

#[derive(Default)]
struct MountState {
    count: usize,
    focus: Option<Unsubscribe>,
    online: Option<Unsubscribe>,
}

struct ClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    env: Environment,
    default_options: RwLock<DefaultOptions>,
    query_defaults: RwLock<Vec<QueryDefaults>>,
    mutation_defaults: RwLock<Vec<MutationDefaults>>,
    mount: Mutex<MountState>,
}

/// Builder for a [`QueryClient`].
///
/// Managers that are not injected are created fresh, so two clients never
/// share environment state unless asked to.
#[derive(Debug, Default)]
pub struct QueryClientConfig {
    query_cache: QueryCacheConfig,
    mutation_cache: MutationCacheConfig,
    default_options: DefaultOptions,
    notify: Option<NotifyManager>,
    gc: Option<GcManager>,
    focus: Option<FocusManager>,
    online: Option<OnlineManager>,
}

impl QueryClientConfig {
    #[must_use]
    pub fn query_cache(mut self, config: QueryCacheConfig) -> Self {
        self.query_cache = config;
        self
    }

    #[must_use]
    pub fn mutation_cache(mut self, config: MutationCacheConfig) -> Self {
        self.mutation_cache = config;
        self
    }

    #[must_use]
    pub fn default_options(mut self, default_options: DefaultOptions) -> Self {
        self.default_options = default_options;
        self
    }

    #[must_use]
    pub fn default_query_config(mut self, config: QueryConfig) -> Self {
        self.default_options.queries = config;
        self
    }

    #[must_use]
    pub fn default_mutation_config(mut self, config: MutationConfig) -> Self {
        self.default_options.mutations = config;
        self
    }

    #[must_use]
    pub fn notify_manager(mut self, notify: NotifyManager) -> Self {
        self.notify = Some(notify);
        self
    }

    #[must_use]
    pub fn gc_manager(mut self, gc: GcManager) -> Self {
        self.gc = Some(gc);
        self
    }

    #[must_use]
    pub fn focus_manager(mut self, focus: FocusManager) -> Self {
        self.focus = Some(focus);
        self
    }

    #[must_use]
    pub fn online_manager(mut self, online: OnlineManager) -> Self {
        self.online = Some(online);
        self
    }

    #[must_use]
    pub fn build(self) -> QueryClient {
        let env = Environment {
            notify: self.notify.unwrap_or_default(),
            gc: self.gc.unwrap_or_default(),
            focus: self.focus.unwrap_or_default(),
            online: self.online.unwrap_or_default(),
        };
        QueryClient {
            inner: Arc::new(ClientInner {
                query_cache: QueryCache::new(self.query_cache, env.clone()),
                mutation_cache: MutationCache::new(self.mutation_cache, env.clone()),
                env,
                default_options: RwLock::new(self.default_options),
                query_defaults: RwLock::new(Vec::new()),
                mutation_defaults: RwLock::new(Vec::new()),
                mount: Mutex::new(MountState::default()),
            }),
        }
    }
}

/// A client for managing the query and mutation caches.
///
/// Cheap to clone; clones share the same caches and managers.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("queries", &self.inner.query_cache.len())
            .field("mutations", &self.inner.mutation_cache.len())
            .field("mounted", &self.inner.mount.lock().count)
            .finish_non_exhaustive()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

/// A non-owning reference to a [`QueryClient`], held by mutations.
#[derive(Clone)]
pub struct WeakQueryClient {
    inner: Weak<ClientInner>,
}

impl WeakQueryClient {
    #[must_use]
    pub fn upgrade(&self) -> Option<QueryClient> {
        self.inner.upgrade().map(|inner| QueryClient { inner })
    }
}

impl fmt::Debug for WeakQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakQueryClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

impl QueryClient {
    /// Creates a new query client with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    #[must_use]
    pub fn builder() -> QueryClientConfig {
        QueryClientConfig::default()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakQueryClient {
        WeakQueryClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn get_query_cache(&self) -> QueryCache {
        self.inner.query_cache.clone()
    }

    #[must_use]
    pub fn get_mutation_cache(&self) -> MutationCache {
        self.inner.mutation_cache.clone()
    }

    #[must_use]
    pub fn notify_manager(&self) -> NotifyManager {
        self.inner.env.notify.clone()
    }

    #[must_use]
    pub fn gc_manager(&self) -> GcManager {
        self.inner.env.gc.clone()
    }

    #[must_use]
    pub fn focus_manager(&self) -> FocusManager {
        self.inner.env.focus.clone()
    }

    #[must_use]
    pub fn online_manager(&self) -> OnlineManager {
        self.inner.env.online.clone()
    }

    /// Attaches the client to the focus and online managers. Calls are
    /// counted; only the first one subscribes.
    pub fn mount(&self) {
        let mut mount = self.inner.mount.lock();
        mount.count += 1;
        if mount.count > 1 {
            return;
        }
        let weak = self.downgrade();
        mount.focus = Some(self.inner.env.focus.subscribe(move |focused| {
            if focused && let Some(client) = weak.upgrade() {
                client.resume_then(QueryCache::on_focus);
            }
        }));
        let weak = self.downgrade();
        mount.online = Some(self.inner.env.online.subscribe(move |online| {
            if online && let Some(client) = weak.upgrade() {
                client.resume_then(QueryCache::on_online);
            }
        }));
        tracing::debug!("query client mounted");
    }

    /// Undoes one [`mount`](Self::mount). The last call unsubscribes.
    pub fn unmount(&self) {
        let (focus, online) = {
            let mut mount = self.inner.mount.lock();
            mount.count = mount.count.saturating_sub(1);
            if mount.count > 0 {
                return;
            }
            (mount.focus.take(), mount.online.take())
        };
        if focus.is_some() || online.is_some() {
            tracing::debug!("query client unmounted");
        }
        drop((focus, online));
    }

    /// Resumes paused mutations, then lets the query cache react.
    fn resume_then(&self, react: fn(&QueryCache)) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            react(&self.inner.query_cache);
            return;
        };
        let client = self.clone();
        runtime.spawn(async move {
            client.resume_paused_mutations().await;
            react(&client.inner.query_cache);
        });
    }

    // --- options ---

    #[must_use]
    pub fn get_default_options(&self) -> DefaultOptions {
        self.inner.default_options.read().clone()
    }

    pub fn set_default_options(&self, default_options: DefaultOptions) {
        *self.inner.default_options.write() = default_options;
    }

    /// Registers defaults for every query whose key starts with
    /// `query_key`. Registering the same key again replaces the entry.
    pub fn set_query_defaults(&self, query_key: impl Into<QueryKey>, config: QueryConfig) {
        let query_key = query_key.into();
        let mut defaults = self.inner.query_defaults.write();
        let hash = query_key.hash();
        if let Some(entry) = defaults.iter_mut().find(|d| d.query_key.hash() == hash) {
            entry.config = config;
        } else {
            defaults.push(QueryDefaults { query_key, config });
        }
    }

    /// The merged per-key defaults matching `query_key`. Later
    /// registrations win over earlier ones.
    #[must_use]
    pub fn get_query_defaults(&self, query_key: &QueryKey) -> QueryConfig {
        self.inner
            .query_defaults
            .read()
            .iter()
            .rev()
            .filter(|d| query_key.starts_with(&d.query_key))
            .fold(QueryConfig::default(), |config, d| config.merge(&d.config))
    }

    /// Registers typed defaults for mutations whose key starts with
    /// `mutation_key`. The registration is also what lets a dehydrated
    /// mutation with a matching key be restored.
    pub fn set_mutation_defaults<T, V, C>(
        &self,
        mutation_key: impl Into<QueryKey>,
        options: MutationOptions<T, V, C>,
    ) where
        T: QueryData,
        V: QueryData,
        C: QueryData,
    {
        let mutation_key = mutation_key.into();
        let hydrate: MutationHydrator = Arc::new(|client: &QueryClient, dehydrated: DehydratedMutation| {
            let key = dehydrated
                .mutation_key
                .as_ref()
                .map_or_else(String::new, ToString::to_string);
            let state = dehydrated
                .state
                .into_state::<T, V, C>()
                .map_err(|source| HydrationError::MutationVariables {
                    mutation_key: key,
                    source,
                })?;
            let mut options = MutationOptions::<T, V, C>::default();
            options.mutation_key = dehydrated.mutation_key;
            options.meta = dehydrated.meta;
            options.config.scope = dehydrated.scope;
            client
                .inner
                .mutation_cache
                .build(client, options, Some(state));
            Ok(())
        });
        let entry = MutationDefaults {
            config: options.config.clone(),
            options: Arc::new(options),
            hydrate,
            mutation_key,
        };
        let mut defaults = self.inner.mutation_defaults.write();
        let hash = entry.mutation_key.hash();
        if let Some(existing) = defaults.iter_mut().find(|d| d.mutation_key.hash() == hash) {
            *existing = entry;
        } else {
            defaults.push(entry);
        }
    }

    /// The merged untyped part of the mutation defaults matching
    /// `mutation_key`.
    #[must_use]
    pub fn get_mutation_defaults(&self, mutation_key: &QueryKey) -> MutationConfig {
        self.inner
            .mutation_defaults
            .read()
            .iter()
            .rev()
            .filter(|d| mutation_key.starts_with(&d.mutation_key))
            .fold(MutationConfig::default(), |config, d| config.merge(&d.config))
    }

    /// Fills unset query options from the per-key defaults, then from the
    /// client defaults.
    #[must_use]
    pub fn default_query_options<T: QueryData>(&self, options: QueryOptions<T>) -> QueryOptions<T> {
        let fallback = self
            .get_query_defaults(&options.query_key)
            .merge(&self.inner.default_options.read().queries);
        options.with_defaults(&fallback)
    }

    /// Fills unset mutation options from the matching typed defaults, then
    /// from the client defaults. Defaults registered for other types only
    /// contribute their untyped config.
    #[must_use]
    pub fn default_mutation_options<T, V, C>(
        &self,
        mut options: MutationOptions<T, V, C>,
    ) -> MutationOptions<T, V, C>
    where
        T: QueryData,
        V: QueryData,
        C: QueryData,
    {
        if let Some(mutation_key) = options.mutation_key.clone() {
            let defaults = self.inner.mutation_defaults.read();
            for entry in defaults
                .iter()
                .rev()
                .filter(|d| mutation_key.starts_with(&d.mutation_key))
            {
                options = match entry.options.downcast_ref::<MutationOptions<T, V, C>>() {
                    Some(typed) => options.with_defaults(typed),
                    None => {
                        options.config = options.config.merge(&entry.config);
                        options
                    }
                };
            }
        }
        options.config = options
            .config
            .merge(&self.inner.default_options.read().mutations);
        options
    }

    pub(crate) fn hydrate_mutation(
        &self,
        dehydrated: DehydratedMutation,
    ) -> Result<bool, HydrationError> {
        let hydrate = dehydrated.mutation_key.as_ref().and_then(|mutation_key| {
            self.inner
                .mutation_defaults
                .read()
                .iter()
                .rev()
                .find(|d| mutation_key.starts_with(&d.mutation_key))
                .map(|d| d.hydrate.clone())
        });
        match hydrate {
            Some(hydrate) => hydrate(self, dehydrated).map(|()| true),
            None => Ok(false),
        }
    }

    // --- fetching ---

    /// Resolves with cached data if it is fresh, otherwise fetches.
    pub async fn fetch_query<T: QueryData>(
        &self,
        options: QueryOptions<T>,
    ) -> Result<Arc<T>, QueryError> {
        let options = self.default_query_options(options);
        let query = self.inner.query_cache.build(self, options.clone());
        let stale_time = options.config.stale_time_for(&query.snapshot());
        if !query.is_stale_by_time(stale_time)
            && let Some(data) = query.data()
        {
            return Ok(data);
        }
        query.fetch(Some(options), FetchOptions::default()).await
    }

    /// Like [`fetch_query`](Self::fetch_query) but never fails.
    pub async fn prefetch_query<T: QueryData>(&self, options: QueryOptions<T>) {
        if let Err(error) = self.fetch_query(options).await {
            tracing::debug!(%error, "prefetch failed");
        }
    }

    /// Returns cached data when there is any, fetching only when there is
    /// none. With `revalidate_if_stale`, stale cached data is returned
    /// immediately and refreshed in the background.
    pub async fn ensure_query_data<T: QueryData>(
        &self,
        options: QueryOptions<T>,
        revalidate_if_stale: bool,
    ) -> Result<Arc<T>, QueryError> {
        let options = self.default_query_options(options);
        let query = self.inner.query_cache.build(self, options.clone());
        let Some(data) = query.data() else {
            return self.fetch_query(options).await;
        };
        if revalidate_if_stale
            && query.is_stale_by_time(options.config.stale_time_for(&query.snapshot()))
        {
            drop(query.fetch(Some(options), FetchOptions::default()));
        }
        Ok(data)
    }

    /// Fetches the first page of an infinite query, or returns the cached
    /// pages while they are fresh.
    pub async fn fetch_infinite_query<P: QueryData, Param: QueryData>(
        &self,
        options: InfiniteQueryOptions<P, Param>,
    ) -> Result<Arc<InfiniteData<P, Param>>, QueryError> {
        self.fetch_query(options.to_query_options()).await
    }

    pub async fn prefetch_infinite_query<P: QueryData, Param: QueryData>(
        &self,
        options: InfiniteQueryOptions<P, Param>,
    ) {
        self.prefetch_query(options.to_query_options()).await;
    }

    // --- direct cache access ---

    #[must_use]
    pub fn get_query_data<T: QueryData>(&self, query_key: impl Into<QueryKey>) -> Option<Arc<T>> {
        self.inner
            .query_cache
            .get::<T>(&query_key.into().hash())
            .and_then(|query| query.data())
    }

    /// Data of every query matching `filters` that holds a `T`.
    #[must_use]
    pub fn get_queries_data<T: QueryData>(
        &self,
        filters: &QueryFilters,
    ) -> Vec<(QueryKey, Option<Arc<T>>)> {
        self.inner
            .query_cache
            .find_all(filters)
            .into_iter()
            .filter_map(|query| {
                let typed = self.inner.query_cache.get::<T>(query.query_hash())?;
                Some((query.query_key().clone(), typed.data()))
            })
            .collect()
    }

    #[must_use]
    pub fn get_query_state<T: QueryData>(
        &self,
        query_key: impl Into<QueryKey>,
    ) -> Option<QueryState<T>> {
        self.inner
            .query_cache
            .get::<T>(&query_key.into().hash())
            .map(|query| query.state())
    }

    /// Writes data computed from the current data, creating the query if
    /// needed. An updater returning `None` leaves the cache untouched.
    pub fn set_query_data<T: QueryData>(
        &self,
        query_key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&T>) -> Option<T>,
    ) -> Result<Option<Arc<T>>, QueryError> {
        let query_key = query_key.into();
        let previous = self.get_query_data::<T>(query_key.clone());
        let Some(data) = updater(previous.as_deref()) else {
            return Ok(None);
        };
        let query = self
            .inner
            .query_cache
            .build(self, QueryOptions::<T>::key(query_key));
        query
            .set_data(
                data,
                SetDataOptions {
                    manual: true,
                    ..SetDataOptions::default()
                },
            )
            .map(Some)
    }

    /// [`set_query_data`](Self::set_query_data) for every query matching
    /// `filters` that holds a `T`, in one notification batch.
    ///
    /// Every matching query is written even if some writes fail; the first
    /// failure is returned afterwards.
    pub fn set_queries_data<T: QueryData>(
        &self,
        filters: &QueryFilters,
        updater: impl Fn(Option<&T>) -> Option<T>,
    ) -> Result<Vec<(QueryKey, Option<Arc<T>>)>, QueryError> {
        self.inner.env.notify.batch(|| {
            let mut written = Vec::new();
            let mut first_error = None;
            for query in self.inner.query_cache.find_all(filters) {
                let Some(typed) = self.inner.query_cache.get::<T>(query.query_hash()) else {
                    continue;
                };
                let query_key = query.query_key().clone();
                let Some(data) = updater(typed.data().as_deref()) else {
                    written.push((query_key, None));
                    continue;
                };
                let options = SetDataOptions {
                    manual: true,
                    ..SetDataOptions::default()
                };
                match typed.set_data(data, options) {
                    Ok(data) => written.push((query_key, Some(data))),
                    Err(error) => {
                        tracing::warn!(query_hash = %query.query_hash(), %error, "bulk data write failed");
                        first_error.get_or_insert(error);
                    }
                }
            }
            first_error.map_or(Ok(written), Err)
        })
    }

    // --- bulk operations ---

    /// Marks matching queries stale, then refetches the ones selected by
    /// `refetch_type`.
    pub async fn invalidate_queries(
        &self,
        filters: &QueryFilters,
        refetch_type: RefetchType,
    ) -> Result<(), QueryError> {
        self.inner.env.notify.batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                query.invalidate();
            }
        });
        let kind = match refetch_type {
            RefetchType::None => return Ok(()),
            RefetchType::Active => QueryTypeFilter::Active,
            RefetchType::Inactive => QueryTypeFilter::Inactive,
            RefetchType::All => QueryTypeFilter::All,
        };
        let filters = QueryFilters {
            kind,
            ..filters.clone()
        };
        self.refetch_queries(&filters, RefetchOptions::default())
            .await
    }

    /// Refetches matching queries that are neither disabled nor static.
    /// Paused fetches are not waited for.
    pub async fn refetch_queries(
        &self,
        filters: &QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        let fetches: Vec<_> = self.inner.env.notify.batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .filter(|query| !query.is_disabled() && !query.is_static())
                .filter_map(|query| {
                    let fetch = query.refetch(FetchOptions::cancel_refetch(options.cancel_refetch));
                    (query.snapshot().fetch_status != FetchStatus::Paused).then_some(fetch)
                })
                .collect()
        });
        let results = join_all(fetches).await;
        if !options.throw_on_error {
            return Ok(());
        }
        results
            .into_iter()
            .filter_map(Result::err)
            .find(|error| !is_cancelled_error(error))
            .map_or(Ok(()), Err)
    }

    /// Cancels the fetches of matching queries and waits until they
    /// settled.
    pub async fn cancel_queries(&self, filters: &QueryFilters, options: CancelOptions) {
        let cancels: Vec<_> = self.inner.env.notify.batch(|| {
            self.inner
                .query_cache
                .find_all(filters)
                .into_iter()
                .map(|query| query.cancel(options))
                .collect()
        });
        join_all(cancels).await;
    }

    pub fn remove_queries(&self, filters: &QueryFilters) {
        let cache = &self.inner.query_cache;
        self.inner.env.notify.batch(|| {
            for query in cache.find_all(filters) {
                cache.remove_query(query.as_ref());
            }
        });
    }

    /// Resets matching queries to their initial state, then refetches the
    /// active ones.
    pub async fn reset_queries(&self, filters: &QueryFilters) -> Result<(), QueryError> {
        self.inner.env.notify.batch(|| {
            for query in self.inner.query_cache.find_all(filters) {
                query.reset();
            }
        });
        let filters = QueryFilters {
            kind: QueryTypeFilter::Active,
            ..filters.clone()
        };
        self.refetch_queries(&filters, RefetchOptions::default())
            .await
    }

    /// Number of matching queries currently fetching.
    #[must_use]
    pub fn is_fetching(&self, filters: &QueryFilters) -> usize {
        let filters = QueryFilters {
            fetch_status: Some(FetchStatus::Fetching),
            ..filters.clone()
        };
        self.inner.query_cache.find_all(&filters).len()
    }

    /// Number of matching mutations currently pending.
    #[must_use]
    pub fn is_mutating(&self, filters: &MutationFilters) -> usize {
        let filters = MutationFilters {
            status: Some(MutationStatus::Pending),
            ..filters.clone()
        };
        self.inner.mutation_cache.find_all(&filters).len()
    }

    /// Continues every paused mutation, if online.
    pub async fn resume_paused_mutations(&self) {
        if self.inner.env.online.is_online() {
            self.inner.mutation_cache.resume_paused_mutations().await;
        }
    }

    /// Empties both caches.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }
}
