//! The query entity.
//!
//! A [`Query`] owns the cached state of one key, runs at most one fetch at
//! a time through a retryer, and tells its observers and cache about every
//! state transition. Queries are created by the [`QueryCache`] and
//! evicted through the shared [`GcManager`](crate::gc::GcManager) once
//! nothing observes them.

pub mod cache;
pub mod infinite;
pub mod observer;
pub mod options;
pub mod queries_observer;
pub mod state;
pub mod streamed;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::client::Environment;
use crate::config::{DEFAULT_GC_TIME, StaleTime};
use crate::error::{CancelOptions, CancelledError, HydrationError, QueryError};
use crate::gc::EntityId;
use crate::hydration::{DehydratedQuery, DehydratedQueryState};
use crate::key::QueryKey;
use crate::retryer::{Attempt, Retryer, RetryerConfig, RetryerHandle};
use crate::structural_sharing::{NoSharing, ReplaceEqual, ShareStrategy};
use crate::time::time_until_stale;

pub use cache::{QueryCache, QueryCacheConfig, QueryCacheEvent};
pub use options::{
    AbortSignal, FetchOptions, InitialData, QueryFn, QueryFunctionContext, QueryOptions,
    SetDataOptions,
};
pub use state::{
    ActionKind, FetchDirection, FetchMeta, FetchStatus, QuerySnapshot, QueryState, QueryStatus,
};

use options::FetchArgs;
use state::{Action, reduce};

/// Bound for data stored in the query cache.
pub trait QueryData: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> QueryData for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// Settles with the outcome of one fetch. Every caller joining the same
/// fetch receives the same outcome.
pub type QueryPromise<T> = Shared<BoxFuture<'static, Result<Arc<T>, QueryError>>>;

/// What a query needs from each attached observer.
pub(crate) trait QueryObserverLink<T: QueryData>: Send + Sync {
    fn observer_id(&self) -> EntityId;
    fn on_query_update(&self);
    fn should_fetch_on_window_focus(&self) -> bool;
    fn should_fetch_on_reconnect(&self) -> bool;
    /// Refetches without cancelling a running fetch.
    fn refetch_in_background(&self);
    fn is_enabled(&self) -> bool;
    fn is_static(&self) -> bool;
    fn is_stale(&self) -> bool;
    fn query_options(&self) -> QueryOptions<T>;
}

struct QueryInner<T: QueryData> {
    state: QueryState<T>,
    initial_state: QueryState<T>,
    revert_state: Option<QueryState<T>>,
    options: QueryOptions<T>,
    gc_time: Duration,
    observers: Vec<Arc<dyn QueryObserverLink<T>>>,
    retryer: Option<RetryerHandle>,
    promise: Option<QueryPromise<T>>,
    signal_consumed: Arc<AtomicBool>,
    fetch_id: u64,
}

/// Cached state of one query key.
pub struct Query<T: QueryData> {
    id: EntityId,
    query_key: QueryKey,
    query_hash: String,
    inner: Mutex<QueryInner<T>>,
    cache: Weak<cache::CacheShared>,
    env: Environment,
    this: Weak<Self>,
}

impl<T: QueryData> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Query")
            .field("query_hash", &self.query_hash)
            .field("status", &inner.state.status)
            .field("fetch_status", &inner.state.fetch_status)
            .field("observers", &inner.observers.len())
            .finish_non_exhaustive()
    }
}

impl<T: QueryData> Query<T> {
    pub(crate) fn new(
        cache: Weak<cache::CacheShared>,
        env: Environment,
        options: QueryOptions<T>,
        state: Option<QueryState<T>>,
    ) -> Arc<Self> {
        let initial_state = QueryState::initial(
            options.initial_data.as_ref().and_then(InitialData::resolve),
            options.initial_data_updated_at,
        );
        let state = state.unwrap_or_else(|| initial_state.clone());
        let gc_time = options.config.gc_time_or_default();
        let query = Arc::new_cyclic(|this| Self {
            id: EntityId::next(),
            query_hash: options.query_hash(),
            query_key: options.query_key.clone(),
            inner: Mutex::new(QueryInner {
                state,
                initial_state,
                revert_state: None,
                options,
                gc_time,
                observers: Vec::new(),
                retryer: None,
                promise: None,
                signal_consumed: Arc::new(AtomicBool::new(false)),
                fetch_id: 0,
            }),
            cache,
            env,
            this: this.clone(),
        });
        query.schedule_gc();
        query
    }

    #[must_use]
    pub const fn id(&self) -> EntityId {
        self.id
    }

    #[must_use]
    pub const fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    #[must_use]
    pub fn query_hash(&self) -> &str {
        &self.query_hash
    }

    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.inner.lock().state.clone()
    }

    #[must_use]
    pub fn data(&self) -> Option<Arc<T>> {
        self.inner.lock().state.data.clone()
    }

    #[must_use]
    pub fn options(&self) -> QueryOptions<T> {
        self.inner.lock().options.clone()
    }

    /// The longest gc time any options applied to this query asked for.
    #[must_use]
    pub fn gc_time(&self) -> Duration {
        self.inner.lock().gc_time
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> QuerySnapshot {
        self.inner
            .lock()
            .state
            .snapshot(&self.query_key, &self.query_hash)
    }

    /// Replaces the options. The gc time only ever grows, and a missing
    /// query function keeps the current one.
    pub fn set_options(&self, mut options: QueryOptions<T>) {
        let seeded = {
            let mut inner = self.inner.lock();
            if options.query_fn.is_none() {
                options.query_fn = inner.options.query_fn.clone();
            }
            let gc_time = options.config.gc_time.unwrap_or(DEFAULT_GC_TIME);
            inner.gc_time = inner.gc_time.max(gc_time);
            let seed = if inner.state.data.is_none() {
                options
                    .initial_data
                    .as_ref()
                    .and_then(InitialData::resolve)
                    .map(|data| QueryState::initial(Some(data), options.initial_data_updated_at))
            } else {
                None
            };
            inner.options = options;
            if let Some(seed) = &seed {
                inner.initial_state = seed.clone();
            }
            seed
        };
        if let Some(QueryState {
            data: Some(data),
            data_updated_at,
            ..
        }) = seeded
        {
            self.dispatch(Action::Success {
                data,
                data_updated_at: Some(data_updated_at),
                manual: true,
            });
        }
    }

    /// Writes data directly, applying structural sharing.
    pub fn set_data(&self, data: T, options: SetDataOptions) -> Result<Arc<T>, QueryError> {
        let (previous, strategy) = {
            let inner = self.inner.lock();
            let strategy: Arc<dyn ShareStrategy<T>> =
                if inner.options.config.structural_sharing == Some(false) {
                    Arc::new(NoSharing)
                } else {
                    inner
                        .options
                        .share
                        .clone()
                        .unwrap_or_else(|| Arc::new(ReplaceEqual))
                };
            (inner.state.data.clone(), strategy)
        };
        let data = strategy.share(previous.as_ref(), data).inspect_err(|error| {
            tracing::warn!(query_hash = %self.query_hash, %error, "structural sharing failed");
        })?;
        self.dispatch(Action::Success {
            data: data.clone(),
            data_updated_at: options.updated_at,
            manual: options.manual,
        });
        Ok(data)
    }

    /// Patches the state directly and notifies observers.
    pub fn set_state(&self, patch: impl FnOnce(&mut QueryState<T>) + Send + 'static) {
        self.dispatch(Action::SetState(Box::new(patch)));
    }

    /// Marks the data stale. Idempotent.
    pub fn invalidate(&self) {
        let invalidated = self.inner.lock().state.is_invalidated;
        if !invalidated {
            self.dispatch(Action::Invalidate);
        }
    }

    /// Cancels any fetch and restores the initial state.
    pub fn reset(&self) {
        self.destroy();
        let initial = self.inner.lock().initial_state.clone();
        self.set_state(move |state| *state = initial);
        if self.observer_count() == 0 {
            self.schedule_gc();
        }
    }

    /// Cancels the running fetch. The returned future completes once the
    /// fetch settled.
    pub fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        let (retryer, promise) = {
            let inner = self.inner.lock();
            (inner.retryer.clone(), inner.promise.clone())
        };
        if let Some(retryer) = retryer {
            retryer.cancel(options);
        }
        async move {
            if let Some(promise) = promise {
                let _ = promise.await;
            }
        }
        .boxed()
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.inner.lock().state.fetch_status != FetchStatus::Idle
    }

    /// Whether any observer is enabled.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.observers().iter().any(|o| o.is_enabled())
    }

    /// Observed but no observer is enabled, or never fetched at all.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        let observers = self.observers();
        if observers.is_empty() {
            let inner = self.inner.lock();
            inner.state.data_update_count + inner.state.error_update_count == 0
        } else {
            !observers.iter().any(|o| o.is_enabled())
        }
    }

    /// Whether an observer declares the data static.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.observers().iter().any(|o| o.is_static())
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        let observers = self.observers();
        if observers.is_empty() {
            let inner = self.inner.lock();
            inner.state.data.is_none() || inner.state.is_invalidated
        } else {
            observers.iter().any(|o| o.is_stale())
        }
    }

    /// Staleness against a given stale time, evaluated now.
    #[must_use]
    pub fn is_stale_by_time(&self, stale_time: StaleTime) -> bool {
        let inner = self.inner.lock();
        let state = &inner.state;
        if state.data.is_none() {
            return true;
        }
        match stale_time {
            StaleTime::Static => false,
            _ if state.is_invalidated => true,
            StaleTime::Duration(stale_time) => {
                time_until_stale(state.data_updated_at, stale_time).is_zero()
            }
        }
    }

    pub fn on_focus(&self) {
        let observers = self.observers();
        if let Some(observer) = observers.iter().find(|o| o.should_fetch_on_window_focus()) {
            observer.refetch_in_background();
        }
        self.resume_retryer();
    }

    pub fn on_online(&self) {
        let observers = self.observers();
        if let Some(observer) = observers.iter().find(|o| o.should_fetch_on_reconnect()) {
            observer.refetch_in_background();
        }
        self.resume_retryer();
    }

    /// Starts a fetch, or joins the running one.
    pub fn fetch(
        &self,
        options: Option<QueryOptions<T>>,
        fetch_options: FetchOptions,
    ) -> QueryPromise<T> {
        let (in_flight, has_data, retryer, promise) = {
            let inner = self.inner.lock();
            (
                inner.state.fetch_status != FetchStatus::Idle,
                inner.state.data.is_some(),
                inner.retryer.clone(),
                inner.promise.clone(),
            )
        };
        if in_flight {
            if has_data && fetch_options.cancel_refetch {
                if let Some(retryer) = &retryer {
                    retryer.cancel(CancelOptions::silent());
                }
            } else if let Some(promise) = promise {
                if let Some(retryer) = retryer {
                    retryer.continue_retry();
                }
                return promise;
            }
        }

        if let Some(options) = options {
            self.set_options(options);
        }
        if self.inner.lock().options.query_fn.is_none() {
            let fallback = self
                .observers()
                .iter()
                .map(|o| o.query_options())
                .find(|o| o.query_fn.is_some());
            if let Some(options) = fallback {
                self.set_options(options);
            }
        }

        let Some(this) = self.this.upgrade() else {
            return rejected(QueryError::Cancelled(CancelledError::default()));
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(query_hash = %self.query_hash, "fetch requested outside a Tokio runtime");
            return rejected(QueryError::FetchError(
                "no Tokio runtime available".to_string(),
            ));
        };

        let options = self.options();
        let abort = CancellationToken::new();
        let consumed = Arc::new(AtomicBool::new(false));
        let fetch_more = fetch_options.meta.and_then(|meta| meta.fetch_more);
        let args = FetchArgs {
            context: QueryFunctionContext {
                query_key: self.query_key.clone(),
                signal: AbortSignal::new(abort.clone(), consumed.clone()),
                meta: options.meta.clone(),
                page_param: (),
                direction: fetch_more,
            },
            previous: self.data(),
            fetch_more,
            query: self.this.clone(),
        };
        let attempt: Attempt<Option<T>> = match options.query_fn.clone() {
            Some(query_fn) => Box::new(move || query_fn.call(args.clone())),
            None => {
                let query_hash = self.query_hash.clone();
                Box::new(move || {
                    let error = QueryError::MissingQueryFn {
                        query_hash: query_hash.clone(),
                    };
                    async move { Err(error) }.boxed()
                })
            }
        };

        let network_mode = options.config.network_mode_or_default();
        let (on_fail, on_pause, on_continue) =
            (self.this.clone(), self.this.clone(), self.this.clone());
        let (retryer, handle) = Retryer::new(RetryerConfig {
            attempt,
            on_fail: Box::new(move |failure_count, error| {
                if let Some(query) = on_fail.upgrade() {
                    query.dispatch(Action::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            }),
            on_pause: Box::new(move || {
                if let Some(query) = on_pause.upgrade() {
                    query.dispatch(Action::Pause);
                }
            }),
            on_continue: Box::new(move || {
                if let Some(query) = on_continue.upgrade() {
                    query.dispatch(Action::Continue);
                }
            }),
            retry: options.config.retry_or_default(),
            retry_delay: options.config.retry_delay_or_default(),
            network_mode,
            can_run: Arc::new(|| true),
            focus: self.env.focus.clone(),
            online: self.env.online.clone(),
            abort: Some(abort),
        });

        let (tx, rx) = oneshot::channel();
        let promise: QueryPromise<T> = async move {
            rx.await
                .unwrap_or_else(|_| Err(QueryError::Cancelled(CancelledError::default())))
        }
        .boxed()
        .shared();

        let (fetch_id, dispatch_fetch) = {
            let mut inner = self.inner.lock();
            inner.revert_state = Some(inner.state.clone());
            inner.retryer = Some(handle);
            inner.promise = Some(promise.clone());
            inner.signal_consumed = consumed;
            inner.fetch_id += 1;
            let dispatch = inner.state.fetch_status == FetchStatus::Idle
                || inner.state.fetch_meta != fetch_options.meta;
            (inner.fetch_id, dispatch)
        };
        if dispatch_fetch {
            self.dispatch(Action::Fetch {
                meta: fetch_options.meta,
                can_fetch: network_mode.can_fetch(&self.env.online),
            });
        }

        tracing::debug!(query_hash = %self.query_hash, fetch_id, "fetch started");
        runtime.spawn(async move {
            let result = retryer.run().await;
            let outcome = this.settle(fetch_id, result).await;
            let _ = tx.send(outcome);
        });
        promise
    }

    async fn settle(
        &self,
        fetch_id: u64,
        result: Result<Option<T>, QueryError>,
    ) -> Result<Arc<T>, QueryError> {
        let outcome = match result {
            Ok(Some(data)) => match self.set_data(data, SetDataOptions::default()) {
                Ok(data) => {
                    if let Some(cache) = self.cache() {
                        cache.on_success(self);
                    }
                    Ok(data)
                }
                Err(error) => Err(self.fail(error)),
            },
            Ok(None) => {
                tracing::warn!(
                    query_hash = %self.query_hash,
                    "query function returned no data, settling with an error"
                );
                Err(self.fail(QueryError::UndefinedData {
                    query_hash: self.query_hash.clone(),
                }))
            }
            Err(error) if error.as_cancelled().is_some_and(|c| c.silent) => {
                let newer = {
                    let inner = self.inner.lock();
                    (inner.fetch_id != fetch_id)
                        .then(|| inner.promise.clone())
                        .flatten()
                };
                match newer {
                    Some(promise) => return promise.await,
                    None => Err(error),
                }
            }
            Err(error) => Err(self.fail(error)),
        };
        tracing::debug!(
            query_hash = %self.query_hash,
            fetch_id,
            ok = outcome.is_ok(),
            "fetch settled"
        );
        self.schedule_gc();
        outcome
    }

    fn fail(&self, error: QueryError) -> QueryError {
        self.dispatch(Action::Error {
            error: error.clone(),
        });
        if error.as_cancelled().is_none()
            && let Some(cache) = self.cache()
        {
            cache.on_error(&error, self);
        }
        error
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn QueryObserverLink<T>>) {
        let observer_id = observer.observer_id();
        let added = {
            let mut inner = self.inner.lock();
            if inner
                .observers
                .iter()
                .any(|o| o.observer_id() == observer_id)
            {
                false
            } else {
                inner.observers.push(observer);
                true
            }
        };
        if added {
            self.env.gc.untrack(self.id);
            self.notify_cache(|query| QueryCacheEvent::ObserverAdded {
                query,
                observer: observer_id,
            });
        }
    }

    pub(crate) fn remove_observer(&self, observer_id: EntityId) {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.observers.len();
            inner.observers.retain(|o| o.observer_id() != observer_id);
            (inner.observers.len() != before).then(|| {
                (
                    inner.observers.is_empty(),
                    inner.retryer.clone(),
                    inner.signal_consumed.load(Ordering::SeqCst),
                )
            })
        };
        let Some((now_unobserved, retryer, signal_consumed)) = removed else {
            return;
        };
        if now_unobserved {
            if let Some(retryer) = retryer {
                if signal_consumed {
                    retryer.cancel(CancelOptions {
                        revert: true,
                        silent: false,
                    });
                } else {
                    retryer.cancel_retry();
                }
            }
            self.schedule_gc();
        }
        self.notify_cache(|query| QueryCacheEvent::ObserverRemoved {
            query,
            observer: observer_id,
        });
    }

    pub(crate) fn notify_observer_options_updated(&self, observer_id: EntityId) {
        self.notify_cache(|query| QueryCacheEvent::ObserverOptionsUpdated {
            query,
            observer: observer_id,
        });
    }

    pub(crate) fn notify_observer_results_updated(&self) {
        self.notify_cache(|query| QueryCacheEvent::ObserverResultsUpdated { query });
    }

    /// Hands the query to the gc manager if nothing observes it.
    pub(crate) fn schedule_gc(&self) {
        let gc_time = self.gc_time();
        let weak = self.this.clone();
        self.env.gc.track(
            self.id,
            gc_time,
            Arc::new(move || {
                if let Some(query) = weak.upgrade() {
                    query.optional_remove();
                }
            }),
        );
    }

    fn optional_remove(&self) {
        let removable = {
            let inner = self.inner.lock();
            inner.observers.is_empty() && inner.state.fetch_status == FetchStatus::Idle
        };
        if removable && let Some(cache) = self.cache() {
            tracing::debug!(query_hash = %self.query_hash, "evicting unused query");
            cache.remove(self.id, &self.query_hash);
        }
    }

    pub(crate) fn destroy(&self) {
        self.env.gc.untrack(self.id);
        let retryer = self.inner.lock().retryer.clone();
        if let Some(retryer) = retryer {
            retryer.cancel(CancelOptions::silent());
        }
    }

    fn resume_retryer(&self) {
        let retryer = self.inner.lock().retryer.clone();
        if let Some(retryer) = retryer {
            retryer.resume();
        }
    }

    fn observers(&self) -> Vec<Arc<dyn QueryObserverLink<T>>> {
        self.inner.lock().observers.clone()
    }

    fn cache(&self) -> Option<QueryCache> {
        self.cache.upgrade().map(QueryCache::from_shared)
    }

    fn erased(&self) -> Option<Arc<dyn AnyQuery>> {
        self.this.upgrade().map(|query| query as Arc<dyn AnyQuery>)
    }

    fn notify_cache(&self, event: impl FnOnce(Arc<dyn AnyQuery>) -> QueryCacheEvent) {
        if let (Some(cache), Some(query)) = (self.cache(), self.erased()) {
            cache.notify(&event(query));
        }
    }

    pub(crate) fn dispatch(&self, action: Action<T>) {
        let kind = action.kind();
        let observers = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.state = reduce(&inner.state, action, &mut inner.revert_state);
            inner.observers.clone()
        };
        self.env.notify.batch(|| {
            for observer in &observers {
                observer.on_query_update();
            }
            self.notify_cache(|query| QueryCacheEvent::Updated {
                query,
                action: kind,
            });
        });
    }

    /// Serializable copy of the current state.
    pub fn dehydrate(&self) -> Result<DehydratedQuery, serde_json::Error> {
        let (state, meta) = {
            let inner = self.inner.lock();
            (inner.state.clone(), inner.options.meta.clone())
        };
        Ok(DehydratedQuery {
            query_key: self.query_key.clone(),
            query_hash: self.query_hash.clone(),
            state: DehydratedQueryState::from_state(&state)?,
            meta,
        })
    }
}

fn rejected<T: QueryData>(error: QueryError) -> QueryPromise<T> {
    async move { Err(error) }.boxed().shared()
}

/// Type-erased access to a cached query.
///
/// Cache events, filters and predicates see queries through this trait;
/// [`downcast_query`] recovers the typed [`Query`].
pub trait AnyQuery: Send + Sync + 'static {
    fn id(&self) -> EntityId;
    fn query_key(&self) -> &QueryKey;
    fn query_hash(&self) -> &str;
    fn snapshot(&self) -> QuerySnapshot;
    fn meta(&self) -> Option<serde_json::Value>;
    fn gc_time(&self) -> Duration;
    fn observer_count(&self) -> usize;
    fn is_active(&self) -> bool;
    fn is_stale(&self) -> bool;
    fn is_disabled(&self) -> bool;
    fn is_static(&self) -> bool;
    fn invalidate(&self);
    fn reset(&self);
    fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()>;
    /// Fetches with the query's current options, discarding the data.
    fn refetch(&self, fetch_options: FetchOptions) -> BoxFuture<'static, Result<(), QueryError>>;
    fn on_focus(&self);
    fn on_online(&self);
    fn dehydrate(&self) -> Result<DehydratedQuery, serde_json::Error>;
    /// Overwrites the state if `state` is strictly newer. Returns whether
    /// it was applied.
    fn hydrate(&self, state: DehydratedQueryState) -> Result<bool, HydrationError>;
    fn destroy(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: QueryData> AnyQuery for Query<T> {
    fn id(&self) -> EntityId {
        self.id
    }

    fn query_key(&self) -> &QueryKey {
        &self.query_key
    }

    fn query_hash(&self) -> &str {
        &self.query_hash
    }

    fn snapshot(&self) -> QuerySnapshot {
        Self::snapshot(self)
    }

    fn meta(&self) -> Option<serde_json::Value> {
        self.inner.lock().options.meta.clone()
    }

    fn gc_time(&self) -> Duration {
        Self::gc_time(self)
    }

    fn observer_count(&self) -> usize {
        Self::observer_count(self)
    }

    fn is_active(&self) -> bool {
        Self::is_active(self)
    }

    fn is_stale(&self) -> bool {
        Self::is_stale(self)
    }

    fn is_disabled(&self) -> bool {
        Self::is_disabled(self)
    }

    fn is_static(&self) -> bool {
        Self::is_static(self)
    }

    fn invalidate(&self) {
        Self::invalidate(self);
    }

    fn reset(&self) {
        Self::reset(self);
    }

    fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        Self::cancel(self, options)
    }

    fn refetch(&self, fetch_options: FetchOptions) -> BoxFuture<'static, Result<(), QueryError>> {
        self.fetch(None, fetch_options)
            .map(|result| result.map(drop))
            .boxed()
    }

    fn on_focus(&self) {
        Self::on_focus(self);
    }

    fn on_online(&self) {
        Self::on_online(self);
    }

    fn dehydrate(&self) -> Result<DehydratedQuery, serde_json::Error> {
        Self::dehydrate(self)
    }

    fn hydrate(&self, state: DehydratedQueryState) -> Result<bool, HydrationError> {
        let current = self.inner.lock().state.data_updated_at;
        if current >= state.data_updated_at {
            return Ok(false);
        }
        let next = state
            .into_state::<T>()
            .map_err(|source| HydrationError::QueryData {
                query_hash: self.query_hash.clone(),
                source,
            })?;
        self.set_state(move |state| {
            let fetch_status = state.fetch_status;
            *state = QueryState {
                fetch_status,
                ..next
            };
        });
        Ok(true)
    }

    fn destroy(&self) {
        Self::destroy(self);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recovers the typed query behind a type-erased one.
#[must_use]
pub fn downcast_query<T: QueryData>(query: &Arc<dyn AnyQuery>) -> Option<Arc<Query<T>>> {
    query.clone().into_any().downcast::<Query<T>>().ok()
}
