//! Per-subscriber projection of a query.
//!
//! A [`QueryObserver`] attaches to the query its options point at while it
//! has listeners. It decides when to fetch (mount, focus, reconnect,
//! refetch interval), derives a [`QueryObserverResult`] from the query
//! state, and notifies its listeners only when a watched property changed.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

use super::{
    FetchDirection, FetchOptions, FetchStatus, Query, QueryData, QueryObserverLink, QueryOptions, QueryPromise,
    QueryStatus,
};
use crate::client::QueryClient;
use crate::config::{NotifyOnChangeProps, QueryConfig, RefetchOn, Resolvable, StaleTime};
use crate::error::QueryError;
use crate::gc::EntityId;
use crate::notify::ListenerKey;
use crate::subscription::{Handle, Listeners, Unsubscribe};
use crate::time::{is_valid_timeout, time_until_stale};

/// Maps query data to the observed shape.
pub type Select<T, S> = Arc<dyn Fn(&Arc<T>) -> Arc<S> + Send + Sync>;

/// Data shown while a query has none of its own.
pub enum PlaceholderData<T> {
    Value(Arc<T>),
    /// Receives the data of the last query this observer saw with data.
    Resolver(Arc<dyn Fn(Option<&Arc<T>>) -> Option<T> + Send + Sync>),
    /// Keeps showing the previous query's data, e.g. while paging.
    KeepPrevious,
}

impl<T> Clone for PlaceholderData<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(value.clone()),
            Self::Resolver(f) => Self::Resolver(f.clone()),
            Self::KeepPrevious => Self::KeepPrevious,
        }
    }
}

impl<T> PlaceholderData<T> {
    pub fn resolver(f: impl Fn(Option<&Arc<T>>) -> Option<T> + Send + Sync + 'static) -> Self {
        Self::Resolver(Arc::new(f))
    }

    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => Arc::ptr_eq(a, b),
            (Self::Resolver(a), Self::Resolver(b)) => Arc::ptr_eq(a, b),
            (Self::KeepPrevious, Self::KeepPrevious) => true,
            _ => false,
        }
    }

    fn resolve(&self, previous: Option<&Arc<T>>) -> Option<Arc<T>> {
        match self {
            Self::Value(value) => Some(value.clone()),
            Self::Resolver(f) => f(previous).map(Arc::new),
            Self::KeepPrevious => previous.cloned(),
        }
    }
}

/// Options of a [`QueryObserver`].
pub struct QueryObserverOptions<T: QueryData, S = T> {
    pub query: QueryOptions<T>,
    select: Select<T, S>,
    custom_select: bool,
    pub placeholder_data: Option<PlaceholderData<T>>,
}

impl<T: QueryData, S> Clone for QueryObserverOptions<T, S> {
    fn clone(&self) -> Self {
        Self {
            query: self.query.clone(),
            select: self.select.clone(),
            custom_select: self.custom_select,
            placeholder_data: self.placeholder_data.clone(),
        }
    }
}

impl<T: QueryData, S> fmt::Debug for QueryObserverOptions<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverOptions")
            .field("query", &self.query)
            .field("select", &self.custom_select)
            .field("placeholder_data", &self.placeholder_data.is_some())
            .finish()
    }
}

impl<T: QueryData> QueryObserverOptions<T> {
    /// Observes the query data as-is.
    #[must_use]
    pub fn new(query: QueryOptions<T>) -> Self {
        Self {
            query,
            select: Arc::new(|data: &Arc<T>| data.clone()),
            custom_select: false,
            placeholder_data: None,
        }
    }
}

impl<T: QueryData> From<QueryOptions<T>> for QueryObserverOptions<T> {
    fn from(query: QueryOptions<T>) -> Self {
        Self::new(query)
    }
}

impl<T: QueryData, S> QueryObserverOptions<T, S> {
    /// Observes a derived view of the data. The selector reruns only when
    /// the data or the selector changes.
    #[must_use]
    pub fn select<S2>(self, f: impl Fn(&T) -> S2 + Send + Sync + 'static) -> QueryObserverOptions<T, S2> {
        QueryObserverOptions {
            query: self.query,
            select: Arc::new(move |data: &Arc<T>| Arc::new(f(data))),
            custom_select: true,
            placeholder_data: self.placeholder_data,
        }
    }

    #[must_use]
    pub fn placeholder_data(mut self, placeholder: PlaceholderData<T>) -> Self {
        self.placeholder_data = Some(placeholder);
        self
    }

    /// Adjusts the untyped configuration of the underlying query.
    #[must_use]
    pub fn config(mut self, f: impl FnOnce(QueryConfig) -> QueryConfig) -> Self {
        self.query = self.query.config(f);
        self
    }

    const fn config_ref(&self) -> &QueryConfig {
        &self.query.config
    }
}

/// Properties of a [`QueryObserverResult`], used to limit notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultProp {
    Data,
    DataUpdatedAt,
    Error,
    ErrorUpdatedAt,
    ErrorUpdateCount,
    FailureCount,
    FailureReason,
    Status,
    FetchStatus,
    IsFetched,
    IsFetchedAfterMount,
    IsPlaceholderData,
    IsStale,
    IsEnabled,
}

impl ResultProp {
    const ALL: [Self; 14] = [
        Self::Data,
        Self::DataUpdatedAt,
        Self::Error,
        Self::ErrorUpdatedAt,
        Self::ErrorUpdateCount,
        Self::FailureCount,
        Self::FailureReason,
        Self::Status,
        Self::FetchStatus,
        Self::IsFetched,
        Self::IsFetchedAfterMount,
        Self::IsPlaceholderData,
        Self::IsStale,
        Self::IsEnabled,
    ];
}

/// What a subscriber sees of a query.
///
/// The `is_*` flags derived from `status` and `fetch_status` are methods;
/// everything else is a field.
#[derive(Debug)]
pub struct QueryObserverResult<S> {
    pub data: Option<Arc<S>>,
    pub data_updated_at: u64,
    pub error: Option<QueryError>,
    pub error_updated_at: u64,
    pub error_update_count: u32,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    pub is_fetched: bool,
    pub is_fetched_after_mount: bool,
    pub is_placeholder_data: bool,
    pub is_stale: bool,
    pub is_enabled: bool,
    pub(crate) fetch_direction: Option<FetchDirection>,
}

impl<S> Clone for QueryObserverResult<S> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            data_updated_at: self.data_updated_at,
            error: self.error.clone(),
            error_updated_at: self.error_updated_at,
            error_update_count: self.error_update_count,
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            status: self.status,
            fetch_status: self.fetch_status,
            is_fetched: self.is_fetched,
            is_fetched_after_mount: self.is_fetched_after_mount,
            is_placeholder_data: self.is_placeholder_data,
            is_stale: self.is_stale,
            is_enabled: self.is_enabled,
            fetch_direction: self.fetch_direction,
        }
    }
}

impl<S> QueryObserverResult<S> {
    const fn empty() -> Self {
        Self {
            data: None,
            data_updated_at: 0,
            error: None,
            error_updated_at: 0,
            error_update_count: 0,
            failure_count: 0,
            failure_reason: None,
            status: QueryStatus::Pending,
            fetch_status: FetchStatus::Idle,
            is_fetched: false,
            is_fetched_after_mount: false,
            is_placeholder_data: false,
            is_stale: true,
            is_enabled: true,
            fetch_direction: None,
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == QueryStatus::Pending
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    #[must_use]
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.fetch_status == FetchStatus::Paused
    }

    /// First fetch in flight.
    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.is_pending() && self.is_fetching()
    }

    /// Background fetch while data is shown.
    #[must_use]
    pub fn is_refetching(&self) -> bool {
        self.is_fetching() && !self.is_pending()
    }

    #[must_use]
    pub fn is_loading_error(&self) -> bool {
        self.is_error() && self.data.is_none()
    }

    #[must_use]
    pub fn is_refetch_error(&self) -> bool {
        self.is_error() && self.data.is_some()
    }

    fn differs(&self, other: &Self, prop: ResultProp) -> bool {
        match prop {
            ResultProp::Data => match (&self.data, &other.data) {
                (Some(a), Some(b)) => !Arc::ptr_eq(a, b),
                (None, None) => false,
                _ => true,
            },
            ResultProp::DataUpdatedAt => self.data_updated_at != other.data_updated_at,
            ResultProp::Error => self.error != other.error,
            ResultProp::ErrorUpdatedAt => self.error_updated_at != other.error_updated_at,
            ResultProp::ErrorUpdateCount => self.error_update_count != other.error_update_count,
            ResultProp::FailureCount => self.failure_count != other.failure_count,
            ResultProp::FailureReason => self.failure_reason != other.failure_reason,
            ResultProp::Status => self.status != other.status,
            ResultProp::FetchStatus => self.fetch_status != other.fetch_status,
            ResultProp::IsFetched => self.is_fetched != other.is_fetched,
            ResultProp::IsFetchedAfterMount => {
                self.is_fetched_after_mount != other.is_fetched_after_mount
            }
            ResultProp::IsPlaceholderData => self.is_placeholder_data != other.is_placeholder_data,
            ResultProp::IsStale => self.is_stale != other.is_stale,
            ResultProp::IsEnabled => self.is_enabled != other.is_enabled,
        }
    }

    pub(crate) fn shallow_eq(&self, other: &Self) -> bool {
        !ResultProp::ALL.iter().any(|prop| self.differs(other, *prop))
    }
}

pub(crate) fn is_stale<T: QueryData>(query: &Query<T>, config: &QueryConfig) -> bool {
    let snapshot = query.snapshot();
    config.is_enabled_for(&snapshot) && query.is_stale_by_time(config.stale_time_for(&snapshot))
}

fn should_fetch_on<T: QueryData>(
    query: &Query<T>,
    config: &QueryConfig,
    trigger: Option<&Resolvable<RefetchOn>>,
) -> bool {
    let snapshot = query.snapshot();
    if !config.is_enabled_for(&snapshot) || config.stale_time_for(&snapshot) == StaleTime::Static {
        return false;
    }
    match trigger.map_or(RefetchOn::IfStale, |t| t.resolve(&snapshot)) {
        RefetchOn::Always => true,
        RefetchOn::Never => false,
        RefetchOn::IfStale => is_stale(query, config),
    }
}

pub(crate) fn should_fetch_on_mount<T: QueryData>(query: &Query<T>, config: &QueryConfig) -> bool {
    let snapshot = query.snapshot();
    let load = config.is_enabled_for(&snapshot)
        && !snapshot.has_data
        && !(snapshot.status == QueryStatus::Error && config.retry_on_mount == Some(false));
    load || (snapshot.has_data && should_fetch_on(query, config, config.refetch_on_mount.as_ref()))
}

fn should_fetch_optionally<T: QueryData>(
    query: &Arc<Query<T>>,
    prev_query: &Arc<Query<T>>,
    config: &QueryConfig,
    prev_config: &QueryConfig,
) -> bool {
    (!Arc::ptr_eq(query, prev_query) || !prev_config.is_enabled_for(&prev_query.snapshot()))
        && is_stale(query, config)
}

fn keep_equal<S: PartialEq>(previous: Option<&Arc<S>>, next: Arc<S>) -> Arc<S> {
    match previous {
        Some(previous) if **previous == *next => previous.clone(),
        _ => next,
    }
}

struct SelectMemo<T, S> {
    input: Arc<T>,
    select: Select<T, S>,
    output: Arc<S>,
}

struct ObserverState<T: QueryData, S> {
    options: QueryObserverOptions<T, S>,
    query: Arc<Query<T>>,
    /// Update counts of the query when this observer attached to it.
    initial_counts: (u32, u32),
    result: QueryObserverResult<S>,
    result_placeholder: Option<PlaceholderData<T>>,
    selected: Option<SelectMemo<T, S>>,
    last_query_with_data: Option<Arc<Query<T>>>,
    stale_timer: Option<Handle>,
    refetch_timer: Option<Handle>,
    refetch_interval: Option<Duration>,
}

impl<T: QueryData, S: PartialEq + Send + Sync + 'static> ObserverState<T, S> {
    /// Derives a result for `query` under `options`. `optimistic` carries
    /// whether the observer is mounted, and if set the result anticipates
    /// the fetch the observer is about to start.
    fn create_result(
        &mut self,
        client: &QueryClient,
        query: &Arc<Query<T>>,
        options: &QueryObserverOptions<T, S>,
        optimistic: Option<bool>,
    ) -> QueryObserverResult<S> {
        let config = options.config_ref();
        let mut state = query.state();
        let initial_counts = if Arc::ptr_eq(query, &self.query) {
            self.initial_counts
        } else {
            (state.data_update_count, state.error_update_count)
        };

        if let Some(mounted) = optimistic {
            let fetch = if mounted {
                should_fetch_optionally(query, &self.query, config, self.options.config_ref())
            } else {
                should_fetch_on_mount(query, config)
            };
            if fetch {
                let can_fetch = config
                    .network_mode_or_default()
                    .can_fetch(&client.online_manager());
                state = state.fetching(can_fetch);
            }
        }

        let sharing = config.structural_sharing != Some(false);
        let mut data = state.data.as_ref().map(|source| {
            if !options.custom_select {
                return (options.select)(source);
            }
            if let Some(memo) = &self.selected
                && Arc::ptr_eq(&memo.input, source)
                && Arc::ptr_eq(&memo.select, &options.select)
            {
                return memo.output.clone();
            }
            let selected = (options.select)(source);
            let selected = if sharing {
                keep_equal(self.result.data.as_ref(), selected)
            } else {
                selected
            };
            self.selected = Some(SelectMemo {
                input: source.clone(),
                select: options.select.clone(),
                output: selected.clone(),
            });
            selected
        });

        let mut status = state.status;
        let mut is_placeholder_data = false;
        if let Some(placeholder) = &options.placeholder_data
            && data.is_none()
            && status == QueryStatus::Pending
        {
            let reused = self.result.is_placeholder_data
                && self
                    .result_placeholder
                    .as_ref()
                    .is_some_and(|previous| previous.same_as(placeholder));
            let resolved = if reused {
                self.result.data.clone()
            } else {
                let previous = self.last_query_with_data.as_ref().and_then(|q| q.data());
                placeholder
                    .resolve(previous.as_ref())
                    .map(|p| (options.select)(&p))
            };
            if let Some(placeholder) = resolved {
                status = QueryStatus::Success;
                data = Some(if sharing {
                    keep_equal(self.result.data.as_ref(), placeholder)
                } else {
                    placeholder
                });
                is_placeholder_data = true;
            }
        }

        let snapshot = query.snapshot();
        QueryObserverResult {
            data,
            data_updated_at: state.data_updated_at,
            error: state.error.clone(),
            error_updated_at: state.error_updated_at,
            error_update_count: state.error_update_count,
            failure_count: state.fetch_failure_count,
            failure_reason: state.fetch_failure_reason.clone(),
            status,
            fetch_status: state.fetch_status,
            is_fetched: state.data_update_count > 0 || state.error_update_count > 0,
            is_fetched_after_mount: state.data_update_count > initial_counts.0
                || state.error_update_count > initial_counts.1,
            is_placeholder_data,
            is_stale: is_stale(query, config),
            is_enabled: config.is_enabled_for(&snapshot),
            fetch_direction: state.fetch_meta.as_ref().and_then(|meta| meta.fetch_more),
        }
    }
}

type ResultListener<S> = dyn Fn(&QueryObserverResult<S>) + Send + Sync;

pub(crate) struct ObserverShared<T: QueryData, S> {
    id: EntityId,
    listener_key: ListenerKey,
    client: QueryClient,
    state: Mutex<ObserverState<T, S>>,
    listeners: Listeners<ResultListener<S>>,
    this: Weak<Self>,
}

/// Watches one query on behalf of its listeners.
///
/// Cheap to clone; clones share listeners and state.
pub struct QueryObserver<T: QueryData, S = T> {
    inner: Arc<ObserverShared<T, S>>,
}

impl<T: QueryData, S> Clone for QueryObserver<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: QueryData, S> fmt::Debug for QueryObserver<T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserver")
            .field("id", &self.inner.id)
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl<T: QueryData> QueryObserver<T> {
    /// Observes the query described by `options`.
    pub fn new(client: &QueryClient, options: QueryOptions<T>) -> Self {
        Self::with_options(client, QueryObserverOptions::new(options))
    }
}

impl<T: QueryData, S: PartialEq + Send + Sync + 'static> QueryObserver<T, S> {
    pub fn with_options(client: &QueryClient, mut options: QueryObserverOptions<T, S>) -> Self {
        options.query = client.default_query_options(options.query);
        let query = client.get_query_cache().build(client, options.query.clone());
        let counts = {
            let state = query.state();
            (state.data_update_count, state.error_update_count)
        };
        let inner = Arc::new_cyclic(|this| ObserverShared {
            id: EntityId::next(),
            listener_key: ListenerKey::next(),
            client: client.clone(),
            state: Mutex::new(ObserverState {
                options,
                query,
                initial_counts: counts,
                result: QueryObserverResult::empty(),
                result_placeholder: None,
                selected: None,
                last_query_with_data: None,
                stale_timer: None,
                refetch_timer: None,
                refetch_interval: None,
            }),
            listeners: Listeners::default(),
            this: this.clone(),
        });
        inner.update_result();
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    /// Subscribes to result changes. The first listener attaches the
    /// observer to its query (fetching if needed), the last one to leave
    /// detaches it.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult<S>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let (key, count) = self.inner.listeners.add(Arc::new(listener));
        if count == 1 {
            self.inner.on_subscribe();
        }
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade()
                && inner.listeners.remove(key) == Some(0)
            {
                inner.destroy();
            }
        })
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    #[must_use]
    pub fn get_current_result(&self) -> QueryObserverResult<S> {
        self.inner.state.lock().result.clone()
    }

    #[must_use]
    pub fn get_current_query(&self) -> Arc<Query<T>> {
        self.inner.state.lock().query.clone()
    }

    #[must_use]
    pub fn options(&self) -> QueryObserverOptions<T, S> {
        self.inner.state.lock().options.clone()
    }

    /// Switches options. A new key moves the observer to another query.
    pub fn set_options(&self, options: impl Into<QueryObserverOptions<T, S>>) {
        self.inner.set_options(options.into());
    }

    /// The result the observer would produce right after mounting with
    /// `options`, including a fetch it is about to start.
    pub fn get_optimistic_result(
        &self,
        options: impl Into<QueryObserverOptions<T, S>>,
    ) -> QueryObserverResult<S> {
        let client = &self.inner.client;
        let mut options = options.into();
        options.query = client.default_query_options(options.query);
        let query = client.get_query_cache().build(client, options.query.clone());
        let mounted = self.has_listeners();
        let mut state = self.inner.state.lock();
        let result = state.create_result(client, &query, &options, Some(mounted));
        if !result.shallow_eq(&state.result) {
            state.result = result.clone();
            state.result_placeholder = options.placeholder_data.clone();
        }
        result
    }

    /// Fetches again, replacing a running fetch, and returns the settled
    /// result.
    pub async fn refetch(&self) -> QueryObserverResult<S> {
        self.fetch(FetchOptions::cancel_refetch(true)).await
    }

    pub(crate) async fn fetch(&self, fetch_options: FetchOptions) -> QueryObserverResult<S> {
        let promise = self.inner.execute_fetch(fetch_options);
        let _ = promise.await;
        self.inner.update_result();
        self.get_current_result()
    }

    /// Whether an error boundary should receive the current error.
    #[must_use]
    pub fn should_throw(&self) -> bool {
        let state = self.inner.state.lock();
        state.result.is_error()
            && !state.result.is_fetching()
            && state.options.config_ref().throw_on_error == Some(true)
    }

    /// Detaches from the query and stops all timers.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
        self.inner.destroy();
    }
}

impl<T: QueryData, S: PartialEq + Send + Sync + 'static> ObserverShared<T, S> {
    fn link(&self) -> Option<Arc<dyn QueryObserverLink<T>>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn QueryObserverLink<T>>)
    }

    fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    fn on_subscribe(&self) {
        let (query, fetch) = {
            let state = self.state.lock();
            let fetch = should_fetch_on_mount(&state.query, state.options.config_ref());
            (state.query.clone(), fetch)
        };
        if let Some(link) = self.link() {
            query.add_observer(link);
        }
        if fetch {
            drop(self.execute_fetch(FetchOptions::default()));
        } else {
            self.update_result();
        }
        self.update_timers();
    }

    fn destroy(&self) {
        let query = {
            let mut state = self.state.lock();
            for timer in [state.stale_timer.take(), state.refetch_timer.take()]
                .into_iter()
                .flatten()
            {
                timer.stop();
            }
            state.query.clone()
        };
        query.remove_observer(self.id);
    }

    fn set_options(&self, mut options: QueryObserverOptions<T, S>) {
        options.query = self.client.default_query_options(options.query);
        let (prev_query, prev_options) = {
            let mut state = self.state.lock();
            let prev_options = std::mem::replace(&mut state.options, options.clone());
            (state.query.clone(), prev_options)
        };

        self.update_query();
        let query = self.state.lock().query.clone();
        query.set_options(options.query.clone());
        query.notify_observer_options_updated(self.id);

        let mounted = self.has_listeners();
        let config = options.config_ref();
        let prev_config = prev_options.config_ref();
        if mounted && should_fetch_optionally(&query, &prev_query, config, prev_config) {
            drop(self.execute_fetch(FetchOptions::default()));
        }
        self.update_result();

        if !mounted {
            return;
        }
        let query_changed = !Arc::ptr_eq(&query, &prev_query);
        let enabled_changed = !same_resolvable(&config.enabled, &prev_config.enabled);
        if query_changed
            || enabled_changed
            || !same_resolvable(&config.stale_time, &prev_config.stale_time)
        {
            self.update_stale_timeout();
        }
        let next_interval = self.compute_refetch_interval();
        if query_changed
            || enabled_changed
            || next_interval != self.state.lock().refetch_interval
        {
            self.update_refetch_interval(next_interval);
        }
    }

    /// Points the observer at the query its options name, moving the
    /// observer registration along when mounted.
    fn update_query(&self) {
        let options = self.state.lock().options.query.clone();
        let query = self.client.get_query_cache().build(&self.client, options);
        let prev_query = {
            let mut state = self.state.lock();
            if Arc::ptr_eq(&state.query, &query) {
                return;
            }
            let query_state = query.state();
            state.initial_counts = (query_state.data_update_count, query_state.error_update_count);
            std::mem::replace(&mut state.query, query.clone())
        };
        if self.has_listeners() {
            prev_query.remove_observer(self.id);
            if let Some(link) = self.link() {
                query.add_observer(link);
            }
        }
    }

    fn execute_fetch(&self, fetch_options: FetchOptions) -> QueryPromise<T> {
        self.update_query();
        let (query, options) = {
            let state = self.state.lock();
            (state.query.clone(), state.options.query.clone())
        };
        query.fetch(Some(options), fetch_options)
    }

    fn update_result(&self) {
        let (result, notify_listeners, query) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let query = state.query.clone();
            let options = state.options.clone();
            let next = state.create_result(&self.client, &query, &options, None);
            state.result_placeholder = options.placeholder_data.clone();
            if query.data().is_some() {
                state.last_query_with_data = Some(query.clone());
            }
            if next.shallow_eq(&state.result) {
                return;
            }
            let notify_listeners = should_notify_listeners(&state.result, &next, options.config_ref());
            state.result = next.clone();
            (next, notify_listeners, query)
        };

        let notify = self.client.notify_manager();
        notify.batch(|| {
            if notify_listeners {
                let listeners = self.listeners.snapshot();
                notify.schedule_for(self.listener_key, move || {
                    for (_, listener) in listeners {
                        listener(&result);
                    }
                });
            }
            query.notify_observer_results_updated();
        });
    }

    fn update_timers(&self) {
        self.update_stale_timeout();
        let interval = self.compute_refetch_interval();
        self.update_refetch_interval(interval);
    }

    fn update_stale_timeout(&self) {
        let (stale_time, updated_at) = {
            let mut state = self.state.lock();
            if let Some(timer) = state.stale_timer.take() {
                timer.stop();
            }
            if state.result.is_stale {
                return;
            }
            let snapshot = state.query.snapshot();
            (
                state.options.config_ref().stale_time_for(&snapshot),
                state.result.data_updated_at,
            )
        };
        let StaleTime::Duration(stale_time) = stale_time else {
            return;
        };
        if !is_valid_timeout(stale_time) {
            return;
        }
        let timeout = time_until_stale(updated_at, stale_time) + Duration::from_millis(1);
        let weak = self.this.clone();
        let timer = Handle::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(observer) = weak.upgrade() {
                let stale = observer.state.lock().result.is_stale;
                if !stale {
                    observer.update_result();
                }
            }
        });
        if let Some(previous) = std::mem::replace(&mut self.state.lock().stale_timer, timer) {
            previous.stop();
        }
    }

    fn compute_refetch_interval(&self) -> Option<Duration> {
        let state = self.state.lock();
        state
            .options
            .config_ref()
            .refetch_interval_for(&state.query.snapshot())
    }

    fn update_refetch_interval(&self, interval: Option<Duration>) {
        let enabled = {
            let mut state = self.state.lock();
            if let Some(timer) = state.refetch_timer.take() {
                timer.stop();
            }
            state.refetch_interval = interval;
            state
                .options
                .config_ref()
                .is_enabled_for(&state.query.snapshot())
        };
        let Some(period) = interval else {
            return;
        };
        if !enabled || period.is_zero() || !is_valid_timeout(period) {
            return;
        }
        let weak = self.this.clone();
        let timer = Handle::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut ticks = IntervalStream::new(interval);
            while ticks.next().await.is_some() {
                let Some(observer) = weak.upgrade() else {
                    break;
                };
                let in_background = observer
                    .state
                    .lock()
                    .options
                    .config_ref()
                    .refetch_interval_in_background
                    == Some(true);
                if in_background || observer.client.focus_manager().is_focused() {
                    drop(observer.execute_fetch(FetchOptions::default()));
                }
            }
        });
        if let Some(previous) = std::mem::replace(&mut self.state.lock().refetch_timer, timer) {
            previous.stop();
        }
    }
}

fn same_resolvable<V: Clone + PartialEq>(a: &Option<Resolvable<V>>, b: &Option<Resolvable<V>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.same_as(b),
        (None, None) => true,
        _ => false,
    }
}

fn should_notify_listeners<S>(
    previous: &QueryObserverResult<S>,
    next: &QueryObserverResult<S>,
    config: &QueryConfig,
) -> bool {
    match &config.notify_on_change_props {
        None | Some(NotifyOnChangeProps::All) => true,
        Some(NotifyOnChangeProps::Props(props)) => {
            let watch_error = config.throw_on_error == Some(true);
            props
                .iter()
                .chain(watch_error.then_some(&ResultProp::Error))
                .any(|prop| previous.differs(next, *prop))
        }
    }
}

impl<T: QueryData, S: PartialEq + Send + Sync + 'static> QueryObserverLink<T> for ObserverShared<T, S> {
    fn observer_id(&self) -> EntityId {
        self.id
    }

    fn on_query_update(&self) {
        self.update_result();
        if self.has_listeners() {
            self.update_timers();
        }
    }

    fn should_fetch_on_window_focus(&self) -> bool {
        let state = self.state.lock();
        let config = state.options.config_ref();
        should_fetch_on(&state.query, config, config.refetch_on_window_focus.as_ref())
    }

    fn should_fetch_on_reconnect(&self) -> bool {
        let state = self.state.lock();
        let config = state.options.config_ref();
        should_fetch_on(&state.query, config, config.refetch_on_reconnect.as_ref())
    }

    fn refetch_in_background(&self) {
        drop(self.execute_fetch(FetchOptions::cancel_refetch(false)));
    }

    fn is_enabled(&self) -> bool {
        let state = self.state.lock();
        state
            .options
            .config_ref()
            .is_enabled_for(&state.query.snapshot())
    }

    fn is_static(&self) -> bool {
        let state = self.state.lock();
        state
            .options
            .config_ref()
            .stale_time_for(&state.query.snapshot())
            == StaleTime::Static
    }

    fn is_stale(&self) -> bool {
        let state = self.state.lock();
        is_stale(&state.query, state.options.config_ref())
    }

    fn query_options(&self) -> QueryOptions<T> {
        self.state.lock().options.query.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryFunctionContext;
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicU32, Ordering};

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn counter_fn(
        calls: &Arc<AtomicU32>,
    ) -> impl Fn(QueryFunctionContext) -> BoxFuture<'static, Result<u32, QueryError>> + Send + Sync + 'static
    {
        let calls = calls.clone();
        move |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(n) }.boxed()
        }
    }

    fn recorded<S: Send + Sync + 'static>(
        observer: &QueryObserver<u32, S>,
    ) -> (Arc<Mutex<Vec<QueryObserverResult<S>>>>, Unsubscribe)
    where
        S: PartialEq,
    {
        let results = Arc::new(Mutex::new(Vec::new()));
        let r = results.clone();
        let unsubscribe = observer.subscribe(move |result| r.lock().push(result.clone()));
        (results, unsubscribe)
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_fetches_on_mount() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let observer = QueryObserver::new(&client, QueryOptions::new("mount", counter_fn(&calls)));
        assert!(observer.get_current_result().is_pending());
        assert!(!observer.get_current_result().is_fetching());

        let (results, _unsubscribe) = recorded(&observer);
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let results = results.lock();
        assert!(results[0].is_loading());
        let last = results.last().expect("at least one result");
        assert!(last.is_success());
        assert_eq!(last.data.as_deref(), Some(&1));
        assert!(last.is_fetched_after_mount);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_data_is_not_refetched_on_mount() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new("fresh", counter_fn(&calls))
            .stale_time(Duration::from_secs(60))
            .initial_data(5);
        let observer = QueryObserver::new(&client, options);
        let _unsubscribe = observer.subscribe(|_| {});
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let result = observer.get_current_result();
        assert_eq!(result.data.as_deref(), Some(&5));
        assert!(!result.is_stale);
        assert!(!result.is_fetched_after_mount);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_observer_does_not_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let observer = QueryObserver::new(
            &client,
            QueryOptions::new("off", counter_fn(&calls)).enabled(false),
        );
        let _unsubscribe = observer.subscribe(|_| {});
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!observer.get_current_result().is_enabled);
        assert!(observer.get_current_query().is_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_is_memoized_by_input() {
        let client = QueryClient::new();
        let selects = Arc::new(AtomicU32::new(0));
        let s = selects.clone();
        let options = QueryObserverOptions::new(
            QueryOptions::<u32>::key("sel")
                .initial_data(2)
                .stale_time(StaleTime::INFINITE),
        )
        .select(move |n| {
            s.fetch_add(1, Ordering::SeqCst);
            n * 10
        });
        let observer = QueryObserver::with_options(&client, options);
        let _unsubscribe = observer.subscribe(|_| {});
        let first = observer.get_current_result().data.expect("selected");
        assert_eq!(*first, 20);

        observer.get_current_query().invalidate();
        let second = observer.get_current_result();
        assert!(second.is_stale);
        assert!(Arc::ptr_eq(&first, &second.data.expect("selected")));
        assert_eq!(selects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_previous_placeholder_when_switching_keys() {
        let client = QueryClient::new();
        let options = |page: u32| {
            QueryObserverOptions::new(QueryOptions::new(
                serde_json::json!(["page", page]),
                move |_| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(page * 100)
                },
            ))
            .placeholder_data(PlaceholderData::KeepPrevious)
        };
        let observer = QueryObserver::with_options(&client, options(1));
        let (results, _unsubscribe) = recorded(&observer);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.get_current_result().data.as_deref(), Some(&100));

        observer.set_options(options(2));
        let switching = observer.get_current_result();
        assert!(switching.is_placeholder_data);
        assert!(switching.is_success());
        assert!(switching.is_fetching());
        assert_eq!(switching.data.as_deref(), Some(&100));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let done = observer.get_current_result();
        assert!(!done.is_placeholder_data);
        assert_eq!(done.data.as_deref(), Some(&200));
        assert!(results.lock().len() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_flips_is_stale() {
        let client = QueryClient::new();
        let options = QueryOptions::<u32>::key("stale")
            .stale_time(Duration::from_millis(100))
            .initial_data(1);
        let observer = QueryObserver::new(&client, options);
        let (results, _unsubscribe) = recorded(&observer);
        assert!(!observer.get_current_result().is_stale);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observer.get_current_result().is_stale);
        assert!(results.lock().last().is_some_and(|r| r.is_stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval_respects_focus() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let options = QueryOptions::new("interval", counter_fn(&calls))
            .stale_time(StaleTime::INFINITE)
            .config(|c| c.refetch_interval(Duration::from_millis(100)));
        let observer = QueryObserver::new(&client, options);
        let _unsubscribe = observer.subscribe(|_| {});
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        client.focus_manager().set_focused(Some(false));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notify_on_change_props_limits_notifications() {
        let client = QueryClient::new();
        let options = QueryOptions::<u32>::new("props", |_| async { Ok(1) })
            .config(|c| c.notify_on_change_props([ResultProp::Data]));
        let observer = QueryObserver::new(&client, options);
        let (results, _unsubscribe) = recorded(&observer);
        settle().await;

        let results = results.lock();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].data.as_deref(), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_detaches_from_query() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(
            &client,
            QueryOptions::<u32>::key("detach")
                .initial_data(1)
                .stale_time(StaleTime::INFINITE),
        );
        let unsubscribe = observer.subscribe(|_| {});
        let query = observer.get_current_query();
        assert_eq!(query.observer_count(), 1);
        assert!(query.is_active());
        unsubscribe.unsubscribe();
        assert_eq!(query.observer_count(), 0);
        assert!(!query.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_result_anticipates_mount_fetch() {
        let client = QueryClient::new();
        let options = QueryOptions::<u32>::new("optimistic", |_| async { Ok(1) });
        let observer = QueryObserver::new(&client, options.clone());
        let result = observer.get_optimistic_result(options);
        assert!(result.is_loading());
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_throw_follows_config() {
        let client = QueryClient::new();
        let options = QueryOptions::<u32>::new("throw", |_| async {
            Err(QueryError::FetchError("boom".to_string()))
        })
        .config(|c| c.throw_on_error(true));
        let observer = QueryObserver::new(&client, options);
        let _unsubscribe = observer.subscribe(|_| {});
        settle().await;
        assert!(observer.get_current_result().is_loading_error());
        assert!(observer.should_throw());
    }
}
