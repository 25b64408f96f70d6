//! Typed query options and the context handed to query functions.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::Query;
use super::state::{FetchDirection, FetchMeta};
use crate::config::{NetworkMode, QueryConfig, Resolvable, Retry, RetryDelay, StaleTime};
use crate::error::QueryError;
use crate::key::QueryKey;
use crate::structural_sharing::ShareStrategy;

/// Abort signal of one fetch.
///
/// A query function that reads the signal in any way is considered
/// cancellable: when its last observer unsubscribes, the fetch is aborted
/// and the query reverts. Functions that never touch the signal are left to
/// finish and their result is still applied.
#[derive(Clone)]
pub struct AbortSignal {
    token: CancellationToken,
    consumed: Arc<AtomicBool>,
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl AbortSignal {
    pub(crate) const fn new(token: CancellationToken, consumed: Arc<AtomicBool>) -> Self {
        Self { token, consumed }
    }

    /// A signal that is never aborted.
    #[must_use]
    pub fn detached() -> Self {
        Self::new(CancellationToken::new(), Arc::new(AtomicBool::new(false)))
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.consume();
        self.token.is_cancelled()
    }

    /// Completes when the fetch is aborted.
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.consume();
        self.token.cancelled()
    }

    /// The underlying token, e.g. to hand to a child task.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.consume();
        self.token.clone()
    }

    fn consume(&self) {
        self.consumed.store(true, Ordering::SeqCst);
    }
}

/// Passed to every query function call.
#[derive(Debug, Clone)]
pub struct QueryFunctionContext<P = ()> {
    pub query_key: QueryKey,
    pub signal: AbortSignal,
    pub meta: Option<Value>,
    /// Page parameter for infinite queries.
    pub page_param: P,
    pub direction: Option<FetchDirection>,
}

impl<P> QueryFunctionContext<P> {
    pub(crate) fn with_page<Q>(&self, page_param: Q, direction: FetchDirection) -> QueryFunctionContext<Q> {
        QueryFunctionContext {
            query_key: self.query_key.clone(),
            signal: self.signal.clone(),
            meta: self.meta.clone(),
            page_param,
            direction: Some(direction),
        }
    }
}

/// Everything a fetch function needs beyond the public context.
pub(crate) struct FetchArgs<T: super::QueryData> {
    pub context: QueryFunctionContext,
    pub previous: Option<Arc<T>>,
    pub fetch_more: Option<FetchDirection>,
    pub query: Weak<Query<T>>,
}

impl<T: super::QueryData> Clone for FetchArgs<T> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
            previous: self.previous.clone(),
            fetch_more: self.fetch_more,
            query: self.query.clone(),
        }
    }
}

type RawQueryFn<T> =
    dyn Fn(FetchArgs<T>) -> BoxFuture<'static, Result<Option<T>, QueryError>> + Send + Sync;

/// The function a query calls to fetch its data.
pub struct QueryFn<T: super::QueryData>(Arc<RawQueryFn<T>>);

impl<T: super::QueryData> Clone for QueryFn<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: super::QueryData> fmt::Debug for QueryFn<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueryFn(..)")
    }
}

impl<T: super::QueryData> QueryFn<T> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self(Arc::new(move |args: FetchArgs<T>| {
            f(args.context).map(|result| result.map(Some)).boxed()
        }))
    }

    /// A function that may produce no data. `None` settles the query with
    /// [`QueryError::UndefinedData`].
    pub fn optional<F, Fut>(f: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<T>, QueryError>> + Send + 'static,
    {
        Self(Arc::new(move |args: FetchArgs<T>| f(args.context).boxed()))
    }

    pub(crate) fn raw(
        f: impl Fn(FetchArgs<T>) -> BoxFuture<'static, Result<Option<T>, QueryError>>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn call(&self, args: FetchArgs<T>) -> BoxFuture<'static, Result<Option<T>, QueryError>> {
        (self.0)(args)
    }
}

/// Data a query starts with before its first fetch.
pub enum InitialData<T> {
    Value(Arc<T>),
    Fn(Arc<dyn Fn() -> Option<T> + Send + Sync>),
}

impl<T> Clone for InitialData<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(value.clone()),
            Self::Fn(f) => Self::Fn(f.clone()),
        }
    }
}

impl<T> InitialData<T> {
    pub(crate) fn resolve(&self) -> Option<Arc<T>> {
        match self {
            Self::Value(value) => Some(value.clone()),
            Self::Fn(f) => f().map(Arc::new),
        }
    }
}

/// Options of one fetch call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Cancel a running fetch (when data exists) instead of joining it.
    pub cancel_refetch: bool,
    pub meta: Option<FetchMeta>,
}

impl FetchOptions {
    #[must_use]
    pub const fn cancel_refetch(cancel_refetch: bool) -> Self {
        Self {
            cancel_refetch,
            meta: None,
        }
    }
}

/// Options of a direct cache write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetDataOptions {
    pub updated_at: Option<u64>,
    /// Written by the caller rather than by a fetch.
    pub manual: bool,
}

/// Typed options of one query.
pub struct QueryOptions<T: super::QueryData> {
    pub query_key: QueryKey,
    pub query_fn: Option<QueryFn<T>>,
    pub config: QueryConfig,
    pub initial_data: Option<InitialData<T>>,
    pub initial_data_updated_at: Option<u64>,
    pub meta: Option<Value>,
    pub share: Option<Arc<dyn ShareStrategy<T>>>,
}

impl<T: super::QueryData> Clone for QueryOptions<T> {
    fn clone(&self) -> Self {
        Self {
            query_key: self.query_key.clone(),
            query_fn: self.query_fn.clone(),
            config: self.config.clone(),
            initial_data: self.initial_data.clone(),
            initial_data_updated_at: self.initial_data_updated_at,
            meta: self.meta.clone(),
            share: self.share.clone(),
        }
    }
}

impl<T: super::QueryData> fmt::Debug for QueryOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("has_query_fn", &self.query_fn.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: super::QueryData> QueryOptions<T> {
    /// Options for `query_key` fetched by `query_fn`.
    pub fn new<F, Fut>(query_key: impl Into<QueryKey>, query_fn: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self::key(query_key).query_fn(QueryFn::new(query_fn))
    }

    /// Options without a query function, e.g. for reading or writing the
    /// cache.
    pub fn key(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            query_fn: None,
            config: QueryConfig::default(),
            initial_data: None,
            initial_data_updated_at: None,
            meta: None,
            share: None,
        }
    }

    #[must_use]
    pub fn query_hash(&self) -> String {
        self.query_key.hash()
    }

    #[must_use]
    pub fn query_fn(mut self, query_fn: QueryFn<T>) -> Self {
        self.query_fn = Some(query_fn);
        self
    }

    /// Adjusts the untyped configuration.
    #[must_use]
    pub fn config(mut self, f: impl FnOnce(QueryConfig) -> QueryConfig) -> Self {
        self.config = f(self.config);
        self
    }

    #[must_use]
    pub fn stale_time(self, stale_time: impl Into<Resolvable<StaleTime>>) -> Self {
        self.config(|c| c.stale_time(stale_time))
    }

    #[must_use]
    pub fn gc_time(self, gc_time: Duration) -> Self {
        self.config(|c| c.gc_time(gc_time))
    }

    #[must_use]
    pub fn retry(self, retry: impl Into<Retry>) -> Self {
        self.config(|c| c.retry(retry))
    }

    #[must_use]
    pub fn retry_delay(self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.config(|c| c.retry_delay(retry_delay))
    }

    #[must_use]
    pub fn network_mode(self, network_mode: NetworkMode) -> Self {
        self.config(|c| c.network_mode(network_mode))
    }

    #[must_use]
    pub fn enabled(self, enabled: impl Into<Resolvable<bool>>) -> Self {
        self.config(|c| c.enabled(enabled))
    }

    #[must_use]
    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(InitialData::Value(Arc::new(data)));
        self
    }

    #[must_use]
    pub fn initial_data_fn(mut self, f: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        self.initial_data = Some(InitialData::Fn(Arc::new(f)));
        self
    }

    #[must_use]
    pub const fn initial_data_updated_at(mut self, updated_at: u64) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Replaces the structural sharing strategy.
    #[must_use]
    pub fn share_with(mut self, strategy: impl ShareStrategy<T> + 'static) -> Self {
        self.share = Some(Arc::new(strategy));
        self
    }

    /// Fills unset configuration from `fallback`.
    #[must_use]
    pub(crate) fn with_defaults(mut self, fallback: &QueryConfig) -> Self {
        self.config = self.config.merge(fallback);
        self
    }
}
