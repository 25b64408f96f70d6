//! Typed mutation options and per-call callbacks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::client::QueryClient;
use crate::config::{MutationConfig, NetworkMode, Retry, RetryDelay};
use crate::error::QueryError;
use crate::key::QueryKey;

/// Passed to every mutation function call.
#[derive(Debug, Clone)]
pub struct MutationFunctionContext {
    pub client: QueryClient,
    pub meta: Option<Value>,
    pub mutation_key: Option<QueryKey>,
}

type RawMutationFn<T, V> =
    dyn Fn(Arc<V>, MutationFunctionContext) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync;

/// The function a mutation calls to perform its side effect.
pub struct MutationFn<T, V>(Arc<RawMutationFn<T, V>>);

impl<T, V> Clone for MutationFn<T, V> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T, V> fmt::Debug for MutationFn<T, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MutationFn(..)")
    }
}

impl<T, V> MutationFn<T, V> {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Arc<V>, MutationFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self(Arc::new(move |variables, ctx| f(variables, ctx).boxed()))
    }

    pub(crate) fn call(
        &self,
        variables: Arc<V>,
        ctx: MutationFunctionContext,
    ) -> BoxFuture<'static, Result<T, QueryError>> {
        (self.0)(variables, ctx)
    }
}

pub(crate) type OnMutate<V, C> =
    Arc<dyn Fn(Arc<V>) -> BoxFuture<'static, Result<Option<C>, QueryError>> + Send + Sync>;
pub(crate) type OnSuccess<T, V, C> = Arc<
    dyn Fn(Arc<T>, Arc<V>, Option<Arc<C>>) -> BoxFuture<'static, Result<(), QueryError>> + Send + Sync,
>;
pub(crate) type OnError<V, C> = Arc<
    dyn Fn(QueryError, Arc<V>, Option<Arc<C>>) -> BoxFuture<'static, Result<(), QueryError>>
        + Send
        + Sync,
>;
pub(crate) type OnSettled<T, V, C> = Arc<
    dyn Fn(
            Option<Arc<T>>,
            Option<QueryError>,
            Arc<V>,
            Option<Arc<C>>,
        ) -> BoxFuture<'static, Result<(), QueryError>>
        + Send
        + Sync,
>;

/// Typed options of one mutation.
///
/// The lifecycle callbacks are awaited in order around the mutation
/// function. An error returned from `on_mutate` fails the mutation; errors
/// from the other callbacks are logged and do not change the outcome.
pub struct MutationOptions<T, V, C = ()> {
    pub mutation_key: Option<QueryKey>,
    pub mutation_fn: Option<MutationFn<T, V>>,
    pub config: MutationConfig,
    pub meta: Option<Value>,
    pub(crate) on_mutate: Option<OnMutate<V, C>>,
    pub(crate) on_success: Option<OnSuccess<T, V, C>>,
    pub(crate) on_error: Option<OnError<V, C>>,
    pub(crate) on_settled: Option<OnSettled<T, V, C>>,
}

impl<T, V, C> Clone for MutationOptions<T, V, C> {
    fn clone(&self) -> Self {
        Self {
            mutation_key: self.mutation_key.clone(),
            mutation_fn: self.mutation_fn.clone(),
            config: self.config.clone(),
            meta: self.meta.clone(),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, V, C> Default for MutationOptions<T, V, C> {
    fn default() -> Self {
        Self {
            mutation_key: None,
            mutation_fn: None,
            config: MutationConfig::default(),
            meta: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<T, V, C> fmt::Debug for MutationOptions<T, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("mutation_fn", &self.mutation_fn.is_some())
            .field("config", &self.config)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl<T, V, C> MutationOptions<T, V, C> {
    pub fn new<F, Fut>(mutation_fn: F) -> Self
    where
        F: Fn(Arc<V>, MutationFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self {
            mutation_fn: Some(MutationFn::new(mutation_fn)),
            ..Self::default()
        }
    }

    /// Options identified by key only; the function can come from the
    /// client's mutation defaults.
    pub fn key(mutation_key: impl Into<QueryKey>) -> Self {
        Self {
            mutation_key: Some(mutation_key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn mutation_key(mut self, mutation_key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(mutation_key.into());
        self
    }

    #[must_use]
    pub fn config(mut self, f: impl FnOnce(MutationConfig) -> MutationConfig) -> Self {
        self.config = f(self.config);
        self
    }

    #[must_use]
    pub fn scope(self, id: impl Into<String>) -> Self {
        self.config(|c| c.scope(id))
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
    pub fn gc_time(self, gc_time: Duration) -> Self {
        self.config(|c| c.gc_time(gc_time))
    }

    #[must_use]
    pub fn network_mode(self, network_mode: NetworkMode) -> Self {
        self.config(|c| c.network_mode(network_mode))
    }

    #[must_use]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Runs before the mutation function. The returned value becomes the
    /// context of the later callbacks.
    #[must_use]
    pub fn on_mutate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<V>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<C>, QueryError>> + Send + 'static,
    {
        self.on_mutate = Some(Arc::new(move |variables| f(variables).boxed()));
        self
    }

    #[must_use]
    pub fn on_success<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Arc<T>, Arc<V>, Option<Arc<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueryError>> + Send + 'static,
    {
        self.on_success = Some(Arc::new(move |data, variables, context| {
            f(data, variables, context).boxed()
        }));
        self
    }

    #[must_use]
    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryError, Arc<V>, Option<Arc<C>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), QueryError>> + Send + 'static,
    {
        self.on_error = Some(Arc::new(move |error, variables, context| {
            f(error, variables, context).boxed()
        }));
        self
    }

    #[must_use]
    pub fn on_settled<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Option<Arc<T>>, Option<QueryError>, Arc<V>, Option<Arc<C>>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), QueryError>> + Send + 'static,
    {
        self.on_settled = Some(Arc::new(move |data, error, variables, context| {
            f(data, error, variables, context).boxed()
        }));
        self
    }

    /// Fills unset fields from `defaults`.
    pub(crate) fn with_defaults(mut self, defaults: &Self) -> Self {
        self.config = self.config.merge(&defaults.config);
        self.mutation_key = self.mutation_key.or_else(|| defaults.mutation_key.clone());
        self.mutation_fn = self.mutation_fn.or_else(|| defaults.mutation_fn.clone());
        self.meta = self.meta.or_else(|| defaults.meta.clone());
        self.on_mutate = self.on_mutate.or_else(|| defaults.on_mutate.clone());
        self.on_success = self.on_success.or_else(|| defaults.on_success.clone());
        self.on_error = self.on_error.or_else(|| defaults.on_error.clone());
        self.on_settled = self.on_settled.or_else(|| defaults.on_settled.clone());
        self
    }
}

type MutateSuccess<T, V, C> = Arc<dyn Fn(&T, &V, Option<&C>) + Send + Sync>;
type MutateError<V, C> = Arc<dyn Fn(&QueryError, &V, Option<&C>) + Send + Sync>;
type MutateSettled<T, V, C> =
    Arc<dyn Fn(Option<&T>, Option<&QueryError>, &V, Option<&C>) + Send + Sync>;

/// Callbacks of a single `mutate` call.
///
/// They fire only for the latest call of an observer and only while the
/// observer has listeners.
pub struct MutateOptions<T, V, C = ()> {
    pub(crate) on_success: Option<MutateSuccess<T, V, C>>,
    pub(crate) on_error: Option<MutateError<V, C>>,
    pub(crate) on_settled: Option<MutateSettled<T, V, C>>,
}

impl<T, V, C> Default for MutateOptions<T, V, C> {
    fn default() -> Self {
        Self {
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<T, V, C> Clone for MutateOptions<T, V, C> {
    fn clone(&self) -> Self {
        Self {
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<T, V, C> fmt::Debug for MutateOptions<T, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutateOptions")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl<T, V, C> MutateOptions<T, V, C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_success(mut self, f: impl Fn(&T, &V, Option<&C>) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(&QueryError, &V, Option<&C>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&T>, Option<&QueryError>, &V, Option<&C>) + Send + Sync + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}
