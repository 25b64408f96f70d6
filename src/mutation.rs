//! The mutation entity.
//!
//! A [`Mutation`] performs one write through its mutation function and
//! runs the lifecycle callbacks around it. Mutations of the same scope run
//! one at a time in submission order; the [`MutationCache`] decides which
//! one may start.

pub mod cache;
pub mod observer;
pub mod options;
pub mod state;

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use serde_json::Value;

use crate::client::{Environment, WeakQueryClient};
use crate::config::MutationScope;
use crate::error::{CancelledError, QueryError};
use crate::gc::EntityId;
use crate::hydration::{DehydratedMutation, DehydratedMutationState};
use crate::key::QueryKey;
use crate::query::QueryData;
use crate::retryer::{Attempt, Retryer, RetryerConfig, RetryerHandle};

pub use cache::{MutationCache, MutationCacheConfig, MutationCacheEvent};
pub use observer::{MutationObserver, MutationObserverResult};
pub use options::{MutateOptions, MutationFn, MutationFunctionContext, MutationOptions};
pub use state::{MutationActionKind, MutationState, MutationStatus};

use state::{MutationAction, reduce};

type MutationPromise<T> = Shared<BoxFuture<'static, Result<Arc<T>, QueryError>>>;

/// What a mutation needs from each attached observer.
pub(crate) trait MutationObserverLink: Send + Sync {
    fn observer_id(&self) -> EntityId;
    fn on_mutation_update(&self, action: MutationActionKind);
}

struct MutationInner<T, V, C> {
    options: MutationOptions<T, V, C>,
    state: MutationState<T, V, C>,
    observers: Vec<Arc<dyn MutationObserverLink>>,
    retryer: Option<RetryerHandle>,
    running: Option<MutationPromise<T>>,
}

/// One write and its lifecycle.
pub struct Mutation<T: QueryData, V: QueryData, C: QueryData = ()> {
    id: EntityId,
    mutation_key: Option<QueryKey>,
    inner: Mutex<MutationInner<T, V, C>>,
    cache: Weak<cache::MutationCacheShared>,
    client: WeakQueryClient,
    env: Environment,
    this: Weak<Self>,
}

impl<T: QueryData, V: QueryData, C: QueryData> fmt::Debug for Mutation<T, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Mutation")
            .field("id", &self.id)
            .field("mutation_key", &self.mutation_key)
            .field("status", &inner.state.status)
            .field("is_paused", &inner.state.is_paused)
            .finish_non_exhaustive()
    }
}

impl<T: QueryData, V: QueryData, C: QueryData> Mutation<T, V, C> {
    pub(crate) fn new(
        cache: Weak<cache::MutationCacheShared>,
        client: WeakQueryClient,
        env: Environment,
        options: MutationOptions<T, V, C>,
        state: Option<MutationState<T, V, C>>,
    ) -> Arc<Self> {
        let mutation = Arc::new_cyclic(|this| Self {
            id: EntityId::next(),
            mutation_key: options.mutation_key.clone(),
            inner: Mutex::new(MutationInner {
                options,
                state: state.unwrap_or_default(),
                observers: Vec::new(),
                retryer: None,
                running: None,
            }),
            cache,
            client,
            env,
            this: this.clone(),
        });
        mutation.schedule_gc();
        mutation
    }

    #[must_use]
    pub fn id(&self) -> EntityId {
        self.id
    }

    #[must_use]
    pub fn mutation_key(&self) -> Option<&QueryKey> {
        self.mutation_key.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> MutationState<T, V, C> {
        self.inner.lock().state.clone()
    }

    #[must_use]
    pub fn options(&self) -> MutationOptions<T, V, C> {
        self.inner.lock().options.clone()
    }

    pub fn set_options(&self, options: MutationOptions<T, V, C>) {
        self.inner.lock().options = options;
    }

    #[must_use]
    pub fn gc_time(&self) -> Duration {
        self.inner.lock().options.config.gc_time_or_default()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.inner.lock().observers.len()
    }

    /// Runs the mutation with `variables` and returns the outcome of the
    /// mutation function. The work runs on its own Tokio task, so dropping
    /// the returned future does not abandon it.
    pub async fn execute(&self, variables: V) -> Result<Arc<T>, QueryError> {
        self.start(Arc::new(variables)).await
    }

    pub(crate) fn start(&self, variables: Arc<V>) -> MutationPromise<T> {
        let Some(this) = self.this.upgrade() else {
            return rejected(QueryError::Cancelled(CancelledError::default()));
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(mutation_id = %self.id, "mutation started outside a Tokio runtime");
            return rejected(QueryError::FetchError(
                "no Tokio runtime available".to_string(),
            ));
        };
        let join = runtime.spawn(async move { this.run(variables).await });
        let promise = async move {
            join.await.unwrap_or_else(|error| {
                tracing::warn!(%error, "mutation task ended abnormally");
                Err(QueryError::Cancelled(CancelledError::default()))
            })
        }
        .boxed()
        .shared();
        self.inner.lock().running = Some(promise.clone());
        promise
    }

    async fn run(&self, variables: Arc<V>) -> Result<Arc<T>, QueryError> {
        let (options, restored) = {
            let inner = self.inner.lock();
            (
                inner.options.clone(),
                inner.state.status == MutationStatus::Pending,
            )
        };
        let Some(client) = self.client.upgrade() else {
            return Err(QueryError::Cancelled(CancelledError::default()));
        };

        let ctx = MutationFunctionContext {
            client,
            meta: options.meta.clone(),
            mutation_key: self.mutation_key.clone(),
        };
        let attempt: Attempt<T> = match options.mutation_fn.clone() {
            Some(mutation_fn) => {
                let variables = variables.clone();
                Box::new(move || mutation_fn.call(variables.clone(), ctx.clone()))
            }
            None => Box::new(|| async { Err(QueryError::MissingMutationFn) }.boxed()),
        };

        let (on_fail, on_pause, on_continue, can_run) = (
            self.this.clone(),
            self.this.clone(),
            self.this.clone(),
            self.this.clone(),
        );
        let (retryer, handle) = Retryer::new(RetryerConfig {
            attempt,
            on_fail: Box::new(move |failure_count, error| {
                if let Some(mutation) = on_fail.upgrade() {
                    mutation.dispatch(MutationAction::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            }),
            on_pause: Box::new(move || {
                if let Some(mutation) = on_pause.upgrade() {
                    mutation.dispatch(MutationAction::Pause);
                }
            }),
            on_continue: Box::new(move || {
                if let Some(mutation) = on_continue.upgrade() {
                    mutation.dispatch(MutationAction::Continue);
                }
            }),
            retry: options.config.retry.clone().unwrap_or_default(),
            retry_delay: options.config.retry_delay.clone().unwrap_or_default(),
            network_mode: options.config.network_mode.unwrap_or_default(),
            can_run: Arc::new(move || {
                can_run
                    .upgrade()
                    .is_none_or(|mutation| mutation.cache().is_none_or(|c| c.can_run(&*mutation)))
            }),
            focus: self.env.focus.clone(),
            online: self.env.online.clone(),
            abort: None,
        });
        self.inner.lock().retryer = Some(handle.clone());

        let outcome = self
            .run_pipeline(&options, &variables, restored, retryer, &handle)
            .await;
        if let Some(cache) = self.cache() {
            cache.run_next(self);
        }
        outcome
    }

    async fn run_pipeline(
        &self,
        options: &MutationOptions<T, V, C>,
        variables: &Arc<V>,
        restored: bool,
        retryer: Retryer<T>,
        handle: &RetryerHandle,
    ) -> Result<Arc<T>, QueryError> {
        let cache = self.cache();
        let executed = async {
            if restored {
                self.dispatch(MutationAction::Continue);
            } else {
                let is_paused = !handle.can_start();
                self.dispatch(MutationAction::Pending {
                    variables: variables.clone(),
                    context: None,
                    is_paused,
                });
                if let Some(cache) = &cache {
                    cache.on_mutate(self).await;
                }
                if let Some(on_mutate) = &options.on_mutate
                    && let Some(context) = on_mutate(variables.clone()).await?
                {
                    self.dispatch(MutationAction::Pending {
                        variables: variables.clone(),
                        context: Some(Arc::new(context)),
                        is_paused,
                    });
                }
            }
            tracing::debug!(mutation_id = %self.id, "mutation started");
            retryer.run().await.map(Arc::new)
        }
        .await;

        let context = self.inner.lock().state.context.clone();
        match executed {
            Ok(data) => {
                if let Some(cache) = &cache {
                    cache.on_success(data.as_ref() as &(dyn Any + Send + Sync), self).await;
                }
                if let Some(on_success) = &options.on_success {
                    warn_callback(
                        "on_success",
                        on_success(data.clone(), variables.clone(), context.clone()).await,
                    );
                }
                if let Some(cache) = &cache {
                    cache
                        .on_settled(Some(data.as_ref() as &(dyn Any + Send + Sync)), None, self)
                        .await;
                }
                if let Some(on_settled) = &options.on_settled {
                    warn_callback(
                        "on_settled",
                        on_settled(Some(data.clone()), None, variables.clone(), context).await,
                    );
                }
                self.dispatch(MutationAction::Success { data: data.clone() });
                tracing::debug!(mutation_id = %self.id, "mutation succeeded");
                Ok(data)
            }
            Err(error) => {
                if let Some(cache) = &cache {
                    cache.on_error(&error, self).await;
                }
                if let Some(on_error) = &options.on_error {
                    warn_callback(
                        "on_error",
                        on_error(error.clone(), variables.clone(), context.clone()).await,
                    );
                }
                if let Some(cache) = &cache {
                    cache.on_settled(None, Some(&error), self).await;
                }
                if let Some(on_settled) = &options.on_settled {
                    warn_callback(
                        "on_settled",
                        on_settled(None, Some(error.clone()), variables.clone(), context).await,
                    );
                }
                self.dispatch(MutationAction::Error {
                    error: error.clone(),
                });
                tracing::debug!(mutation_id = %self.id, %error, "mutation failed");
                Err(error)
            }
        }
    }

    pub(crate) fn add_observer(&self, observer: Arc<dyn MutationObserverLink>) {
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
            self.notify_cache(|mutation| MutationCacheEvent::ObserverAdded {
                mutation,
                observer: observer_id,
            });
        }
    }

    pub(crate) fn remove_observer(&self, observer_id: EntityId) {
        let removed = {
            let mut inner = self.inner.lock();
            let before = inner.observers.len();
            inner.observers.retain(|o| o.observer_id() != observer_id);
            inner.observers.len() != before
        };
        if removed {
            self.schedule_gc();
            self.notify_cache(|mutation| MutationCacheEvent::ObserverRemoved {
                mutation,
                observer: observer_id,
            });
        }
    }

    pub(crate) fn notify_observer_options_updated(&self, observer_id: EntityId) {
        self.notify_cache(|mutation| MutationCacheEvent::ObserverOptionsUpdated {
            mutation,
            observer: observer_id,
        });
    }

    fn schedule_gc(&self) {
        let weak = self.this.clone();
        self.env.gc.track(
            self.id,
            self.gc_time(),
            Arc::new(move || {
                if let Some(mutation) = weak.upgrade() {
                    mutation.optional_remove();
                }
            }),
        );
    }

    fn optional_remove(&self) {
        let (unobserved, pending) = {
            let inner = self.inner.lock();
            (
                inner.observers.is_empty(),
                inner.state.status == MutationStatus::Pending,
            )
        };
        if !unobserved {
            return;
        }
        if pending {
            self.schedule_gc();
        } else if let Some(cache) = self.cache() {
            tracing::debug!(mutation_id = %self.id, "evicting settled mutation");
            cache.remove(self);
        }
    }

    fn cache(&self) -> Option<MutationCache> {
        self.cache.upgrade().map(MutationCache::from_shared)
    }

    fn erased(&self) -> Option<Arc<dyn AnyMutation>> {
        self.this
            .upgrade()
            .map(|mutation| mutation as Arc<dyn AnyMutation>)
    }

    fn notify_cache(&self, event: impl FnOnce(Arc<dyn AnyMutation>) -> MutationCacheEvent) {
        if let (Some(cache), Some(mutation)) = (self.cache(), self.erased()) {
            cache.notify(&event(mutation));
        }
    }

    fn dispatch(&self, action: MutationAction<T, V, C>) {
        let kind = action.kind();
        let observers = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.state = reduce(&inner.state, action);
            inner.observers.clone()
        };
        self.env.notify.batch(|| {
            for observer in &observers {
                observer.on_mutation_update(kind);
            }
            self.notify_cache(|mutation| MutationCacheEvent::Updated {
                mutation,
                action: kind,
            });
        });
    }

    /// Serializable copy of the current state.
    pub fn dehydrate(&self) -> Result<DehydratedMutation, serde_json::Error> {
        let inner = self.inner.lock();
        Ok(DehydratedMutation {
            mutation_key: self.mutation_key.clone(),
            state: DehydratedMutationState::from_state(&inner.state)?,
            meta: inner.options.meta.clone(),
            scope: inner.options.config.scope.clone(),
        })
    }
}

fn rejected<T: Send + Sync + 'static>(error: QueryError) -> MutationPromise<T> {
    async move { Err(error) }.boxed().shared()
}

fn warn_callback(name: &'static str, result: Result<(), QueryError>) {
    if let Err(error) = result {
        tracing::warn!(callback = name, %error, "mutation callback failed");
    }
}

/// Type-erased view of a mutation, used by the cache and filters.
pub trait AnyMutation: Send + Sync {
    fn id(&self) -> EntityId;
    fn mutation_key(&self) -> Option<&QueryKey>;
    fn status(&self) -> MutationStatus;
    fn is_paused(&self) -> bool;
    fn scope(&self) -> Option<MutationScope>;
    fn meta(&self) -> Option<Value>;
    fn observer_count(&self) -> usize;
    fn submitted_at(&self) -> u64;
    /// Resumes a paused mutation, or re-runs a restored one with its
    /// stored variables. Completes when the mutation settles.
    fn continue_mutation(&self) -> BoxFuture<'static, ()>;
    fn dehydrate(&self) -> Result<DehydratedMutation, serde_json::Error>;
    fn destroy(&self);
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: QueryData, V: QueryData, C: QueryData> AnyMutation for Mutation<T, V, C> {
    fn id(&self) -> EntityId {
        self.id
    }

    fn mutation_key(&self) -> Option<&QueryKey> {
        self.mutation_key.as_ref()
    }

    fn status(&self) -> MutationStatus {
        self.inner.lock().state.status
    }

    fn is_paused(&self) -> bool {
        self.inner.lock().state.is_paused
    }

    fn scope(&self) -> Option<MutationScope> {
        self.inner.lock().options.config.scope.clone()
    }

    fn meta(&self) -> Option<Value> {
        self.inner.lock().options.meta.clone()
    }

    fn observer_count(&self) -> usize {
        Self::observer_count(self)
    }

    fn submitted_at(&self) -> u64 {
        self.inner.lock().state.submitted_at
    }

    fn continue_mutation(&self) -> BoxFuture<'static, ()> {
        let (retryer, running, variables) = {
            let inner = self.inner.lock();
            (
                inner.retryer.clone(),
                inner.running.clone(),
                inner.state.variables.clone(),
            )
        };
        if let Some(retryer) = retryer {
            retryer.resume();
            return match running {
                Some(running) => running.map(|_| ()).boxed(),
                None => async {}.boxed(),
            };
        }
        match variables {
            Some(variables) => self.start(variables).map(|_| ()).boxed(),
            None => async {}.boxed(),
        }
    }

    fn dehydrate(&self) -> Result<DehydratedMutation, serde_json::Error> {
        Self::dehydrate(self)
    }

    fn destroy(&self) {
        self.env.gc.untrack(self.id);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Recovers the typed mutation behind a type-erased one.
#[must_use]
pub fn downcast_mutation<T: QueryData, V: QueryData, C: QueryData>(
    mutation: &Arc<dyn AnyMutation>,
) -> Option<Arc<Mutation<T, V, C>>> {
    mutation
        .clone()
        .into_any()
        .downcast::<Mutation<T, V, C>>()
        .ok()
}
