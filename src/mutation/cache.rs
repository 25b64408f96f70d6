//! The mutation cache: every mutation of one client, in submission order.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;

use super::{AnyMutation, Mutation, MutationActionKind, MutationOptions, MutationState, MutationStatus};
use crate::client::{Environment, QueryClient};
use crate::error::QueryError;
use crate::filters::MutationFilters;
use crate::gc::EntityId;
use crate::query::QueryData;
use crate::subscription::{Listeners, Unsubscribe};

type MutateCallback = Arc<dyn Fn(&dyn AnyMutation) -> BoxFuture<'static, ()> + Send + Sync>;
type SuccessCallback =
    Arc<dyn Fn(&(dyn Any + Send + Sync), &dyn AnyMutation) -> BoxFuture<'static, ()> + Send + Sync>;
type ErrorCallback =
    Arc<dyn Fn(&QueryError, &dyn AnyMutation) -> BoxFuture<'static, ()> + Send + Sync>;
type SettledCallback = Arc<
    dyn Fn(Option<&(dyn Any + Send + Sync)>, Option<&QueryError>, &dyn AnyMutation) -> BoxFuture<'static, ()>
        + Send
        + Sync,
>;

/// Cache-wide callbacks. Each one is awaited before the mutation's own
/// callback of the same stage.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    pub on_mutate: Option<MutateCallback>,
    pub on_success: Option<SuccessCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_settled: Option<SettledCallback>,
}

impl fmt::Debug for MutationCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCacheConfig")
            .field("on_mutate", &self.on_mutate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl MutationCacheConfig {
    #[must_use]
    pub fn on_mutate(
        mut self,
        f: impl Fn(&dyn AnyMutation) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.on_mutate = Some(Arc::new(f));
        self
    }

    /// `data` is the typed result; recover it with `downcast_ref`.
    #[must_use]
    pub fn on_success(
        mut self,
        f: impl Fn(&(dyn Any + Send + Sync), &dyn AnyMutation) -> BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(&QueryError, &dyn AnyMutation) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&(dyn Any + Send + Sync)>, Option<&QueryError>, &dyn AnyMutation) -> BoxFuture<'static, ()>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

/// Events emitted by the mutation cache.
#[derive(Clone)]
pub enum MutationCacheEvent {
    Added {
        mutation: Arc<dyn AnyMutation>,
    },
    Removed {
        mutation: Arc<dyn AnyMutation>,
    },
    Updated {
        mutation: Arc<dyn AnyMutation>,
        action: MutationActionKind,
    },
    ObserverAdded {
        mutation: Arc<dyn AnyMutation>,
        observer: EntityId,
    },
    ObserverRemoved {
        mutation: Arc<dyn AnyMutation>,
        observer: EntityId,
    },
    ObserverOptionsUpdated {
        mutation: Arc<dyn AnyMutation>,
        observer: EntityId,
    },
}

impl MutationCacheEvent {
    #[must_use]
    pub fn mutation(&self) -> &Arc<dyn AnyMutation> {
        match self {
            Self::Added { mutation }
            | Self::Removed { mutation }
            | Self::Updated { mutation, .. }
            | Self::ObserverAdded { mutation, .. }
            | Self::ObserverRemoved { mutation, .. }
            | Self::ObserverOptionsUpdated { mutation, .. } => mutation,
        }
    }
}

impl fmt::Debug for MutationCacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Added { .. } => "Added",
            Self::Removed { .. } => "Removed",
            Self::Updated { .. } => "Updated",
            Self::ObserverAdded { .. } => "ObserverAdded",
            Self::ObserverRemoved { .. } => "ObserverRemoved",
            Self::ObserverOptionsUpdated { .. } => "ObserverOptionsUpdated",
        };
        let mut s = f.debug_struct(name);
        s.field("mutation_id", &self.mutation().id());
        if let Self::Updated { action, .. } = self {
            s.field("action", action);
        }
        s.finish()
    }
}

type CacheListener = dyn Fn(&MutationCacheEvent) + Send + Sync;

#[derive(Default)]
struct Store {
    mutations: Vec<Arc<dyn AnyMutation>>,
    scopes: HashMap<String, Vec<Arc<dyn AnyMutation>>>,
}

pub(crate) struct MutationCacheShared {
    store: Mutex<Store>,
    listeners: Listeners<CacheListener>,
    config: MutationCacheConfig,
    env: Environment,
}

/// Holds every mutation of a client.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MutationCache {
    inner: Arc<MutationCacheShared>,
}

impl fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &self.len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl MutationCache {
    pub(crate) fn new(config: MutationCacheConfig, env: Environment) -> Self {
        Self {
            inner: Arc::new(MutationCacheShared {
                store: Mutex::new(Store::default()),
                listeners: Listeners::default(),
                config,
                env,
            }),
        }
    }

    pub(crate) const fn from_shared(inner: Arc<MutationCacheShared>) -> Self {
        Self { inner }
    }

    /// Creates a mutation with the client's defaults applied and adds it
    /// to the cache.
    pub fn build<T: QueryData, V: QueryData, C: QueryData>(
        &self,
        client: &QueryClient,
        options: MutationOptions<T, V, C>,
        state: Option<MutationState<T, V, C>>,
    ) -> Arc<Mutation<T, V, C>> {
        let options = client.default_mutation_options(options);
        let mutation = Mutation::new(
            Arc::downgrade(&self.inner),
            client.downgrade(),
            self.inner.env.clone(),
            options,
            state,
        );
        self.add(mutation.clone());
        mutation
    }

    pub(crate) fn add(&self, mutation: Arc<dyn AnyMutation>) {
        {
            let mut store = self.inner.store.lock();
            if let Some(scope) = mutation.scope() {
                store
                    .scopes
                    .entry(scope.id)
                    .or_default()
                    .push(mutation.clone());
            }
            store.mutations.push(mutation.clone());
        }
        self.notify(&MutationCacheEvent::Added { mutation });
    }

    /// Removes `mutation` and notifies listeners.
    pub fn remove(&self, mutation: &dyn AnyMutation) {
        let id = mutation.id();
        let removed = {
            let mut store = self.inner.store.lock();
            let removed = store
                .mutations
                .iter()
                .position(|m| m.id() == id)
                .map(|index| store.mutations.remove(index));
            if let Some(scope) = mutation.scope()
                && let Some(scoped) = store.scopes.get_mut(&scope.id)
            {
                scoped.retain(|m| m.id() != id);
                if scoped.is_empty() {
                    store.scopes.remove(&scope.id);
                }
            }
            removed
        };
        if let Some(mutation) = removed {
            mutation.destroy();
            self.notify(&MutationCacheEvent::Removed { mutation });
        }
    }

    /// Whether `mutation` may start: it is unscoped, or no earlier
    /// mutation of its scope is still pending.
    pub(crate) fn can_run(&self, mutation: &dyn AnyMutation) -> bool {
        let Some(scope) = mutation.scope() else {
            return true;
        };
        let store = self.inner.store.lock();
        store
            .scopes
            .get(&scope.id)
            .and_then(|scoped| {
                scoped
                    .iter()
                    .find(|m| m.status() == MutationStatus::Pending)
                    .map(|m| m.id())
            })
            .is_none_or(|first| first == mutation.id())
    }

    /// Starts the next paused mutation of `mutation`'s scope.
    pub(crate) fn run_next(&self, mutation: &dyn AnyMutation) {
        let Some(scope) = mutation.scope() else {
            return;
        };
        let next = {
            let store = self.inner.store.lock();
            store.scopes.get(&scope.id).and_then(|scoped| {
                scoped
                    .iter()
                    .find(|m| m.id() != mutation.id() && m.is_paused())
                    .cloned()
            })
        };
        if let Some(next) = next {
            tracing::debug!(scope = %scope.id, mutation_id = %next.id(), "running next scoped mutation");
            let resumed = next.continue_mutation();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(resumed);
            }
        }
    }

    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<dyn AnyMutation>> {
        self.inner.store.lock().mutations.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.store.lock().mutations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.store.lock().mutations.is_empty()
    }

    /// First mutation matching `filters`. A key filter always matches
    /// exactly here.
    #[must_use]
    pub fn find(&self, filters: &MutationFilters) -> Option<Arc<dyn AnyMutation>> {
        let filters = if filters.mutation_key.is_some() && !filters.exact {
            filters.clone().exact(true)
        } else {
            filters.clone()
        };
        self.get_all()
            .into_iter()
            .find(|m| filters.matches(m.as_ref()))
    }

    #[must_use]
    pub fn find_all(&self, filters: &MutationFilters) -> Vec<Arc<dyn AnyMutation>> {
        self.get_all()
            .into_iter()
            .filter(|m| filters.matches(m.as_ref()))
            .collect()
    }

    /// Removes every mutation.
    pub fn clear(&self) {
        let mutations = self.get_all();
        self.inner.env.notify.batch(|| {
            for mutation in mutations {
                self.remove(mutation.as_ref());
            }
        });
    }

    /// Subscribes to cache events.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let (key, _) = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(key);
            }
        })
    }

    pub(crate) fn notify(&self, event: &MutationCacheEvent) {
        let listeners = self.inner.listeners.snapshot();
        self.inner.env.notify.batch(|| {
            for (_, listener) in listeners {
                listener(event);
            }
        });
    }

    /// Continues every paused mutation and waits until they settle.
    pub fn resume_paused_mutations(&self) -> BoxFuture<'static, ()> {
        let paused: Vec<_> = self
            .get_all()
            .into_iter()
            .filter(|m| m.is_paused())
            .collect();
        if paused.is_empty() {
            return async {}.boxed();
        }
        tracing::debug!(count = paused.len(), "resuming paused mutations");
        let resumed: Vec<_> = paused.iter().map(|m| m.continue_mutation()).collect();
        join_all(resumed).map(|_| ()).boxed()
    }

    pub(crate) fn on_mutate(&self, mutation: &dyn AnyMutation) -> BoxFuture<'static, ()> {
        match &self.inner.config.on_mutate {
            Some(f) => f(mutation),
            None => async {}.boxed(),
        }
    }

    pub(crate) fn on_success(
        &self,
        data: &(dyn Any + Send + Sync),
        mutation: &dyn AnyMutation,
    ) -> BoxFuture<'static, ()> {
        match &self.inner.config.on_success {
            Some(f) => f(data, mutation),
            None => async {}.boxed(),
        }
    }

    pub(crate) fn on_error(
        &self,
        error: &QueryError,
        mutation: &dyn AnyMutation,
    ) -> BoxFuture<'static, ()> {
        match &self.inner.config.on_error {
            Some(f) => f(error, mutation),
            None => async {}.boxed(),
        }
    }

    pub(crate) fn on_settled(
        &self,
        data: Option<&(dyn Any + Send + Sync)>,
        error: Option<&QueryError>,
        mutation: &dyn AnyMutation,
    ) -> BoxFuture<'static, ()> {
        match &self.inner.config.on_settled {
            Some(f) => f(data, error, mutation),
            None => async {}.boxed(),
        }
    }
}
