//! Per-subscriber view of the latest mutation started through it.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::{
    MutateOptions, Mutation, MutationActionKind, MutationObserverLink, MutationOptions, MutationState,
    MutationStatus,
};
use crate::client::QueryClient;
use crate::error::QueryError;
use crate::gc::EntityId;
use crate::key::QueryKey;
use crate::notify::ListenerKey;
use crate::query::QueryData;
use crate::subscription::{Listeners, Unsubscribe};

/// What a [`MutationObserver`] reports to its listeners.
#[derive(Debug)]
pub struct MutationObserverResult<T, V, C = ()> {
    pub data: Option<Arc<T>>,
    pub error: Option<QueryError>,
    pub variables: Option<Arc<V>>,
    pub context: Option<Arc<C>>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub is_paused: bool,
    pub status: MutationStatus,
    pub submitted_at: u64,
}

impl<T, V, C> Clone for MutationObserverResult<T, V, C> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            error: self.error.clone(),
            variables: self.variables.clone(),
            context: self.context.clone(),
            failure_count: self.failure_count,
            failure_reason: self.failure_reason.clone(),
            is_paused: self.is_paused,
            status: self.status,
            submitted_at: self.submitted_at,
        }
    }
}

impl<T, V, C> From<MutationState<T, V, C>> for MutationObserverResult<T, V, C> {
    fn from(state: MutationState<T, V, C>) -> Self {
        Self {
            data: state.data,
            error: state.error,
            variables: state.variables,
            context: state.context,
            failure_count: state.failure_count,
            failure_reason: state.failure_reason,
            is_paused: state.is_paused,
            status: state.status,
            submitted_at: state.submitted_at,
        }
    }
}

impl<T, V, C> MutationObserverResult<T, V, C> {
    fn idle() -> Self {
        MutationState::default().into()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

type ResultListener<T, V, C> = dyn Fn(&MutationObserverResult<T, V, C>) + Send + Sync;

struct ObserverState<T: QueryData, V: QueryData, C: QueryData> {
    options: MutationOptions<T, V, C>,
    mutation: Option<Arc<Mutation<T, V, C>>>,
    mutate_options: Option<MutateOptions<T, V, C>>,
    result: MutationObserverResult<T, V, C>,
}

struct ObserverShared<T: QueryData, V: QueryData, C: QueryData> {
    id: EntityId,
    listener_key: ListenerKey,
    client: QueryClient,
    state: Mutex<ObserverState<T, V, C>>,
    listeners: Listeners<ResultListener<T, V, C>>,
    this: Weak<Self>,
}

/// Starts mutations and reports the state of the latest one.
///
/// Cheap to clone; clones share listeners and state.
pub struct MutationObserver<T: QueryData, V: QueryData, C: QueryData = ()> {
    inner: Arc<ObserverShared<T, V, C>>,
}

impl<T: QueryData, V: QueryData, C: QueryData> Clone for MutationObserver<T, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: QueryData, V: QueryData, C: QueryData> fmt::Debug for MutationObserver<T, V, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationObserver")
            .field("id", &self.inner.id)
            .field("status", &self.inner.state.lock().result.status)
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl<T: QueryData, V: QueryData, C: QueryData> MutationObserver<T, V, C> {
    pub fn new(client: &QueryClient, options: MutationOptions<T, V, C>) -> Self {
        let inner = Arc::new_cyclic(|this| ObserverShared {
            id: EntityId::next(),
            listener_key: ListenerKey::next(),
            client: client.clone(),
            state: Mutex::new(ObserverState {
                options: client.default_mutation_options(options),
                mutation: None,
                mutate_options: None,
                result: MutationObserverResult::idle(),
            }),
            listeners: Listeners::default(),
            this: this.clone(),
        });
        Self { inner }
    }

    #[must_use]
    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    /// Subscribes to result changes. The last listener to leave detaches
    /// the observer from its mutation so it can be collected.
    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult<T, V, C>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let (key, _) = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade()
                && inner.listeners.remove(key) == Some(0)
            {
                inner.detach();
            }
        })
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    /// Replaces the options. A different mutation key resets the
    /// observer.
    pub fn set_options(&self, options: MutationOptions<T, V, C>) {
        let options = self.inner.client.default_mutation_options(options);
        let (mutation, key_changed) = {
            let mut state = self.inner.state.lock();
            let prev = std::mem::replace(&mut state.options, options.clone());
            let key_changed = prev.mutation_key.as_ref().map(QueryKey::hash)
                != options.mutation_key.as_ref().map(QueryKey::hash);
            (state.mutation.clone(), key_changed)
        };
        let Some(mutation) = mutation else {
            return;
        };
        if key_changed {
            self.reset();
        } else {
            mutation.set_options(options);
            mutation.notify_observer_options_updated(self.inner.id);
        }
    }

    #[must_use]
    pub fn get_current_result(&self) -> MutationObserverResult<T, V, C> {
        self.inner.state.lock().result.clone()
    }

    /// Forgets the current mutation and goes back to idle.
    pub fn reset(&self) {
        let mutation = {
            let mut state = self.inner.state.lock();
            state.mutate_options = None;
            state.mutation.take()
        };
        if let Some(mutation) = mutation {
            mutation.remove_observer(self.inner.id);
        }
        self.inner.update_result();
        self.inner.notify(None);
    }

    /// Runs a new mutation with `variables` and waits for its outcome.
    pub async fn mutate_async(
        &self,
        variables: V,
        mutate_options: MutateOptions<T, V, C>,
    ) -> Result<Arc<T>, QueryError> {
        let client = &self.inner.client;
        let (options, previous) = {
            let mut state = self.inner.state.lock();
            state.mutate_options = Some(mutate_options);
            (state.options.clone(), state.mutation.take())
        };
        if let Some(previous) = previous {
            previous.remove_observer(self.inner.id);
        }
        let mutation = client.get_mutation_cache().build(client, options, None);
        self.inner.state.lock().mutation = Some(mutation.clone());
        if let Some(link) = self.inner.link() {
            mutation.add_observer(link);
        }
        mutation.start(Arc::new(variables)).await
    }

    /// Like [`MutationObserver::mutate_async`], without waiting. Errors
    /// are reported through the result and the per-call callbacks.
    pub fn mutate(&self, variables: V, mutate_options: MutateOptions<T, V, C>) {
        let observer = self.clone();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(observer_id = %self.inner.id, "mutate called outside a Tokio runtime");
            return;
        };
        runtime.spawn(async move {
            if let Err(error) = observer.mutate_async(variables, mutate_options).await {
                tracing::debug!(%error, "mutation rejected");
            }
        });
    }

    /// Whether an error boundary should receive the current error.
    #[must_use]
    pub fn should_throw(&self) -> bool {
        let state = self.inner.state.lock();
        state.result.is_error() && state.options.config.throw_on_error == Some(true)
    }
}

impl<T: QueryData, V: QueryData, C: QueryData> ObserverShared<T, V, C> {
    fn link(&self) -> Option<Arc<dyn MutationObserverLink>> {
        self.this
            .upgrade()
            .map(|this| this as Arc<dyn MutationObserverLink>)
    }

    fn detach(&self) {
        let mutation = self.state.lock().mutation.clone();
        if let Some(mutation) = mutation {
            mutation.remove_observer(self.id);
        }
    }

    fn update_result(&self) {
        let mut state = self.state.lock();
        state.result = state
            .mutation
            .as_ref()
            .map_or_else(MutationObserverResult::idle, |m| m.state().into());
    }

    fn notify(&self, action: Option<MutationActionKind>) {
        let (result, mutate_options) = {
            let state = self.state.lock();
            (state.result.clone(), state.mutate_options.clone())
        };
        let listeners = self.listeners.snapshot();
        let callbacks = mutate_options.filter(|_| !listeners.is_empty());
        let notify = self.client.notify_manager();
        notify.batch(|| {
            notify.schedule_for(self.listener_key, move || {
                if let Some(callbacks) = callbacks {
                    run_mutate_callbacks(&callbacks, &result, action);
                }
                for (_, listener) in listeners {
                    listener(&result);
                }
            });
        });
    }
}

fn run_mutate_callbacks<T, V, C>(
    callbacks: &MutateOptions<T, V, C>,
    result: &MutationObserverResult<T, V, C>,
    action: Option<MutationActionKind>,
) {
    let Some(variables) = result.variables.as_deref() else {
        return;
    };
    let context = result.context.as_deref();
    match action {
        Some(MutationActionKind::Success) => {
            if let Some(data) = result.data.as_deref() {
                if let Some(on_success) = &callbacks.on_success {
                    on_success(data, variables, context);
                }
                if let Some(on_settled) = &callbacks.on_settled {
                    on_settled(Some(data), None, variables, context);
                }
            }
        }
        Some(MutationActionKind::Error) => {
            if let Some(error) = &result.error {
                if let Some(on_error) = &callbacks.on_error {
                    on_error(error, variables, context);
                }
                if let Some(on_settled) = &callbacks.on_settled {
                    on_settled(None, Some(error), variables, context);
                }
            }
        }
        _ => {}
    }
}

impl<T: QueryData, V: QueryData, C: QueryData> MutationObserverLink for ObserverShared<T, V, C> {
    fn observer_id(&self) -> EntityId {
        self.id
    }

    fn on_mutation_update(&self, action: MutationActionKind) {
        self.update_result();
        self.notify(Some(action));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::MutationFilters;
    use std::time::Duration;

    fn doubling() -> MutationOptions<u32, u32> {
        MutationOptions::new(|n: Arc<u32>, _| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if *n == 0 {
                Err(QueryError::FetchError("zero".to_string()))
            } else {
                Ok(*n * 2)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_listener_sees_pending_then_success() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(&client, doubling());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _unsubscribe = observer.subscribe(move |result| s.lock().push(result.status));

        let data = observer
            .mutate_async(4, MutateOptions::new())
            .await
            .expect("mutation succeeds");
        assert_eq!(*data, 8);
        assert_eq!(
            *seen.lock(),
            vec![MutationStatus::Pending, MutationStatus::Success]
        );
        let result = observer.get_current_result();
        assert!(result.is_success());
        assert_eq!(result.variables.as_deref(), Some(&4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_callbacks_fire_only_for_latest_call() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(&client, doubling());
        let _unsubscribe = observer.subscribe(|_| {});
        let calls = Arc::new(Mutex::new(Vec::new()));

        let (a, b) = (calls.clone(), calls.clone());
        let first = observer.mutate_async(
            1,
            MutateOptions::new().on_success(move |data: &u32, _: &u32, _: Option<&()>| {
                a.lock().push(format!("first {data}"));
            }),
        );
        let second = observer.mutate_async(
            2,
            MutateOptions::new().on_success(move |data: &u32, _: &u32, _: Option<&()>| {
                b.lock().push(format!("second {data}"));
            }),
        );
        let (first, second) = tokio::join!(first, second);
        assert_eq!(*first.expect("first succeeds"), 2);
        assert_eq!(*second.expect("second succeeds"), 4);
        assert_eq!(*calls.lock(), vec!["second 4".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_reaches_result_and_callbacks() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(&client, doubling());
        let _unsubscribe = observer.subscribe(|_| {});
        let settled = Arc::new(Mutex::new(None));
        let s = settled.clone();

        let error = observer
            .mutate_async(
                0,
                MutateOptions::new().on_settled(
                    move |data: Option<&u32>, error: Option<&QueryError>, _: &u32, _: Option<&()>| {
                        *s.lock() = Some((data.copied(), error.cloned()));
                    },
                ),
            )
            .await
            .expect_err("zero fails");
        assert_eq!(error, QueryError::FetchError("zero".to_string()));
        assert!(observer.get_current_result().is_error());
        assert_eq!(*settled.lock(), Some((None, Some(error))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_returns_to_idle() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(&client, doubling());
        observer
            .mutate_async(3, MutateOptions::new())
            .await
            .expect("mutation succeeds");
        assert!(observer.get_current_result().is_success());

        observer.reset();
        let result = observer.get_current_result();
        assert!(result.is_idle());
        assert!(result.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_fire_and_forget() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(&client, doubling());
        observer.mutate(5, MutateOptions::new());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.get_current_result().data.as_deref(), Some(&10));
        assert_eq!(client.is_mutating(&MutationFilters::new()), 0);
    }
}
