//! Observing a dynamic list of queries of one type.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::observer::{QueryObserver, QueryObserverOptions, QueryObserverResult};
use super::{Query, QueryData};
use crate::client::QueryClient;
use crate::gc::EntityId;
use crate::notify::ListenerKey;
use crate::subscription::{Listeners, Unsubscribe};

/// Folds the per-query results into one value.
pub type Combine<S, R> = Arc<dyn Fn(&[QueryObserverResult<S>]) -> R + Send + Sync>;

type CombinedListener<R> = dyn Fn(&Arc<R>) + Send + Sync;

struct QueriesState<T: QueryData, S, R> {
    observers: Vec<QueryObserver<T, S>>,
    results: Vec<QueryObserverResult<S>>,
    combine: Combine<S, R>,
    combined: Arc<R>,
    subscriptions: HashMap<EntityId, Unsubscribe>,
}

struct QueriesShared<T: QueryData, S, R> {
    client: QueryClient,
    listener_key: ListenerKey,
    state: Mutex<QueriesState<T, S, R>>,
    listeners: Listeners<CombinedListener<R>>,
    this: Weak<Self>,
}

/// Keeps one [`QueryObserver`] per entry of a list of query options and
/// reports their results together.
///
/// Observers are matched to new options by query hash, so reordering or
/// extending the list keeps existing subscriptions alive.
pub struct QueriesObserver<T: QueryData, S = T, R = Vec<QueryObserverResult<S>>> {
    inner: Arc<QueriesShared<T, S, R>>,
}

impl<T: QueryData, S, R> Clone for QueriesObserver<T, S, R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: QueryData, S, R> fmt::Debug for QueriesObserver<T, S, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueriesObserver")
            .field("observers", &self.inner.state.lock().observers.len())
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl<T: QueryData, S: PartialEq + Send + Sync + 'static> QueriesObserver<T, S> {
    pub fn new(client: &QueryClient, queries: Vec<QueryObserverOptions<T, S>>) -> Self {
        Self::with_combine(client, queries, |results| results.to_vec())
    }
}

impl<T, S, R> QueriesObserver<T, S, R>
where
    T: QueryData,
    S: PartialEq + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub fn with_combine(
        client: &QueryClient,
        queries: Vec<QueryObserverOptions<T, S>>,
        combine: impl Fn(&[QueryObserverResult<S>]) -> R + Send + Sync + 'static,
    ) -> Self {
        let observers: Vec<_> = queries
            .into_iter()
            .map(|options| QueryObserver::with_options(client, options))
            .collect();
        let results: Vec<_> = observers.iter().map(QueryObserver::get_current_result).collect();
        let combine: Combine<S, R> = Arc::new(combine);
        let combined = Arc::new(combine(&results));
        let inner = Arc::new_cyclic(|this| QueriesShared {
            client: client.clone(),
            listener_key: ListenerKey::next(),
            state: Mutex::new(QueriesState {
                observers,
                results,
                combine,
                combined,
                subscriptions: HashMap::new(),
            }),
            listeners: Listeners::default(),
            this: this.clone(),
        });
        Self { inner }
    }

    /// Subscribes to the combined result. The first listener subscribes
    /// every child observer, the last one to leave detaches them.
    pub fn subscribe(&self, listener: impl Fn(&Arc<R>) + Send + Sync + 'static) -> Unsubscribe {
        let (key, count) = self.inner.listeners.add(Arc::new(listener));
        if count == 1 {
            let observers = self.inner.state.lock().observers.clone();
            for observer in &observers {
                self.inner.attach(observer);
            }
            self.inner.refresh();
        }
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade()
                && inner.listeners.remove(key) == Some(0)
            {
                inner.detach_all();
            }
        })
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    #[must_use]
    pub fn get_current_result(&self) -> Vec<QueryObserverResult<S>> {
        self.inner.state.lock().results.clone()
    }

    /// The combined result, recomputed only when a child result changed.
    #[must_use]
    pub fn get_combined_result(&self) -> Arc<R> {
        self.inner.state.lock().combined.clone()
    }

    #[must_use]
    pub fn get_queries(&self) -> Vec<Arc<Query<T>>> {
        self.get_observers()
            .iter()
            .map(QueryObserver::get_current_query)
            .collect()
    }

    #[must_use]
    pub fn get_observers(&self) -> Vec<QueryObserver<T, S>> {
        self.inner.state.lock().observers.clone()
    }

    /// Replaces the list of queries. Observers whose query hash appears in
    /// the new list are reused, the rest are destroyed.
    pub fn set_queries(&self, queries: Vec<QueryObserverOptions<T, S>>) {
        let client = &self.inner.client;
        let mut previous = self.get_observers();
        let mut next = Vec::with_capacity(queries.len());
        let mut reused = Vec::new();
        for mut options in queries {
            options.query = client.default_query_options(options.query);
            let hash = options.query.query_hash();
            let position = previous
                .iter()
                .position(|observer| observer.get_current_query().query_hash() == hash);
            let observer = match position {
                Some(index) => {
                    let observer = previous.remove(index);
                    reused.push((observer.clone(), options));
                    observer
                }
                None => QueryObserver::with_options(client, options),
            };
            next.push(observer);
        }

        for (observer, options) in reused {
            observer.set_options(options);
        }

        let mounted = self.has_listeners();
        let removed = {
            let mut state = self.inner.state.lock();
            state.observers = next.clone();
            previous
                .iter()
                .filter_map(|observer| state.subscriptions.remove(&observer.id()))
                .collect::<Vec<_>>()
        };
        drop(removed);
        for observer in &previous {
            observer.destroy();
        }
        if mounted {
            for observer in &next {
                self.inner.attach(observer);
            }
        }
        self.inner.refresh();
    }

    /// Detaches every child observer.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
        self.inner.detach_all();
    }
}

impl<T, S, R> QueriesShared<T, S, R>
where
    T: QueryData,
    S: PartialEq + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn attach(&self, observer: &QueryObserver<T, S>) {
        if self.state.lock().subscriptions.contains_key(&observer.id()) {
            return;
        }
        let weak = self.this.clone();
        let id = observer.id();
        let unsubscribe = observer.subscribe(move |result| {
            if let Some(queries) = weak.upgrade() {
                queries.on_update(id, result);
            }
        });
        let mut state = self.state.lock();
        if state.observers.iter().any(|o| o.id() == id) {
            state.subscriptions.insert(id, unsubscribe);
        } else {
            drop(state);
            unsubscribe.unsubscribe();
        }
    }

    fn detach_all(&self) {
        let (subscriptions, observers) = {
            let mut state = self.state.lock();
            let subscriptions: Vec<_> = state.subscriptions.drain().map(|(_, u)| u).collect();
            (subscriptions, state.observers.clone())
        };
        drop(subscriptions);
        for observer in observers {
            observer.destroy();
        }
    }

    fn on_update(&self, id: EntityId, result: &QueryObserverResult<S>) {
        let combined = {
            let mut state = self.state.lock();
            let Some(index) = state.observers.iter().position(|o| o.id() == id) else {
                return;
            };
            state.results[index] = result.clone();
            let combined = Arc::new((state.combine)(&state.results));
            state.combined = combined.clone();
            combined
        };
        self.notify(combined);
    }

    /// Re-reads every child result and notifies if anything changed.
    fn refresh(&self) {
        let observers = self.state.lock().observers.clone();
        let results: Vec<_> = observers.iter().map(QueryObserver::get_current_result).collect();
        let combined = {
            let mut state = self.state.lock();
            let unchanged = state.results.len() == results.len()
                && state
                    .results
                    .iter()
                    .zip(&results)
                    .all(|(a, b)| a.shallow_eq(b));
            if unchanged {
                return;
            }
            let combined = Arc::new((state.combine)(&results));
            state.results = results;
            state.combined = combined.clone();
            combined
        };
        self.notify(combined);
    }

    fn notify(&self, combined: Arc<R>) {
        if self.listeners.is_empty() {
            return;
        }
        let notify = self.client.notify_manager();
        let listeners = self.listeners.snapshot();
        notify.batch(|| {
            notify.schedule_for(self.listener_key, move || {
                for (_, listener) in listeners {
                    listener(&combined);
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{QueryFunctionContext, QueryOptions};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn options(id: u32, calls: &Arc<AtomicU32>) -> QueryObserverOptions<u32> {
        let calls = calls.clone();
        QueryObserverOptions::new(QueryOptions::new(
            json!(["item", id]),
            move |_: QueryFunctionContext| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Ok(id * 10) }
            },
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_follow_each_query() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let observer = QueriesObserver::new(&client, vec![options(1, &calls), options(2, &calls)]);
        let _unsubscribe = observer.subscribe(|_| {});
        settle().await;

        let results = observer.get_current_result();
        let data: Vec<_> = results.iter().map(|r| r.data.as_deref().copied()).collect();
        assert_eq!(data, vec![Some(10), Some(20)]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_queries_reuses_observers_by_hash() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let observer = QueriesObserver::new(&client, vec![options(1, &calls), options(2, &calls)]);
        let _unsubscribe = observer.subscribe(|_| {});
        settle().await;
        let kept = observer.get_observers()[1].id();
        let dropped_query = observer.get_queries()[0].clone();

        observer.set_queries(vec![
            options(2, &calls).config(|c| c.stale_time(crate::StaleTime::INFINITE)),
            options(3, &calls),
        ]);
        settle().await;

        assert_eq!(observer.get_observers()[0].id(), kept);
        assert_eq!(dropped_query.observer_count(), 0);
        let data: Vec<_> = observer
            .get_current_result()
            .iter()
            .map(|r| r.data.as_deref().copied())
            .collect();
        assert_eq!(data, vec![Some(20), Some(30)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_combine_folds_results() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let observer = QueriesObserver::with_combine(
            &client,
            vec![options(1, &calls), options(2, &calls)],
            |results| results.iter().filter_map(|r| r.data.as_deref()).sum::<u32>(),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _unsubscribe = observer.subscribe(move |total| s.lock().push(**total));
        settle().await;

        assert_eq!(*observer.get_combined_result(), 30);
        assert_eq!(seen.lock().last(), Some(&30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_detaches_children() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let observer = QueriesObserver::new(&client, vec![options(1, &calls)]);
        let unsubscribe = observer.subscribe(|_| {});
        settle().await;
        let query = observer.get_queries()[0].clone();
        assert_eq!(query.observer_count(), 1);

        unsubscribe.unsubscribe();
        assert_eq!(query.observer_count(), 0);
    }
}
