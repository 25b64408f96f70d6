//! Listener registries and environment signals.
//!
//! [`Listeners`] is the subscriber set every engine component builds on.
//! [`focus`] and [`online`] hold the process-environment managers; each is
//! an explicitly constructed object whose real event source is installed
//! by the first subscriber and removed by the last.

pub mod focus;
pub mod mock;
pub mod online;

use std::fmt;
use std::sync::{Arc, Weak};

use futures::StreamExt;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::notify::ListenerKey;

/// Handle for a running event-source task
pub struct Handle {
    token: CancellationToken,
}

impl Handle {
    /// Spawns `task` on the current runtime, stopping it early once the
    /// handle is stopped. Returns `None` outside a Tokio runtime.
    pub(crate) fn spawn(task: impl Future<Output = ()> + Send + 'static) -> Option<Self> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let token = CancellationToken::new();
        let child = token.clone();
        runtime.spawn(async move {
            tokio::select! {
                () = child.cancelled() => {}
                () = task => {}
            }
        });
        Some(Self { token })
    }

    /// Signal the task to stop without waiting for it.
    pub fn stop(&self) {
        self.token.cancel();
    }
}

/// Removes a listener when called or dropped. Idempotent.
#[must_use = "dropping an Unsubscribe immediately removes the listener"]
pub struct Unsubscribe {
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    pub(crate) fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Mutex::new(Some(Box::new(remove))),
        }
    }

    /// Removes the listener. Subsequent calls do nothing.
    pub fn unsubscribe(&self) {
        let remove = self.remove.lock().take();
        if let Some(remove) = remove {
            remove();
        }
    }

    /// Keeps the listener registered for the lifetime of its owner.
    pub fn forget(self) {
        self.remove.lock().take();
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.remove.lock().is_some())
            .finish()
    }
}

/// An ordered set of listeners.
pub(crate) struct Listeners<F: ?Sized> {
    entries: Mutex<Vec<(ListenerKey, Arc<F>)>>,
}

impl<F: ?Sized> Default for Listeners<F> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<F: ?Sized> Listeners<F> {
    /// Adds a listener, returning its key and the new listener count.
    pub fn add(&self, listener: Arc<F>) -> (ListenerKey, usize) {
        let key = ListenerKey::next();
        let mut entries = self.entries.lock();
        entries.push((key, listener));
        (key, entries.len())
    }

    /// Removes a listener, returning the remaining count if it was present.
    pub fn remove(&self, key: ListenerKey) -> Option<usize> {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(k, _)| *k != key);
        (entries.len() != before).then_some(entries.len())
    }

    pub fn snapshot(&self) -> Vec<(ListenerKey, Arc<F>)> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Callback handed to an event source; call it with the new signal value.
pub type SignalSetter = Arc<dyn Fn(bool) + Send + Sync>;

/// Tears down an installed event source.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Installs an event source and returns its cleanup.
pub type EventSetup = Arc<dyn Fn(SignalSetter) -> Cleanup + Send + Sync>;

type SignalListener = dyn Fn(bool) + Send + Sync;

/// Shared machinery of the focus and online managers.
pub(crate) struct EnvironmentSignal {
    name: &'static str,
    value: Mutex<Option<bool>>,
    fallback: bool,
    listeners: Listeners<SignalListener>,
    setup: Mutex<Option<EventSetup>>,
    cleanup: Mutex<Option<Cleanup>>,
}

impl EnvironmentSignal {
    pub fn new(name: &'static str, fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            value: Mutex::new(None),
            fallback,
            listeners: Listeners::default(),
            setup: Mutex::new(None),
            cleanup: Mutex::new(None),
        })
    }

    pub fn get(&self) -> bool {
        self.value.lock().unwrap_or(self.fallback)
    }

    /// Stores a new value; returns `true` if the raw stored value changed.
    pub fn set(&self, value: Option<bool>) -> bool {
        let mut current = self.value.lock();
        if *current == value {
            return false;
        }
        *current = value;
        true
    }

    pub fn emit(&self, value: bool) {
        for (_, listener) in self.listeners.snapshot() {
            listener(value);
        }
    }

    pub fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(bool) + Send + Sync + 'static,
        on_change: fn(&Arc<Self>, bool),
    ) -> Unsubscribe {
        let (key, count) = self.listeners.add(Arc::new(listener));
        if count == 1 && self.cleanup.lock().is_none() {
            self.install(on_change);
        }
        let weak = Arc::downgrade(self);
        Unsubscribe::new(move || {
            if let Some(signal) = weak.upgrade()
                && signal.listeners.remove(key) == Some(0)
            {
                signal.uninstall();
            }
        })
    }

    pub fn set_event_listener(self: &Arc<Self>, setup: EventSetup, on_change: fn(&Arc<Self>, bool)) {
        *self.setup.lock() = Some(setup);
        self.uninstall();
        if !self.listeners.is_empty() {
            self.install(on_change);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_installed(&self) -> bool {
        self.cleanup.lock().is_some()
    }

    fn install(self: &Arc<Self>, on_change: fn(&Arc<Self>, bool)) {
        let Some(setup) = self.setup.lock().clone() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let setter: SignalSetter = Arc::new(move |value| {
            if let Some(signal) = weak.upgrade() {
                on_change(&signal, value);
            }
        });
        tracing::debug!(signal = self.name, "installing environment event source");
        let cleanup = setup(setter);
        *self.cleanup.lock() = Some(cleanup);
    }

    fn uninstall(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            tracing::debug!(signal = self.name, "removing environment event source");
            cleanup();
        }
    }
}

/// Builds an [`EventSetup`] that forwards every item of a stream to the
/// signal. The stream runs as a Tokio task until cleanup.
pub(crate) fn stream_setup<F>(name: &'static str, make_stream: F) -> EventSetup
where
    F: Fn() -> BoxStream<'static, bool> + Send + Sync + 'static,
{
    Arc::new(move |setter: SignalSetter| -> Cleanup {
        let mut stream = make_stream();
        let handle = Handle::spawn(async move {
            while let Some(value) = stream.next().await {
                setter(value);
            }
        });
        let Some(handle) = handle else {
            tracing::warn!(
                signal = name,
                "no Tokio runtime available, event stream not started"
            );
            return Box::new(|| {});
        };
        Box::new(move || handle.stop())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_listeners_add_remove() {
        let listeners: Listeners<dyn Fn() + Send + Sync> = Listeners::default();
        let (a, count) = listeners.add(Arc::new(|| {}));
        assert_eq!(count, 1);
        let (b, count) = listeners.add(Arc::new(|| {}));
        assert_eq!(count, 2);
        assert_eq!(listeners.remove(a), Some(1));
        assert_eq!(listeners.remove(a), None);
        assert_eq!(listeners.remove(b), Some(0));
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let unsubscribe = Unsubscribe::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        unsubscribe.unsubscribe();
        unsubscribe.unsubscribe();
        drop(unsubscribe);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_forget_keeps_listener() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        Unsubscribe::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .forget();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_handle_ends_its_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = ticks.clone();
        let handle = Handle::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                t.fetch_add(1, Ordering::SeqCst);
            }
        })
        .expect("inside a runtime");
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        handle.stop();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_spawn_outside_runtime_returns_none() {
        assert!(Handle::spawn(async {}).is_none());
    }
}
