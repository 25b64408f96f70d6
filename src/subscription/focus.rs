//! Window-focus signal.
//!
//! There is no window in a plain process, so the manager reports focused
//! until told otherwise, either directly through
//! [`FocusManager::set_focused`] or through an installed event source.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;

use super::{Cleanup, EnvironmentSignal, SignalSetter, Unsubscribe, stream_setup};

/// Tracks whether the application is focused and notifies subscribers.
///
/// Cheap to clone; clones share state. Each [`crate::QueryClient`] owns
/// one unless a shared manager is injected.
#[derive(Clone)]
pub struct FocusManager {
    signal: Arc<EnvironmentSignal>,
}

impl fmt::Debug for FocusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusManager")
            .field("focused", &self.is_focused())
            .field("listeners", &self.signal.listener_count())
            .finish()
    }
}

impl Default for FocusManager {
    fn default() -> Self {
        Self::new()
    }
}

fn on_change(signal: &Arc<EnvironmentSignal>, focused: bool) {
    if signal.set(Some(focused)) {
        signal.emit(signal.get());
    }
}

impl FocusManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: EnvironmentSignal::new("focus", true),
        }
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.signal.get()
    }

    /// Overrides the focus state. `None` returns to the default (focused).
    pub fn set_focused(&self, focused: Option<bool>) {
        if self.signal.set(focused) {
            self.on_focus();
        }
    }

    /// Notifies every subscriber of the current focus state.
    pub fn on_focus(&self) {
        self.signal.emit(self.is_focused());
    }

    /// Subscribes to focus changes. The first subscriber installs the event
    /// source, the last one to leave removes it.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Unsubscribe {
        self.signal.subscribe(listener, on_change)
    }

    /// Replaces the event source. `setup` receives a setter and returns a
    /// cleanup closure.
    pub fn set_event_listener(
        &self,
        setup: impl Fn(SignalSetter) -> Cleanup + Send + Sync + 'static,
    ) {
        self.signal.set_event_listener(Arc::new(setup), on_change);
    }

    /// Uses a stream of focus states as the event source.
    pub fn set_event_stream(
        &self,
        make_stream: impl Fn() -> BoxStream<'static, bool> + Send + Sync + 'static,
    ) {
        self.signal
            .set_event_listener(stream_setup("focus", make_stream), on_change);
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.signal.listener_count() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_focused_by_default() {
        assert!(FocusManager::new().is_focused());
    }

    #[test]
    fn test_set_focused_notifies_on_change_only() {
        let manager = FocusManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _unsubscribe = manager.subscribe(move |focused| s.lock().push(focused));

        manager.set_focused(Some(false));
        manager.set_focused(Some(false));
        manager.set_focused(None);

        assert_eq!(*seen.lock(), vec![false, true]);
    }

    #[test]
    fn test_event_listener_is_reference_counted() {
        let manager = FocusManager::new();
        let installs = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let (i, c) = (installs.clone(), cleanups.clone());
        manager.set_event_listener(move |_setter| {
            i.fetch_add(1, Ordering::SeqCst);
            let c = c.clone();
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert_eq!(installs.load(Ordering::SeqCst), 0);

        let first = manager.subscribe(|_| {});
        let second = manager.subscribe(|_| {});
        assert_eq!(installs.load(Ordering::SeqCst), 1);

        first.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        second.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_setter_updates_state() {
        let manager = FocusManager::new();
        let setter_slot: Arc<Mutex<Option<SignalSetter>>> = Arc::new(Mutex::new(None));
        let slot = setter_slot.clone();
        manager.set_event_listener(move |setter| {
            *slot.lock() = Some(setter);
            Box::new(|| {})
        });
        let _unsubscribe = manager.subscribe(|_| {});
        let setter = setter_slot.lock().clone().expect("setup should run");
        setter(false);
        assert!(!manager.is_focused());
    }
}
