//! Network connectivity signal.
//!
//! The manager assumes the process is online until an event source or a
//! direct [`OnlineManager::set_online`] call says otherwise. Paused
//! fetches and mutations resume when it flips back to online.

use std::fmt;
use std::sync::Arc;

use futures::stream::BoxStream;

use super::{Cleanup, EnvironmentSignal, SignalSetter, Unsubscribe, stream_setup};

/// Tracks connectivity and notifies subscribers when it changes.
#[derive(Clone)]
pub struct OnlineManager {
    signal: Arc<EnvironmentSignal>,
}

impl fmt::Debug for OnlineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineManager")
            .field("online", &self.is_online())
            .field("listeners", &self.signal.listener_count())
            .finish()
    }
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self::new()
    }
}

fn on_change(signal: &Arc<EnvironmentSignal>, online: bool) {
    if signal.set(Some(online)) {
        signal.emit(online);
    }
}

impl OnlineManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signal: EnvironmentSignal::new("online", true),
        }
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.signal.get()
    }

    pub fn set_online(&self, online: bool) {
        on_change(&self.signal, online);
    }

    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Unsubscribe {
        self.signal.subscribe(listener, on_change)
    }

    pub fn set_event_listener(
        &self,
        setup: impl Fn(SignalSetter) -> Cleanup + Send + Sync + 'static,
    ) {
        self.signal.set_event_listener(Arc::new(setup), on_change);
    }

    /// Uses a stream of connectivity states as the event source.
    pub fn set_event_stream(
        &self,
        make_stream: impl Fn() -> BoxStream<'static, bool> + Send + Sync + 'static,
    ) {
        self.signal
            .set_event_listener(stream_setup("online", make_stream), on_change);
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.signal.listener_count() > 0
    }

    #[must_use]
    pub fn is_event_source_installed(&self) -> bool {
        self.signal.is_installed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::mock::MockSource;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[test]
    fn test_online_by_default() {
        assert!(OnlineManager::new().is_online());
    }

    #[test]
    fn test_set_online_notifies_once_per_change() {
        let manager = OnlineManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let _unsubscribe = manager.subscribe(move |online| s.lock().push(online));

        manager.set_online(false);
        manager.set_online(false);
        manager.set_online(true);

        assert_eq!(*seen.lock(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_event_stream_drives_state() {
        let manager = OnlineManager::new();
        let mock = MockSource::<bool>::new();
        let source = mock.clone();
        manager.set_event_stream(move || source.stream());

        let unsubscribe = manager.subscribe(|_| {});
        assert!(manager.is_event_source_installed());

        // wait for the forwarding task to subscribe to the mock
        while mock.receiver_count() == 0 {
            tokio::task::yield_now().await;
        }
        mock.emit(false).expect("stream should be listening");
        for _ in 0..10 {
            if !manager.is_online() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(!manager.is_online());

        unsubscribe.unsubscribe();
        assert!(!manager.is_event_source_installed());
    }
}
