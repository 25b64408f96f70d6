//! Shared garbage-collection scheduler.
//!
//! Instead of one timer per cache entry, every unobserved query or
//! mutation registers a deadline here. A single Tokio task sleeps until the
//! earliest deadline, evicts everything that is due and exits as soon as no
//! items remain, so a quiescent cache never polls.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

/// Identifies a collectable cache entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(u64);

impl EntityId {
    /// Allocates a process-unique id.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Removal callback invoked when an item's deadline passes.
pub type GcCallback = Arc<dyn Fn() + Send + Sync>;

struct GcItem {
    deadline: Instant,
    remove: GcCallback,
}

#[derive(Default)]
struct GcState {
    items: HashMap<EntityId, GcItem>,
    /// Wakes the live scan task; `None` while idle.
    scanner: Option<Arc<Notify>>,
}

impl GcState {
    fn is_current(&self, wake: &Arc<Notify>) -> bool {
        self.scanner.as_ref().is_some_and(|w| Arc::ptr_eq(w, wake))
    }
}

struct GcInner {
    state: Mutex<GcState>,
}

/// Tracks eligible items and evicts them once their deadline passes.
#[derive(Clone)]
pub struct GcManager {
    inner: Arc<GcInner>,
}

impl fmt::Debug for GcManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("GcManager")
            .field("eligible", &state.items.len())
            .field("scanning", &state.scanner.is_some())
            .finish()
    }
}

impl Default for GcManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GcManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GcInner {
                state: Mutex::new(GcState::default()),
            }),
        }
    }

    /// Adds or updates an item whose removal is due `gc_time` from now.
    ///
    /// An infinite (`Duration::MAX`) gc time is never tracked.
    pub fn track(&self, id: EntityId, gc_time: Duration, remove: GcCallback) {
        let Some(deadline) = Instant::now().checked_add(gc_time) else {
            self.untrack(id);
            return;
        };
        let mut state = self.inner.state.lock();
        state.items.insert(id, GcItem { deadline, remove });
        if let Some(wake) = &state.scanner {
            wake.notify_one();
            return;
        }
        let wake = Arc::new(Notify::new());
        state.scanner = Some(wake.clone());
        drop(state);
        self.start_scanning(wake);
    }

    /// Removes an item before its deadline, e.g. because it gained an
    /// observer again. Removing the last item stops the scan.
    pub fn untrack(&self, id: EntityId) {
        let mut state = self.inner.state.lock();
        if state.items.remove(&id).is_none() {
            return;
        }
        let wake = if state.items.is_empty() {
            state.scanner.take()
        } else {
            state.scanner.clone()
        };
        drop(state);
        if let Some(wake) = wake {
            wake.notify_one();
        }
    }

    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.inner.state.lock().scanner.is_some()
    }

    #[must_use]
    pub fn eligible_item_count(&self) -> usize {
        self.inner.state.lock().items.len()
    }

    fn start_scanning(&self, wake: Arc<Notify>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("garbage collection requested outside a Tokio runtime");
            let mut state = self.inner.state.lock();
            if state.is_current(&wake) {
                state.scanner = None;
            }
            return;
        };
        tracing::debug!("gc scan started");
        let inner = self.inner.clone();
        runtime.spawn(async move {
            scan(inner, wake).await;
            tracing::debug!("gc scan stopped");
        });
    }
}

async fn scan(inner: Arc<GcInner>, wake: Arc<Notify>) {
    loop {
        let next = {
            let mut state = inner.state.lock();
            if !state.is_current(&wake) {
                return;
            }
            let next = state.items.values().map(|item| item.deadline).min();
            if next.is_none() {
                state.scanner = None;
            }
            next
        };
        let Some(next) = next else {
            return;
        };

        tokio::select! {
            () = sleep_until(next) => {}
            () = wake.notified() => continue,
        }

        let now = Instant::now();
        let due: Vec<(EntityId, GcCallback)> = {
            let mut state = inner.state.lock();
            let ids: Vec<EntityId> = state
                .items
                .iter()
                .filter(|(_, item)| item.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| state.items.remove(&id).map(|item| (id, item.remove)))
                .collect()
        };
        for (id, remove) in due {
            tracing::debug!(entity = %id, "gc deadline reached");
            remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn counter() -> (Arc<AtomicUsize>, GcCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_when_nothing_tracked() {
        let gc = GcManager::new();
        assert!(!gc.is_scanning());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!gc.is_scanning());
        assert_eq!(gc.eligible_item_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scans_until_deadline_then_stops() {
        let gc = GcManager::new();
        let (removed, callback) = counter();
        gc.track(EntityId::next(), Duration::from_millis(10), callback);
        assert!(gc.is_scanning());
        assert_eq!(gc.eligible_item_count(), 1);

        tokio::time::advance(Duration::from_millis(5)).await;
        settle().await;
        assert!(gc.is_scanning());
        assert_eq!(removed.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(!gc.is_scanning());
        assert_eq!(gc.eligible_item_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_untrack_prevents_removal() {
        let gc = GcManager::new();
        let (removed, callback) = counter();
        let id = EntityId::next();
        gc.track(id, Duration::from_millis(10), callback);
        gc.untrack(id);
        assert!(!gc.is_scanning());
        assert_eq!(gc.eligible_item_count(), 0);

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(removed.load(Ordering::SeqCst), 0);
        assert!(!gc.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracking_last_item_idles_before_its_deadline() {
        let gc = GcManager::new();
        let (_, callback) = counter();
        let id = EntityId::next();
        gc.track(id, Duration::from_secs(300), callback);
        settle().await;
        assert!(gc.is_scanning());

        gc.untrack(id);
        settle().await;
        assert_eq!(gc.eligible_item_count(), 0);
        assert!(!gc.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retrack_after_idle_uses_fresh_scan() {
        let gc = GcManager::new();
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();
        let id = EntityId::next();
        gc.track(id, Duration::from_secs(300), first_cb);
        settle().await;
        gc.untrack(id);
        gc.track(EntityId::next(), Duration::from_millis(10), second_cb);
        assert!(gc.is_scanning());

        tokio::time::advance(Duration::from_millis(11)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!gc.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_untracking_one_of_many_keeps_scanning() {
        let gc = GcManager::new();
        let (removed, callback) = counter();
        let early = EntityId::next();
        gc.track(early, Duration::from_millis(10), callback.clone());
        gc.track(EntityId::next(), Duration::from_millis(30), callback);
        settle().await;

        gc.untrack(early);
        assert!(gc.is_scanning());
        tokio::time::advance(Duration::from_millis(15)).await;
        settle().await;
        assert_eq!(removed.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(!gc.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wakes_scanner() {
        let gc = GcManager::new();
        let (slow, slow_cb) = counter();
        let (fast, fast_cb) = counter();
        gc.track(EntityId::next(), Duration::from_secs(60), slow_cb);
        settle().await;
        gc.track(EntityId::next(), Duration::from_millis(10), fast_cb);

        tokio::time::advance(Duration::from_millis(11)).await;
        settle().await;
        assert_eq!(fast.load(Ordering::SeqCst), 1);
        assert_eq!(slow.load(Ordering::SeqCst), 0);
        assert!(gc.is_scanning());
    }

    #[tokio::test(start_paused = true)]
    async fn test_infinite_gc_time_is_not_tracked() {
        let gc = GcManager::new();
        let (_, callback) = counter();
        gc.track(EntityId::next(), Duration::MAX, callback);
        assert_eq!(gc.eligible_item_count(), 0);
        assert!(!gc.is_scanning());
    }

    #[test]
    fn test_track_outside_runtime_does_not_scan() {
        let gc = GcManager::new();
        let (_, callback) = counter();
        gc.track(EntityId::next(), Duration::from_millis(10), callback);
        assert!(!gc.is_scanning());
        assert_eq!(gc.eligible_item_count(), 1);
    }
}
