//! Notification batching.
//!
//! Every side-effecting notification in the engine (observer listeners,
//! cache events) is routed through a [`NotifyManager`]. Inside a
//! [`NotifyManager::batch`] call notifications are queued; when the
//! outermost batch returns the queue is drained through the configured
//! scheduler. The default scheduler runs callbacks inline, so by the time
//! `batch` returns every queued notification (including ones queued by
//! other notifications) has been delivered.
//!
//! Batches are per thread: a batch open on one thread never defers
//! notifications scheduled from another.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// A deferred notification.
pub type NotifyCallback = Box<dyn FnOnce() + Send>;

/// A function that runs (or defers) a notification.
pub type NotifyRunner = Arc<dyn Fn(NotifyCallback) + Send + Sync>;

/// Identifies a listener so repeated notifications within one batch collapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerKey(u64);

impl ListenerKey {
    /// Allocates a process-unique key.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Queued {
    key: Option<ListenerKey>,
    callback: NotifyCallback,
}

#[derive(Default)]
struct Batch {
    queue: Vec<Queued>,
    depth: usize,
}

thread_local! {
    /// Open batches of the current thread, keyed by manager.
    static BATCHES: RefCell<HashMap<usize, Batch>> = RefCell::new(HashMap::new());
}

struct Inner {
    notify_fn: RwLock<NotifyRunner>,
    batch_notify_fn: RwLock<NotifyRunner>,
    schedule_fn: RwLock<NotifyRunner>,
}

/// Batches and schedules notifications.
///
/// Cheap to clone; clones share the same batches and delivery functions.
#[derive(Clone)]
pub struct NotifyManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for NotifyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyManager")
            .field("batching", &self.is_batching())
            .finish()
    }
}

impl Default for NotifyManager {
    fn default() -> Self {
        Self::new()
    }
}

fn run_inline() -> NotifyRunner {
    Arc::new(|callback: NotifyCallback| callback())
}

impl NotifyManager {
    /// Creates a manager that delivers notifications inline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                notify_fn: RwLock::new(run_inline()),
                batch_notify_fn: RwLock::new(run_inline()),
                schedule_fn: RwLock::new(run_inline()),
            }),
        }
    }

    /// Runs `f` inside a batch; queued notifications flush when the
    /// outermost batch completes.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = BatchGuard::enter(self);
        f()
    }

    /// Schedules a notification.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(None, Box::new(callback));
    }

    /// Schedules a notification for a specific listener. Within one batch
    /// only the latest notification per key is delivered, at the position
    /// of the first one.
    pub fn schedule_for(&self, key: ListenerKey, callback: impl FnOnce() + Send + 'static) {
        self.enqueue(Some(key), Box::new(callback));
    }

    /// Wraps `f` so every call is scheduled through this manager.
    pub fn batch_calls<A, F>(&self, f: F) -> impl Fn(A) + Send + Sync + 'static
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let manager = self.clone();
        let f = Arc::new(f);
        move |arg: A| {
            let f = f.clone();
            manager.schedule(move || f(arg));
        }
    }

    /// Overrides the function used to deliver each notification.
    pub fn set_notify_function(&self, f: impl Fn(NotifyCallback) + Send + Sync + 'static) {
        *self.inner.notify_fn.write() = Arc::new(f);
    }

    /// Overrides the function wrapping delivery of one flushed batch, e.g.
    /// to group re-renders in a UI framework.
    pub fn set_batch_notify_function(&self, f: impl Fn(NotifyCallback) + Send + Sync + 'static) {
        *self.inner.batch_notify_fn.write() = Arc::new(f);
    }

    /// Overrides how a flush is scheduled. The default runs inline.
    pub fn set_scheduler(&self, f: impl Fn(NotifyCallback) + Send + Sync + 'static) {
        *self.inner.schedule_fn.write() = Arc::new(f);
    }

    /// Returns `true` while the calling thread is inside a batch.
    #[must_use]
    pub fn is_batching(&self) -> bool {
        let id = self.id();
        BATCHES.with_borrow(|batches| batches.contains_key(&id))
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn enqueue(&self, key: Option<ListenerKey>, callback: NotifyCallback) {
        let id = self.id();
        let unbatched = BATCHES.with_borrow_mut(|batches| {
            let Some(batch) = batches.get_mut(&id) else {
                return Some(callback);
            };
            if let Some(key) = key
                && let Some(existing) = batch.queue.iter_mut().find(|q| q.key == Some(key))
            {
                existing.callback = callback;
            } else {
                batch.queue.push(Queued { key, callback });
            }
            None
        });
        if let Some(callback) = unbatched {
            let notify_fn = self.inner.notify_fn.read().clone();
            let schedule_fn = self.inner.schedule_fn.read().clone();
            schedule_fn(Box::new(move || notify_fn(callback)));
        }
    }

    fn flush(&self, queue: Vec<Queued>) {
        if queue.is_empty() {
            return;
        }
        let notify_fn = self.inner.notify_fn.read().clone();
        let batch_notify_fn = self.inner.batch_notify_fn.read().clone();
        let schedule_fn = self.inner.schedule_fn.read().clone();
        schedule_fn(Box::new(move || {
            batch_notify_fn(Box::new(move || {
                for queued in queue {
                    notify_fn(queued.callback);
                }
            }));
        }));
    }
}

struct BatchGuard<'a> {
    manager: &'a NotifyManager,
}

impl<'a> BatchGuard<'a> {
    fn enter(manager: &'a NotifyManager) -> Self {
        let id = manager.id();
        BATCHES.with_borrow_mut(|batches| batches.entry(id).or_default().depth += 1);
        Self { manager }
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let id = self.manager.id();
        // The outermost batch closes before flushing, so notifications
        // scheduled during delivery run unbatched.
        let finished = BATCHES.with_borrow_mut(|batches| {
            let batch = batches.get_mut(&id)?;
            batch.depth -= 1;
            if batch.depth > 0 {
                return None;
            }
            batches.remove(&id).map(|batch| batch.queue)
        });
        if let Some(queue) = finished {
            self.manager.flush(queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, NotifyManager) {
        (Arc::new(Mutex::new(Vec::new())), NotifyManager::new())
    }

    #[test]
    fn test_schedule_outside_batch_runs_inline() {
        let (log, manager) = recorder();
        let l = log.clone();
        manager.schedule(move || l.lock().push("a"));
        assert_eq!(*log.lock(), vec!["a"]);
    }

    #[test]
    fn test_batch_defers_until_outermost_returns() {
        let (log, manager) = recorder();
        manager.batch(|| {
            let l = log.clone();
            manager.schedule(move || l.lock().push("a"));
            manager.batch(|| {
                let l = log.clone();
                manager.schedule(move || l.lock().push("b"));
            });
            assert!(log.lock().is_empty());
        });
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_nested_scheduling_drains_before_return() {
        let (log, manager) = recorder();
        let m = manager.clone();
        let l = log.clone();
        manager.batch(|| {
            manager.schedule(move || {
                l.lock().push("outer");
                let l2 = l.clone();
                m.batch(|| m.schedule(move || l2.lock().push("inner")));
            });
        });
        assert_eq!(*log.lock(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_keyed_notifications_collapse() {
        let (log, manager) = recorder();
        let key = ListenerKey::next();
        manager.batch(|| {
            let l = log.clone();
            manager.schedule_for(key, move || l.lock().push("first"));
            let l = log.clone();
            manager.schedule(move || l.lock().push("other"));
            let l = log.clone();
            manager.schedule_for(key, move || l.lock().push("latest"));
        });
        assert_eq!(*log.lock(), vec!["latest", "other"]);
    }

    #[test]
    fn test_batch_notify_function_wraps_flush() {
        let (log, manager) = recorder();
        let l = log.clone();
        manager.set_batch_notify_function(move |callback| {
            l.lock().push("begin");
            callback();
            l.lock().push("end");
        });
        manager.batch(|| {
            let l = log.clone();
            manager.schedule(move || l.lock().push("a"));
            let l = log.clone();
            manager.schedule(move || l.lock().push("b"));
        });
        assert_eq!(*log.lock(), vec!["begin", "a", "b", "end"]);
    }

    #[test]
    fn test_batch_calls() {
        let manager = NotifyManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let f = manager.batch_calls(move |n: i32| s.lock().push(n));
        manager.batch(|| {
            f(1);
            f(2);
            assert!(seen.lock().is_empty());
        });
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_batch_on_another_thread_does_not_defer_this_one() {
        let manager = NotifyManager::new();
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        let other = thread::spawn({
            let manager = manager.clone();
            let entered = entered.clone();
            let release = release.clone();
            move || {
                manager.batch(|| {
                    entered.wait();
                    release.wait();
                });
            }
        });

        entered.wait();
        let delivered = Arc::new(AtomicBool::new(false));
        let d = delivered.clone();
        manager.batch(|| manager.schedule(move || d.store(true, Ordering::SeqCst)));
        assert!(delivered.load(Ordering::SeqCst));
        assert!(!manager.is_batching());

        release.wait();
        other.join().expect("batching thread finishes");
    }

    #[test]
    fn test_each_thread_flushes_its_own_batch() {
        let manager = NotifyManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let scheduled = Arc::new(Barrier::new(2));
        let checked = Arc::new(Barrier::new(2));
        let other = thread::spawn({
            let manager = manager.clone();
            let log = log.clone();
            let scheduled = scheduled.clone();
            let checked = checked.clone();
            move || {
                manager.batch(|| {
                    let l = log.clone();
                    manager.schedule(move || l.lock().push("other"));
                    scheduled.wait();
                    checked.wait();
                });
            }
        });

        scheduled.wait();
        let l = log.clone();
        manager.schedule(move || l.lock().push("main"));
        assert_eq!(*log.lock(), vec!["main"]);
        checked.wait();
        other.join().expect("batching thread finishes");
        assert_eq!(*log.lock(), vec!["main", "other"]);
    }

    #[test]
    fn test_batch_returns_value() {
        let manager = NotifyManager::new();
        assert_eq!(manager.batch(|| 42), 42);
        assert!(!manager.is_batching());
    }
}
