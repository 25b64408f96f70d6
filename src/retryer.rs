//! Retry, backoff, pause and cancellation around one async operation.
//!
//! A [`Retryer`] is consumed by [`Retryer::run`], which is driven inside a
//! spawned task. The owning entity keeps the matching [`RetryerHandle`] to
//! cancel it, stop further retries, or resume it after an offline pause.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::{NetworkMode, Retry, RetryDelay};
use crate::error::{CancelOptions, CancelledError, QueryError};
use crate::subscription::focus::FocusManager;
use crate::subscription::online::OnlineManager;

/// One attempt of the wrapped operation.
pub(crate) type Attempt<T> =
    Box<dyn FnMut() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

pub(crate) type CanRun = Arc<dyn Fn() -> bool + Send + Sync>;

pub(crate) struct RetryerConfig<T> {
    pub attempt: Attempt<T>,
    pub on_fail: Box<dyn Fn(u32, &QueryError) + Send + Sync>,
    pub on_pause: Box<dyn Fn() + Send + Sync>,
    pub on_continue: Box<dyn Fn() + Send + Sync>,
    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub can_run: CanRun,
    pub focus: FocusManager,
    pub online: OnlineManager,
    /// Cancelled together with the retryer so the running attempt can
    /// observe the abort.
    pub abort: Option<CancellationToken>,
}

struct Control {
    cancel: CancellationToken,
    cancel_error: Mutex<Option<CancelledError>>,
    abort: Option<CancellationToken>,
    retry_cancelled: AtomicBool,
    resolved: AtomicBool,
    continue_tx: Mutex<Option<oneshot::Sender<()>>>,
    network_mode: NetworkMode,
    can_run: CanRun,
    focus: FocusManager,
    online: OnlineManager,
}

/// Control side of a running [`Retryer`].
#[derive(Clone)]
pub(crate) struct RetryerHandle {
    control: Arc<Control>,
}

impl fmt::Debug for RetryerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryerHandle")
            .field("resolved", &self.is_resolved())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl RetryerHandle {
    /// Rejects the operation with a [`CancelledError`]. No-op once settled.
    pub fn cancel(&self, options: CancelOptions) {
        if self.is_resolved() {
            return;
        }
        *self.control.cancel_error.lock() = Some(CancelledError::new(options));
        self.control.cancel.cancel();
        if let Some(abort) = &self.control.abort {
            abort.cancel();
        }
    }

    /// Lets the current attempt finish but schedules no further retries.
    pub fn cancel_retry(&self) {
        self.control.retry_cancelled.store(true, Ordering::SeqCst);
    }

    pub fn continue_retry(&self) {
        self.control.retry_cancelled.store(false, Ordering::SeqCst);
    }

    /// Wakes a paused retryer if it may continue.
    pub fn resume(&self) {
        if self.is_resolved() || self.control.can_continue() {
            let tx = self.control.continue_tx.lock().take();
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }
    }

    pub fn can_start(&self) -> bool {
        self.control.can_start()
    }

    pub fn is_resolved(&self) -> bool {
        self.control.resolved.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.control.continue_tx.lock().is_some()
    }
}

impl Control {
    fn can_start(&self) -> bool {
        self.network_mode.can_fetch(&self.online) && (self.can_run)()
    }

    fn can_continue(&self) -> bool {
        self.focus.is_focused()
            && (self.network_mode == NetworkMode::Always || self.online.is_online())
            && (self.can_run)()
    }

    fn cancelled_error(&self) -> QueryError {
        QueryError::Cancelled(self.cancel_error.lock().unwrap_or_default())
    }

    fn retry_cancelled(&self) -> bool {
        self.retry_cancelled.load(Ordering::SeqCst)
    }
}

/// Runs an operation with the configured retry policy.
pub(crate) struct Retryer<T> {
    attempt: Attempt<T>,
    on_fail: Box<dyn Fn(u32, &QueryError) + Send + Sync>,
    on_pause: Box<dyn Fn() + Send + Sync>,
    on_continue: Box<dyn Fn() + Send + Sync>,
    retry: Retry,
    retry_delay: RetryDelay,
    control: Arc<Control>,
}

impl<T: Send + 'static> Retryer<T> {
    pub fn new(config: RetryerConfig<T>) -> (Self, RetryerHandle) {
        let control = Arc::new(Control {
            cancel: CancellationToken::new(),
            cancel_error: Mutex::new(None),
            abort: config.abort,
            retry_cancelled: AtomicBool::new(false),
            resolved: AtomicBool::new(false),
            continue_tx: Mutex::new(None),
            network_mode: config.network_mode,
            can_run: config.can_run,
            focus: config.focus,
            online: config.online,
        });
        let handle = RetryerHandle {
            control: control.clone(),
        };
        let retryer = Self {
            attempt: config.attempt,
            on_fail: config.on_fail,
            on_pause: config.on_pause,
            on_continue: config.on_continue,
            retry: config.retry,
            retry_delay: config.retry_delay,
            control,
        };
        (retryer, handle)
    }

    /// Drives the operation to its final outcome.
    pub async fn run(mut self) -> Result<T, QueryError> {
        let result = self.execute().await;
        self.control.resolved.store(true, Ordering::SeqCst);
        result
    }

    async fn execute(&mut self) -> Result<T, QueryError> {
        if !self.control.can_start() {
            self.pause().await?;
        }

        let mut failure_count = 0u32;
        loop {
            let attempt = (self.attempt)();
            let outcome = tokio::select! {
                biased;
                () = self.control.cancel.cancelled() => return Err(self.control.cancelled_error()),
                outcome = attempt => outcome,
            };
            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if error.is_invariant()
                || error.as_cancelled().is_some()
                || self.control.retry_cancelled()
                || !self.retry.should_retry(failure_count, &error)
            {
                return Err(error);
            }

            let delay = self.retry_delay.delay(failure_count, &error);
            failure_count += 1;
            (self.on_fail)(failure_count, &error);
            tracing::debug!(failure_count, ?delay, "retrying after failure");

            tokio::select! {
                biased;
                () = self.control.cancel.cancelled() => return Err(self.control.cancelled_error()),
                () = tokio::time::sleep(delay) => {}
            }

            if !self.control.can_continue() {
                self.pause().await?;
            }
            if self.control.retry_cancelled() {
                return Err(error);
            }
        }
    }

    async fn pause(&self) -> Result<(), QueryError> {
        let (tx, rx) = oneshot::channel();
        *self.control.continue_tx.lock() = Some(tx);
        (self.on_pause)();
        // A resume may have raced the pause.
        if self.control.can_continue() {
            let tx = self.control.continue_tx.lock().take();
            if let Some(tx) = tx {
                let _ = tx.send(());
            }
        }
        let resumed = tokio::select! {
            biased;
            () = self.control.cancel.cancelled() => Err(self.control.cancelled_error()),
            _ = rx => Ok(()),
        };
        self.control.continue_tx.lock().take();
        resumed?;
        (self.on_continue)();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Harness {
        focus: FocusManager,
        online: OnlineManager,
        failures: Arc<Mutex<Vec<u32>>>,
        pauses: Arc<AtomicU32>,
        continues: Arc<AtomicU32>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                focus: FocusManager::new(),
                online: OnlineManager::new(),
                failures: Arc::new(Mutex::new(Vec::new())),
                pauses: Arc::new(AtomicU32::new(0)),
                continues: Arc::new(AtomicU32::new(0)),
            }
        }

        fn retryer<T: Send + 'static>(
            &self,
            attempt: Attempt<T>,
            retry: Retry,
            network_mode: NetworkMode,
        ) -> (Retryer<T>, RetryerHandle) {
            let failures = self.failures.clone();
            let pauses = self.pauses.clone();
            let continues = self.continues.clone();
            Retryer::new(RetryerConfig {
                attempt,
                on_fail: Box::new(move |count, _| failures.lock().push(count)),
                on_pause: Box::new(move || {
                    pauses.fetch_add(1, Ordering::SeqCst);
                }),
                on_continue: Box::new(move || {
                    continues.fetch_add(1, Ordering::SeqCst);
                }),
                retry,
                retry_delay: RetryDelay::Fixed(Duration::from_millis(10)),
                network_mode,
                can_run: Arc::new(|| true),
                focus: self.focus.clone(),
                online: self.online.clone(),
                abort: None,
            })
        }
    }

    fn failing_until(success_at: u32) -> (Arc<AtomicU32>, Attempt<u32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let attempt: Attempt<u32> = Box::new(move || {
            let n = c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n >= success_at {
                    Ok(n)
                } else {
                    Err(QueryError::FetchError(format!("attempt {n}")))
                }
            }
            .boxed()
        });
        (calls, attempt)
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let harness = Harness::new();
        let (calls, attempt) = failing_until(3);
        let (retryer, _handle) = harness.retryer(attempt, Retry::Count(3), NetworkMode::Online);

        assert_eq!(retryer.run().await, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*harness.failures.lock(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_when_retries_exhausted() {
        let harness = Harness::new();
        let (calls, attempt) = failing_until(10);
        let (retryer, handle) = harness.retryer(attempt, Retry::Count(1), NetworkMode::Online);

        let result = retryer.run().await;
        assert_eq!(result, Err(QueryError::FetchError("attempt 2".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(handle.is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invariant_errors_are_not_retried() {
        let harness = Harness::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let attempt: Attempt<u32> = Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
            async { Err(QueryError::MissingMutationFn) }.boxed()
        });
        let (retryer, _handle) = harness.retryer(attempt, Retry::Always, NetworkMode::Online);

        assert_eq!(retryer.run().await, Err(QueryError::MissingMutationFn));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_rejects_with_cancelled_error() {
        let harness = Harness::new();
        let attempt: Attempt<u32> = Box::new(|| futures::future::pending().boxed());
        let (retryer, handle) = harness.retryer(attempt, Retry::Count(0), NetworkMode::Online);
        let task = tokio::spawn(retryer.run());
        tokio::task::yield_now().await;

        handle.cancel(CancelOptions::keep_state());
        let result = task.await.expect("task should not panic");
        let err = result.expect_err("cancelled retryer rejects");
        assert_eq!(
            err.as_cancelled(),
            Some(&CancelledError {
                revert: false,
                silent: false
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_paused_while_offline() {
        let harness = Harness::new();
        harness.online.set_online(false);
        let (calls, attempt) = failing_until(1);
        let (retryer, handle) = harness.retryer(attempt, Retry::Count(0), NetworkMode::Online);
        let task = tokio::spawn(retryer.run());
        tokio::task::yield_now().await;

        assert!(handle.is_paused());
        assert_eq!(harness.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.resume();
        tokio::task::yield_now().await;
        assert!(handle.is_paused(), "still offline, resume is ignored");

        harness.online.set_online(true);
        handle.resume();
        assert_eq!(task.await.expect("task should not panic"), Ok(1));
        assert_eq!(harness.continues.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_first_runs_first_attempt() {
        let harness = Harness::new();
        harness.online.set_online(false);
        let (calls, attempt) = failing_until(2);
        let (retryer, handle) =
            harness.retryer(attempt, Retry::Count(3), NetworkMode::OfflineFirst);
        let task = tokio::spawn(retryer.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_paused());

        harness.online.set_online(true);
        handle.resume();
        assert_eq!(task.await.expect("task should not panic"), Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_retry_stops_after_current_attempt() {
        let harness = Harness::new();
        let (calls, attempt) = failing_until(10);
        let (retryer, handle) = harness.retryer(attempt, Retry::Always, NetworkMode::Always);
        handle.cancel_retry();

        let result = retryer.run().await;
        assert!(matches!(result, Err(QueryError::FetchError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
