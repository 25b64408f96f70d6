//! Query and mutation configuration.
//!
//! [`QueryConfig`] and [`MutationConfig`] carry the options that do not
//! depend on the data type, so they can be layered: per-call options win
//! over per-key defaults, which win over client defaults, which win over
//! the built-in values exposed by the `*_or_default` accessors.
//!
//! Options that may depend on the current query are [`Resolvable`]: either
//! a static value or a resolver evaluated at every read.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;
use crate::query::QuerySnapshot;
use crate::query::observer::ResultProp;
use crate::subscription::online::OnlineManager;

/// Default time an unobserved entity is kept: five minutes.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Upper bound of the default exponential retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// A static value or a resolver over the current query snapshot.
pub enum Resolvable<V> {
    Value(V),
    Resolver(Arc<dyn Fn(&QuerySnapshot) -> V + Send + Sync>),
}

impl<V: Clone> Resolvable<V> {
    /// Wraps a resolver closure.
    pub fn resolver(f: impl Fn(&QuerySnapshot) -> V + Send + Sync + 'static) -> Self {
        Self::Resolver(Arc::new(f))
    }

    /// Resolves the value for the given query. Never cached.
    pub fn resolve(&self, snapshot: &QuerySnapshot) -> V {
        match self {
            Self::Value(value) => value.clone(),
            Self::Resolver(f) => f(snapshot),
        }
    }

    /// `true` if both are the same static value or the same resolver.
    pub fn same_as(&self, other: &Self) -> bool
    where
        V: PartialEq,
    {
        match (self, other) {
            (Self::Value(a), Self::Value(b)) => a == b,
            (Self::Resolver(a), Self::Resolver(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl<V> From<V> for Resolvable<V> {
    fn from(value: V) -> Self {
        Self::Value(value)
    }
}

impl<V: Clone> Clone for Resolvable<V> {
    fn clone(&self) -> Self {
        match self {
            Self::Value(value) => Self::Value(value.clone()),
            Self::Resolver(f) => Self::Resolver(f.clone()),
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for Resolvable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// How long fetched data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleTime {
    /// Fresh for the given duration. `Duration::MAX` never goes stale by
    /// time, but invalidation still marks it stale.
    Duration(Duration),
    /// Never stale, not even after invalidation; excluded from refetches.
    Static,
}

impl StaleTime {
    pub const INFINITE: Self = Self::Duration(Duration::MAX);
}

impl Default for StaleTime {
    fn default() -> Self {
        Self::Duration(Duration::ZERO)
    }
}

impl From<Duration> for StaleTime {
    fn from(duration: Duration) -> Self {
        Self::Duration(duration)
    }
}

impl From<Duration> for Resolvable<StaleTime> {
    fn from(duration: Duration) -> Self {
        Self::Value(StaleTime::Duration(duration))
    }
}

/// Whether a trigger (mount, focus, reconnect) refetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefetchOn {
    Never,
    /// Refetch only when the data is stale.
    #[default]
    IfStale,
    Always,
}

impl From<bool> for RefetchOn {
    fn from(value: bool) -> Self {
        if value { Self::IfStale } else { Self::Never }
    }
}

impl From<bool> for Resolvable<RefetchOn> {
    fn from(value: bool) -> Self {
        Self::Value(value.into())
    }
}

/// When fetches and mutations may run with respect to connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
    /// Pause while offline.
    #[default]
    Online,
    /// Ignore connectivity.
    Always,
    /// Run the first attempt regardless; pause retries while offline.
    OfflineFirst,
}

impl NetworkMode {
    /// Whether a fetch may start right now.
    #[must_use]
    pub fn can_fetch(self, online: &OnlineManager) -> bool {
        self != Self::Online || online.is_online()
    }
}

/// Retry policy.
#[derive(Clone)]
pub enum Retry {
    /// Retry up to this many times.
    Count(u32),
    Always,
    /// Decide from the number of failures so far and the last error.
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
}

impl Retry {
    pub fn predicate(f: impl Fn(u32, &QueryError) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    /// Whether another attempt should follow `failure_count` failures.
    #[must_use]
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            Self::Count(max) => failure_count < *max,
            Self::Always => true,
            Self::Predicate(f) => f(failure_count, error),
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::Count(0)
    }
}

impl From<bool> for Retry {
    fn from(value: bool) -> Self {
        if value { Self::Always } else { Self::Count(0) }
    }
}

impl From<u32> for Retry {
    fn from(value: u32) -> Self {
        Self::Count(value)
    }
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Self::Always => f.write_str("Always"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Delay between retry attempts.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1s * 2^failures, 30s)`
    #[default]
    Exponential,
    Fixed(Duration),
    Custom(Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    pub fn custom(f: impl Fn(u32, &QueryError) -> Duration + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    #[must_use]
    pub fn delay(&self, failure_count: u32, error: &QueryError) -> Duration {
        match self {
            Self::Exponential => default_retry_delay(failure_count),
            Self::Fixed(delay) => *delay,
            Self::Custom(f) => f(failure_count, error),
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential => f.write_str("Exponential"),
            Self::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Exponential backoff capped at [`MAX_RETRY_DELAY`].
#[must_use]
pub fn default_retry_delay(failure_count: u32) -> Duration {
    let factor = 2u64.saturating_pow(failure_count);
    Duration::from_millis(1000u64.saturating_mul(factor)).min(MAX_RETRY_DELAY)
}

/// Which result properties trigger listener notifications.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NotifyOnChangeProps {
    /// Any change notifies.
    #[default]
    All,
    /// Only changes to these properties notify.
    Props(Vec<ResultProp>),
}

/// Type-independent query options.
///
/// This controls how queries cache data, when they consider it stale, and
/// which events refetch it.
#[derive(Debug, Clone, Default)]
pub struct QueryConfig {
    /// How long data is considered fresh before becoming stale.
    ///
    /// When data is fresh, queries will use cached data without refetching.
    /// Once stale, triggers such as mount, focus or reconnect refetch it in
    /// the background while still showing cached data.
    pub stale_time: Option<Resolvable<StaleTime>>,

    /// How long unobserved data is retained before being garbage collected.
    pub gc_time: Option<Duration>,

    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub enabled: Option<Resolvable<bool>>,
    pub refetch_on_window_focus: Option<Resolvable<RefetchOn>>,
    pub refetch_on_reconnect: Option<Resolvable<RefetchOn>>,
    pub refetch_on_mount: Option<Resolvable<RefetchOn>>,
    pub retry_on_mount: Option<bool>,
    pub refetch_interval: Option<Resolvable<Option<Duration>>>,
    pub refetch_interval_in_background: Option<bool>,
    pub structural_sharing: Option<bool>,
    pub throw_on_error: Option<bool>,
    pub notify_on_change_props: Option<NotifyOnChangeProps>,
}

macro_rules! merge_fields {
    ($self:ident, $fallback:ident, $($field:ident),+ $(,)?) => {
        Self {
            $($field: $self.$field.clone().or_else(|| $fallback.$field.clone()),)+
        }
    };
}

impl QueryConfig {
    /// Creates a configuration with the given stale and gc times.
    #[must_use]
    pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time: Some(stale_time.into()),
            gc_time: Some(gc_time),
            ..Self::default()
        }
    }

    /// Fills every unset field from `fallback`.
    #[must_use]
    pub fn merge(&self, fallback: &Self) -> Self {
        merge_fields!(
            self,
            fallback,
            stale_time,
            gc_time,
            retry,
            retry_delay,
            network_mode,
            enabled,
            refetch_on_window_focus,
            refetch_on_reconnect,
            refetch_on_mount,
            retry_on_mount,
            refetch_interval,
            refetch_interval_in_background,
            structural_sharing,
            throw_on_error,
            notify_on_change_props,
        )
    }

    #[must_use]
    pub fn stale_time(mut self, stale_time: impl Into<Resolvable<StaleTime>>) -> Self {
        self.stale_time = Some(stale_time.into());
        self
    }

    #[must_use]
    pub const fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    #[must_use]
    pub const fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub fn enabled(mut self, enabled: impl Into<Resolvable<bool>>) -> Self {
        self.enabled = Some(enabled.into());
        self
    }

    #[must_use]
    pub fn refetch_on_window_focus(mut self, value: impl Into<Resolvable<RefetchOn>>) -> Self {
        self.refetch_on_window_focus = Some(value.into());
        self
    }

    #[must_use]
    pub fn refetch_on_reconnect(mut self, value: impl Into<Resolvable<RefetchOn>>) -> Self {
        self.refetch_on_reconnect = Some(value.into());
        self
    }

    #[must_use]
    pub fn refetch_on_mount(mut self, value: impl Into<Resolvable<RefetchOn>>) -> Self {
        self.refetch_on_mount = Some(value.into());
        self
    }

    #[must_use]
    pub const fn retry_on_mount(mut self, value: bool) -> Self {
        self.retry_on_mount = Some(value);
        self
    }

    #[must_use]
    pub fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(Resolvable::Value(Some(interval)));
        self
    }

    #[must_use]
    pub const fn refetch_interval_in_background(mut self, value: bool) -> Self {
        self.refetch_interval_in_background = Some(value);
        self
    }

    #[must_use]
    pub const fn structural_sharing(mut self, value: bool) -> Self {
        self.structural_sharing = Some(value);
        self
    }

    #[must_use]
    pub const fn throw_on_error(mut self, value: bool) -> Self {
        self.throw_on_error = Some(value);
        self
    }

    #[must_use]
    pub fn notify_on_change_props(mut self, props: impl IntoIterator<Item = ResultProp>) -> Self {
        self.notify_on_change_props = Some(NotifyOnChangeProps::Props(props.into_iter().collect()));
        self
    }

    #[must_use]
    pub fn gc_time_or_default(&self) -> Duration {
        self.gc_time.unwrap_or(DEFAULT_GC_TIME)
    }

    #[must_use]
    pub fn stale_time_for(&self, snapshot: &QuerySnapshot) -> StaleTime {
        self.stale_time
            .as_ref()
            .map_or_else(StaleTime::default, |s| s.resolve(snapshot))
    }

    #[must_use]
    pub fn is_enabled_for(&self, snapshot: &QuerySnapshot) -> bool {
        self.enabled.as_ref().is_none_or(|e| e.resolve(snapshot))
    }

    #[must_use]
    pub fn retry_or_default(&self) -> Retry {
        self.retry.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn retry_delay_or_default(&self) -> RetryDelay {
        self.retry_delay.clone().unwrap_or_default()
    }

    #[must_use]
    pub fn network_mode_or_default(&self) -> NetworkMode {
        self.network_mode.unwrap_or_default()
    }

    #[must_use]
    pub fn refetch_interval_for(&self, snapshot: &QuerySnapshot) -> Option<Duration> {
        self.refetch_interval
            .as_ref()
            .and_then(|r| r.resolve(snapshot))
    }
}

/// Groups mutations that must run one at a time, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MutationScope {
    pub id: String,
}

impl MutationScope {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Type-independent mutation options.
#[derive(Debug, Clone, Default)]
pub struct MutationConfig {
    pub gc_time: Option<Duration>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub scope: Option<MutationScope>,
    pub throw_on_error: Option<bool>,
}

impl MutationConfig {
    #[must_use]
    pub fn merge(&self, fallback: &Self) -> Self {
        merge_fields!(
            self,
            fallback,
            gc_time,
            retry,
            retry_delay,
            network_mode,
            scope,
            throw_on_error
        )
    }

    #[must_use]
    pub const fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: impl Into<Retry>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    #[must_use]
    pub const fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub fn scope(mut self, id: impl Into<String>) -> Self {
        self.scope = Some(MutationScope::new(id));
        self
    }

    #[must_use]
    pub fn gc_time_or_default(&self) -> Duration {
        self.gc_time.unwrap_or(DEFAULT_GC_TIME)
    }
}
