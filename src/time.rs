//! Wall-clock timestamps driven by the Tokio clock.
//!
//! Timestamps are milliseconds since the UNIX epoch so they survive
//! dehydration, but they advance with [`tokio::time::Instant`] so a paused
//! test runtime controls them.

use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

struct Anchor {
    instant: Instant,
    epoch_millis: u64,
}

static ANCHOR: LazyLock<Anchor> = LazyLock::new(|| Anchor {
    instant: Instant::now(),
    epoch_millis: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
});

/// Milliseconds since the UNIX epoch, according to the Tokio clock.
#[must_use]
pub fn now_millis() -> u64 {
    let anchor = &*ANCHOR;
    let elapsed = Instant::now().saturating_duration_since(anchor.instant);
    anchor
        .epoch_millis
        .saturating_add(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Converts a duration to whole milliseconds, saturating.
#[must_use]
pub fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Remaining time before `updated_at + stale_time` is reached.
#[must_use]
pub fn time_until_stale(updated_at: u64, stale_time: Duration) -> Duration {
    let deadline = updated_at.saturating_add(millis(stale_time));
    Duration::from_millis(deadline.saturating_sub(now_millis()))
}

/// `true` for a finite, representable timeout.
#[must_use]
pub fn is_valid_timeout(duration: Duration) -> bool {
    duration != Duration::MAX
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_follows_tokio_clock() {
        let before = now_millis();
        tokio::time::advance(Duration::from_millis(250)).await;
        let after = now_millis();
        assert!(after - before >= 250);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_stale() {
        let now = now_millis();
        assert_eq!(time_until_stale(now, Duration::ZERO), Duration::ZERO);
        assert_eq!(
            time_until_stale(now, Duration::from_millis(100)),
            Duration::from_millis(100)
        );
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(
            time_until_stale(now, Duration::from_millis(100)),
            Duration::ZERO
        );
    }

    #[test]
    fn test_infinite_timeout_is_invalid() {
        assert!(is_valid_timeout(Duration::from_secs(1)));
        assert!(!is_valid_timeout(Duration::MAX));
    }
}
