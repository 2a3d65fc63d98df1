//! Wall-clock abstraction.
//!
//! Every time-based decision in blockwarden (retention cut-offs, deletion delays,
//! partial block staleness, cleanup ticks) reads "now" through [SystemClock], so
//! tests can pin time with [MockSystemClock] (enabled by the `test-util` feature).
//!
//! [DefaultSystemClock] anchors a UTC timestamp to a tokio `Instant`, which means
//! `tokio::time::pause()` and `advance()` move it too.

use chrono::{DateTime, Utc};
use std::{fmt::Debug, future::Future, pin::Pin, time::Duration};

#[cfg(feature = "test-util")]
use std::sync::atomic::{AtomicI64, Ordering};

/// Physical clock used to measure wall-clock time.
pub trait SystemClock: Debug + Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;

    /// Advances the clock by the specified duration.
    #[cfg(feature = "test-util")]
    fn advance<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Sleeps for the specified duration.
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

    /// Returns a ticker that fires every `duration`.
    fn ticker<'a>(&'a self, duration: Duration) -> SystemClockTicker<'a>;

    /// Current time as whole seconds since the Unix epoch.
    fn unix_seconds(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Fires every `duration` according to a [SystemClock].
///
/// The first tick completes immediately, like `tokio::time::Interval`.
pub struct SystemClockTicker<'a> {
    clock: &'a dyn SystemClock,
    duration: Duration,
    last_tick: DateTime<Utc>,
}

impl<'a> SystemClockTicker<'a> {
    pub fn new(clock: &'a dyn SystemClock, duration: Duration) -> Self {
        Self {
            clock,
            duration,
            last_tick: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Completes at `last_tick + duration`. If the clock already moved past that
    /// point the tick completes immediately.
    pub fn tick(&mut self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let sleep_duration = self.remaining();
            self.clock.sleep(sleep_duration).await;
            self.last_tick = self.clock.now();
        })
    }

    fn remaining(&self) -> Duration {
        let elapsed = self
            .clock
            .now()
            .signed_duration_since(self.last_tick)
            .to_std()
            .unwrap_or(Duration::MAX);
        self.duration.checked_sub(elapsed).unwrap_or(Duration::ZERO)
    }
}

/// Clock backed by `tokio::time::Instant`, anchored to `Utc::now()` at creation.
#[derive(Debug)]
pub struct DefaultSystemClock {
    initial_ts: DateTime<Utc>,
    initial_instant: tokio::time::Instant,
}

impl DefaultSystemClock {
    pub fn new() -> Self {
        Self {
            initial_ts: Utc::now(),
            initial_instant: tokio::time::Instant::now(),
        }
    }
}

impl Default for DefaultSystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock for DefaultSystemClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.initial_instant);
        self.initial_ts + elapsed
    }

    #[cfg(feature = "test-util")]
    fn advance<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::advance(duration))
    }

    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn ticker<'a>(&'a self, duration: Duration) -> SystemClockTicker<'a> {
        SystemClockTicker::new(self, duration)
    }
}

/// A clock that only moves when told to. Starts at the Unix epoch unless
/// created with [MockSystemClock::with_time].
#[derive(Debug)]
#[cfg(feature = "test-util")]
pub struct MockSystemClock {
    /// Milliseconds since the Unix epoch; negative values are before it.
    current_ts: AtomicI64,
}

#[cfg(feature = "test-util")]
impl Default for MockSystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "test-util")]
impl MockSystemClock {
    pub fn new() -> Self {
        Self::with_time(0)
    }

    pub fn with_time(ts_millis: i64) -> Self {
        Self {
            current_ts: AtomicI64::new(ts_millis),
        }
    }

    pub fn set(&self, ts_millis: i64) {
        self.current_ts.store(ts_millis, Ordering::SeqCst);
    }
}

#[cfg(feature = "test-util")]
impl SystemClock for MockSystemClock {
    #[allow(clippy::panic)]
    fn now(&self) -> DateTime<Utc> {
        let current_ts = self.current_ts.load(Ordering::SeqCst);
        DateTime::from_timestamp_millis(current_ts)
            .unwrap_or_else(|| panic!("invalid timestamp: {}", current_ts))
    }

    fn advance<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        self.current_ts
            .fetch_add(duration.as_millis() as i64, Ordering::SeqCst);
        Box::pin(async move {
            // let other tasks observe the new time before the caller continues
            tokio::task::yield_now().await;
        })
    }

    /// Does not advance the clock. Some other task must call `advance` or `set`.
    fn sleep<'a>(&'a self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        let end_time = self.current_ts.load(Ordering::SeqCst) + duration.as_millis() as i64;
        Box::pin(async move {
            while self.current_ts.load(Ordering::SeqCst) < end_time {
                tokio::task::yield_now().await;
            }
        })
    }

    fn ticker<'a>(&'a self, duration: Duration) -> SystemClockTicker<'a> {
        SystemClockTicker::new(self, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    #[cfg(feature = "test-util")]
    async fn test_mock_clock_set_and_advance() {
        let clock = MockSystemClock::with_time(1_000);
        assert_eq!(clock.now().timestamp_millis(), 1_000);

        clock.advance(Duration::from_millis(500)).await;
        assert_eq!(clock.now().timestamp_millis(), 1_500);

        clock.set(-3_600_000);
        assert_eq!(clock.unix_seconds(), -3_600);
    }

    #[tokio::test]
    #[cfg(feature = "test-util")]
    async fn test_mock_clock_sleep_waits_for_advance() {
        let clock = std::sync::Arc::new(MockSystemClock::with_time(2_000));
        let sleep_duration = Duration::from_millis(1_000);

        assert!(timeout(Duration::from_millis(10), clock.sleep(sleep_duration))
            .await
            .is_err());

        let pending = clock.sleep(sleep_duration);
        clock.set(3_000);
        assert!(timeout(Duration::from_millis(100), pending).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_clock_follows_tokio_time() {
        let clock = DefaultSystemClock::new();
        let before = clock.now();
        clock.sleep(Duration::from_millis(100)).await;
        assert_eq!(before + Duration::from_millis(100), clock.now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_clock_ticker() {
        let clock = DefaultSystemClock::new();
        let tick_duration = Duration::from_millis(10);
        let mut ticker = clock.ticker(tick_duration);

        // first tick is immediate
        assert!(timeout(Duration::from_millis(10_000), ticker.tick())
            .await
            .is_ok());

        let before = clock.now();
        ticker.tick().await;
        assert_eq!(before + tick_duration, clock.now());
    }
}
