use crate::clock::SystemClock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Races `future` against a sleep on `clock`. Returns `error_fn()` if the sleep
/// finishes first. The future wins ties.
pub async fn timeout<T, Err>(
    clock: Arc<dyn SystemClock>,
    duration: Duration,
    error_fn: impl FnOnce() -> Err,
    future: impl Future<Output = Result<T, Err>> + Send,
) -> Result<T, Err> {
    tokio::select! {
        biased;
        res = future => res,
        _ = clock.sleep(duration) => Err(error_fn())
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::timeout;
    use crate::clock::{MockSystemClock, SystemClock};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    struct Expired;

    #[tokio::test]
    async fn test_timeout_returns_ready_value() {
        let clock = Arc::new(MockSystemClock::new());
        let result = timeout(clock, Duration::from_millis(100), || Expired, async {
            Ok::<_, Expired>(7)
        })
        .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_timeout_expires_when_clock_moves() {
        let clock = Arc::new(MockSystemClock::new());
        let driver = clock.clone();
        tokio::spawn(async move {
            loop {
                driver.advance(Duration::from_millis(50)).await;
            }
        });
        let result = timeout(
            clock,
            Duration::from_millis(100),
            || Expired,
            std::future::pending::<Result<(), Expired>>(),
        )
        .await;
        assert_eq!(result, Err(Expired));
    }
}
