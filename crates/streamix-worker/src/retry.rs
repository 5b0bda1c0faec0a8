//! Backoff and retry helpers.
//!
//! Used for job retry scheduling, component restarts and connecting to the
//! broker or job store at startup.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Exponential backoff: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Wall-clock time of retry number `attempt`.
    pub fn retry_at(&self, attempt: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + delay
    }
}

/// Run an async operation until it succeeds or `max_retries` retries failed.
///
/// Returns the last error together with the number of attempts made.
pub async fn retry_async<F, Fut, T, E>(
    operation_name: &str,
    backoff: &Backoff,
    max_retries: u32,
    operation: F,
) -> Result<T, (E, u32)>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    "{} attempt {} failed, retrying in {:?}: {}",
                    operation_name, attempt, delay, e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err((e, attempt + 1)),
        }
    }
}

/// Suppresses log spam from loops that keep failing the same way.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    pub fn record_success(&mut self) {
        if self.suppressed {
            debug!(
                "Recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Returns `true` if this failure should be logged.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else {
            if !self.suppressed {
                self.suppressed = true;
                warn!(
                    "Suppressing further failure logs after {} consecutive failures",
                    self.max_logged_failures
                );
            }
            false
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let backoff = Backoff::new(Duration::from_secs(15), Duration::from_secs(100));

        assert_eq!(backoff.delay_for_attempt(0), Duration::from_secs(15));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(30));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(60));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(100));
        assert_eq!(backoff.delay_for_attempt(64), Duration::from_secs(100));
    }

    #[test]
    fn test_retry_at_is_in_the_future() {
        let backoff = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
        assert!(backoff.retry_at(0) > Utc::now() + chrono::Duration::seconds(30));
    }

    #[test]
    fn test_failure_tracker_suppression() {
        let mut tracker = FailureTracker::new(2);

        assert!(tracker.record_failure());
        assert!(tracker.record_failure());
        assert!(!tracker.record_failure());
        assert!(!tracker.record_failure());
        assert_eq!(tracker.failure_count(), 4);

        tracker.record_success();
        assert_eq!(tracker.failure_count(), 0);
        assert!(tracker.record_failure());
    }

    #[tokio::test]
    async fn test_retry_async_eventual_success() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(5));
        let calls = AtomicU32::new(0);

        let result = retry_async("connect", &backoff, 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("connection refused")
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_async_gives_up() {
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1));

        let result: Result<(), _> =
            retry_async("connect", &backoff, 2, || async { Err("down") }).await;

        assert_eq!(result, Err(("down", 3)));
    }
}
