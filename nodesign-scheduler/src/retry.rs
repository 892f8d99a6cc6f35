//! Retry policy and cancellation for scheduler calls.
//!
//! Only transient failures are retried: [`SchedulerError::Connection`] and
//! [`SchedulerError::ServiceUnavailable`]. Authentication failures and every
//! other error are returned on first occurrence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::client::SchedulerError;

/// Granularity at which a backoff sleep checks for cancellation.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Shared flag a caller can raise to abandon an in-flight call.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once the token has been raised.
    pub fn check(&self) -> Result<(), SchedulerError> {
        if self.is_cancelled() {
            Err(SchedulerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Exponential backoff policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least one is always made)
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    /// Default: 5 attempts, 500ms base delay, 30s cap.
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or
/// `cancel` is raised. `op` receives the zero-based attempt number.
pub fn retry<T, F>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T, SchedulerError>
where
    F: FnMut(u32) -> Result<T, SchedulerError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        cancel.check()?;
        let err = match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!("Attempt {} failed permanently: {}", attempt + 1, err);
            return Err(err);
        }

        attempt += 1;
        if attempt >= max_attempts {
            warn!("Giving up after {} attempts: {}", attempt, err);
            return Err(err);
        }

        let delay = policy.delay(attempt - 1);
        warn!(
            "Attempt {}/{} failed: {}; retrying in {:?}",
            attempt, max_attempts, err, delay
        );
        sleep_cancellable(delay, cancel)?;
    }
}

fn sleep_cancellable(delay: Duration, cancel: &CancelToken) -> Result<(), SchedulerError> {
    let deadline = Instant::now() + delay;
    loop {
        cancel.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(2))
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(1));
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_secs(1));
        assert_eq!(policy.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn test_connection_errors_are_retried() {
        let calls = Cell::new(0);
        let result = retry(&fast_policy(3), &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(SchedulerError::Connection("refused".to_string()))
            } else {
                Ok("scheduled")
            }
        });
        assert_eq!(result.unwrap(), "scheduled");
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_unavailable_exhausts_attempts() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&fast_policy(4), &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(SchedulerError::ServiceUnavailable("draining".to_string()))
        });
        assert!(matches!(result, Err(SchedulerError::ServiceUnavailable(_))));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_auth_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&fast_policy(5), &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err(SchedulerError::Auth("bad certificate".to_string()))
        });
        assert!(matches!(result, Err(SchedulerError::Auth(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        let calls = Cell::new(0);
        let _ = retry(&fast_policy(0), &CancelToken::new(), |_| {
            calls.set(calls.get() + 1);
            Err::<(), _>(SchedulerError::Connection("refused".to_string()))
        });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_cancelled_before_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let calls = Cell::new(0);
        let result: Result<(), _> = retry(&fast_policy(3), &cancel, |_| {
            calls.set(calls.get() + 1);
            Ok(())
        });
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn test_cancel_during_backoff() {
        let cancel = CancelToken::new();
        let policy = RetryPolicy::new(3, Duration::from_secs(60), Duration::from_secs(60));
        let canceller = cancel.clone();

        let started = Instant::now();
        let result: Result<(), _> = retry(&policy, &cancel, |_| {
            canceller.cancel();
            Err(SchedulerError::Connection("refused".to_string()))
        });
        assert!(matches!(result, Err(SchedulerError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
