//! Bounded retry with a per-attempt timeout and exponential backoff.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that may succeed if the operation is simply tried again.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (1-based `attempt`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::error::Error + 'static> {
    #[error("timed out after {attempts} attempt(s) of {timeout:?} each")]
    TimedOut { attempts: u32, timeout: Duration },

    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },

    #[error(transparent)]
    Permanent(E),
}

impl<E: std::error::Error + 'static> RetryError<E> {
    /// True when every failure was transient; the caller may try again later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, RetryError::Permanent(_))
    }
}

pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + IsTransient + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err: Option<E> = None;
    for attempt in 1..=max_attempts {
        match tokio::time::timeout(policy.attempt_timeout, attempt_fn()).await {
            Ok(Ok(value)) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Ok(Err(err)) if !err.is_transient() => return Err(RetryError::Permanent(err)),
            Ok(Err(err)) => {
                warn!(operation, attempt, max_attempts, error = %err, "attempt failed");
                last_err = Some(err);
            }
            Err(_) => {
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    timeout = ?policy.attempt_timeout,
                    "attempt timed out"
                );
                last_err = None;
            }
        }
        if attempt < max_attempts {
            tokio::time::sleep(policy.backoff(attempt)).await;
        }
    }
    Err(match last_err {
        Some(last) => RetryError::Exhausted {
            attempts: max_attempts,
            last,
        },
        None => RetryError::TimedOut {
            attempts: max_attempts,
            timeout: policy.attempt_timeout,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Error)]
    enum Flaky {
        #[error("try again")]
        Again,
        #[error("never")]
        Never,
    }

    impl IsTransient for Flaky {
        fn is_transient(&self) -> bool {
            matches!(self, Flaky::Again)
        }
    }

    fn quick() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            attempt_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(4), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = &AtomicU32::new(0);
        let out = with_retry(&quick(), "test", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Flaky::Again)
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_stops_immediately() {
        let calls = &AtomicU32::new(0);
        let err = with_retry(&quick(), "test", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Flaky::Never)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Permanent(Flaky::Never)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_keeps_last_error() {
        let err = with_retry(&quick(), "test", || async { Err::<(), _>(Flaky::Again) })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn hung_attempts_time_out() {
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(10),
            ..quick()
        };
        let err = with_retry(&policy, "test", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), Flaky>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::TimedOut { attempts: 2, .. }));
    }
}
