//! Backoff policy and the retry loop wrapped around every store call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::config::RetrySettings;
use crate::errors::{ErrorClass, StoreError};

/// Exponential backoff with optional jitter.
///
/// Throttling and transient failures are counted separately; each kind may
/// use up to `max_attempts` attempts before the call gives up.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    /// A single attempt, no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Delay before retry number `attempt` (1-based; attempt 0 is the
    /// initial call and never waits). Jitter adds up to 25%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.jitter && capped > 0.0 {
            let extra = capped * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(capped + extra)
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetrySettings::default().into()
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(s: RetrySettings) -> Self {
        Self {
            max_attempts: s.max_attempts.max(1),
            initial_delay: Duration::from_millis(s.initial_delay_ms),
            max_delay: Duration::from_millis(s.max_delay_ms),
            multiplier: s.multiplier,
            jitter: s.jitter,
        }
    }
}

/// Run `op` under a per-attempt `timeout`, retrying throttled and transient
/// failures according to `policy`. A timed-out attempt counts as transient.
/// Fatal errors return immediately.
///
/// `on_retry` is called before every backoff sleep.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    what: &str,
    mut op: F,
    mut on_retry: impl FnMut(&StoreError),
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut throttled = 0u32;
    let mut transient = 0u32;

    loop {
        let err = match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e,
            Err(_) => StoreError::Timeout(timeout),
        };

        let delay = match err.class() {
            ErrorClass::Fatal => return Err(err),
            ErrorClass::Throttled => {
                throttled += 1;
                if throttled >= policy.max_attempts {
                    warn!(what, attempts = throttled, error = %err, "giving up after repeated throttling");
                    return Err(err);
                }
                err.retry_after()
                    .unwrap_or_else(|| policy.delay_for_attempt(throttled))
            }
            ErrorClass::Retryable => {
                transient += 1;
                if transient >= policy.max_attempts {
                    warn!(what, attempts = transient, error = %err, "retries exhausted");
                    return Err(err);
                }
                policy.delay_for_attempt(transient)
            }
        };

        warn!(what, error = %err, delay_ms = delay.as_millis() as u64, "store call failed, backing off");
        on_retry(&err);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(p.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let p = RetryPolicy {
            jitter: true,
            ..policy(5)
        };
        for _ in 0..50 {
            let d = p.delay_for_attempt(2);
            assert!(d >= Duration::from_millis(200));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[test]
    fn test_from_settings() {
        let p: RetryPolicy = RetrySettings::default().into();
        assert_eq!(p.max_attempts, 5);
        assert_eq!(p.initial_delay, Duration::from_millis(200));
        assert_eq!(p.max_delay, Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = &AtomicU32::new(0);
        let mut retries = 0;
        let result = call_with_retry(
            &policy(5),
            Duration::from_secs(1),
            "test",
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StoreError::Transient("flaky".into()))
                } else {
                    Ok(7)
                }
            },
            |_| retries += 1,
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(
            &policy(5),
            Duration::from_secs(1),
            "test",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Rejected {
                    status: Some(400),
                    detail: "bad".into(),
                })
            },
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(StoreError::Rejected { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), _> = call_with_retry(
            &policy(3),
            Duration::from_secs(1),
            "test",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Transient("down".into()))
            },
            |_| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_has_own_budget() {
        let calls = &AtomicU32::new(0);
        // Two throttles then two transients, then success: neither budget
        // of three attempts is exhausted.
        let result = call_with_retry(
            &policy(3),
            Duration::from_secs(1),
            "test",
            || async move {
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 | 1 => Err(StoreError::Throttled {
                        retry_after: Some(Duration::from_millis(5)),
                    }),
                    2 | 3 => Err(StoreError::Transient("blip".into())),
                    _ => Ok("done"),
                }
            },
            |_| {},
        )
        .await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_retryable() {
        let calls = &AtomicU32::new(0);
        let result = call_with_retry(
            &policy(2),
            Duration::from_millis(50),
            "test",
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, StoreError>(1)
            },
            |e| assert!(matches!(e, StoreError::Timeout(_))),
        )
        .await;
        assert_eq!(result.unwrap(), 1);
    }
}
