//! Retry with exponential backoff for chat requests

use std::future::Future;
use std::time::{Duration, SystemTime};

use tokio_util::sync::CancellationToken;

use crate::error::ChatError;

/// Retry policy for chat requests
///
/// Only transient failures are retried; the whole request is reissued.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Base delay between attempts (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Compute the delay before the next attempt
///
/// `min(base_delay * 2^attempt + jitter, max_delay)`, where jitter is 0-25%
/// of the computed delay, derived from `SystemTime` to avoid pulling in a
/// full random number generator.
#[must_use]
pub fn delay_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt));
    let base = base.min(policy.max_delay);

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
///
/// `op` receives the zero-based attempt number. Backoff sleeps end early
/// with [`ChatError::Cancelled`] when `cancel` fires.
///
/// # Errors
///
/// Returns the last error from `op`, or `Cancelled`
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T, ChatError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ChatError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = delay_for_attempt(policy, attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    kind = %e.kind(),
                    delay_ms = delay.as_millis(),
                    "transient chat failure, retrying"
                );

                pause(delay, cancel).await?;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sleep for `delay`, or fail with `Cancelled` if `cancel` fires first
///
/// # Errors
///
/// Returns `Cancelled` when the token fires during the pause
pub async fn pause(delay: Duration, cancel: &CancellationToken) -> Result<(), ChatError> {
    tokio::select! {
        () = cancel.cancelled() => Err(ChatError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn exponential_growth() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };

        let d0 = delay_for_attempt(&policy, 0);
        let d1 = delay_for_attempt(&policy, 1);
        let d2 = delay_for_attempt(&policy, 2);

        assert!(d0 >= Duration::from_millis(100), "attempt 0: {d0:?}");
        assert!(d1 >= Duration::from_millis(200), "attempt 1: {d1:?}");
        assert!(d2 >= Duration::from_millis(400), "attempt 2: {d2:?}");
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            ..RetryPolicy::default()
        };
        let d = delay_for_attempt(&policy, 3);
        assert!(d <= policy.max_delay, "delay {d:?} exceeds max");
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = delay_for_attempt(&policy, 0);
            assert!(d >= Duration::from_millis(1000), "below base: {d:?}");
            assert!(d <= Duration::from_millis(1250), "above 125%: {d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_use_every_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_backoff(&RetryPolicy::default(), &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ChatError::Unreachable("refused".to_string())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result, Err(ChatError::Unreachable("refused".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            with_backoff(&RetryPolicy::default(), &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ChatError::Status {
                        code: 500,
                        body: String::new(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(ChatError::Status { code: 500, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failure() {
        let result = with_backoff(&RetryPolicy::default(), &CancellationToken::new(), |attempt| async move {
            if attempt == 0 {
                Err(ChatError::Timeout)
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(1));
    }

    #[tokio::test]
    async fn cancel_during_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> = with_backoff(&RetryPolicy::default(), &cancel, |_| async {
            Err(ChatError::Timeout)
        })
        .await;
        assert_eq!(result, Err(ChatError::Cancelled));
    }

    #[test]
    fn default_policy_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(500));
    }
}
