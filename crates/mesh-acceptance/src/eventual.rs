//! Bounded waiting helpers.
//!
//! Three shapes of waiting show up in an acceptance run:
//!
//! - [`retry_fixed`]: a bounded number of attempts with fixed spacing, used for
//!   response-code and delay-window polling.
//! - [`poll_until`]: poll observable state until it yields a value or a cap is
//!   reached, used for ingress address resolution.
//! - [`wait_for_propagation`]: a blind fixed wait after a rule change. The mesh
//!   exposes no completion signal for rule propagation, so this is a known
//!   source of flakiness.

use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Fixed-spacing retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Sleep between two attempts. No sleep after the last one.
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }
}

/// All attempts of a [`retry_fixed`] loop failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryExhausted {
    pub attempts: u32,
    /// Reason reported by the final attempt.
    pub last_error: String,
}

impl std::fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "gave up after {} attempts: {}",
            self.attempts, self.last_error
        )
    }
}

/// Run `attempt` until it returns `Ok` or the policy is exhausted.
///
/// The closure receives the 1-based attempt number. Spacing is fixed: no
/// exponential growth and no jitter.
pub async fn retry_fixed<T, F, Fut>(
    policy: RetryPolicy,
    label: &str,
    mut attempt: F,
) -> Result<T, RetryExhausted>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let mut last_error = String::new();

    for n in 1..=policy.attempts {
        match attempt(n).await {
            Ok(value) => return Ok(value),
            Err(reason) => {
                debug!(
                    check = label,
                    attempt = n,
                    max_attempts = policy.attempts,
                    reason = %reason,
                    "Attempt failed"
                );
                last_error = reason;
            }
        }

        if n < policy.attempts {
            sleep(policy.interval).await;
        }
    }

    Err(RetryExhausted {
        attempts: policy.attempts,
        last_error,
    })
}

/// Poll `condition` until it yields `Some` or `timeout` elapses.
///
/// The condition is always evaluated at least once.
pub async fn poll_until<T, F, Fut>(
    description: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut condition: F,
) -> Result<T, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = Instant::now();

    loop {
        if let Some(value) = condition().await {
            return Ok(value);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(format!(
                "Timeout after {:?} waiting for: {}",
                timeout, description
            ));
        }

        // Cap the final sleep at the remaining time
        sleep(poll_interval.min(timeout.saturating_sub(elapsed))).await;
    }
}

/// Sleep for the rule propagation interval.
pub async fn wait_for_propagation(reason: &str, interval: Duration) {
    info!(
        reason = reason,
        wait_secs = interval.as_secs(),
        "Waiting for rule propagation"
    );
    sleep(interval).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1))
    }

    #[test]
    fn test_policy_has_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_fixed_succeeds_immediately() {
        let result = retry_fixed(fast_policy(5), "immediate", |_| async { Ok::<_, String>(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_retry_fixed_succeeds_on_last_attempt() {
        let result = retry_fixed(fast_policy(5), "last", |n| async move {
            if n == 5 {
                Ok(n)
            } else {
                Err(format!("attempt {n}"))
            }
        })
        .await;
        assert_eq!(result, Ok(5));
    }

    #[tokio::test]
    async fn test_retry_fixed_exhausts_with_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = retry_fixed(fast_policy(5), "never", move |n| {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(format!("status 503 on attempt {n}"))
            }
        })
        .await;

        let err = result.expect_err("Should exhaust retries");
        assert_eq!(err.attempts, 5);
        assert_eq!(err.last_error, "status 503 on attempt 5");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fixed_spacing_is_fixed() {
        let start = tokio::time::Instant::now();
        let policy = RetryPolicy::new(5, Duration::from_secs(10));

        let _ = retry_fixed(policy, "spacing", |_| async { Err::<(), _>("no".to_string()) }).await;

        // Four gaps between five attempts, none after the last
        assert_eq!(start.elapsed(), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn test_poll_until_returns_value() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = poll_until(
            "counter reaches 3",
            Duration::from_secs(5),
            Duration::from_millis(1),
            move || {
                let attempts = attempts_clone.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    (n >= 3).then_some(n)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_poll_until_times_out() {
        let result: Result<(), _> = poll_until(
            "never",
            Duration::from_millis(20),
            Duration::from_millis(5),
            || async { None },
        )
        .await;

        let err = result.expect_err("Should time out");
        assert!(err.contains("waiting for: never"));
    }
}
