//! Bounded retry with jittered exponential backoff.
//!
//! One policy serves every retry site: serializable-transaction conflicts,
//! provider 5xx/timeouts, and worker-side transient failures. Callers decide
//! what is retryable via the classifier; everything else propagates on the
//! first failure.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: `max_attempts` total tries, exponential delay from `base`
/// capped at `cap`, with uniform jitter over the computed delay.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(50),
            cap: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            cap,
        }
    }

    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            base: Duration::ZERO,
            cap: Duration::ZERO,
        }
    }

    /// Deterministic backoff ceiling for the given attempt (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let scaled = self.base.saturating_mul(2u32.saturating_pow(exp));
        scaled.min(self.cap)
    }

    /// Jittered delay: uniform over `[ceiling/2, ceiling]` so concurrent
    /// retriers spread out instead of thundering together.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let half = ceiling / 2;
        let jitter_span = (ceiling - half).as_millis() as u64;
        let jitter = if jitter_span == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_span)
        };
        half + Duration::from_millis(jitter)
    }

    /// Run `operation` until it succeeds, the classifier declares the error
    /// non-retryable, or attempts are exhausted.
    pub async fn run<T, E, F, Fut, C>(
        &self,
        op_name: &str,
        is_retryable: C,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        op = op_name,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ceiling_doubles_until_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(1), Duration::from_millis(50));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_millis(100));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_millis(200));
        assert_eq!(policy.backoff_ceiling(10), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_ceiling() {
        let policy = RetryPolicy::default();
        for attempt in 1..8 {
            let ceiling = policy.backoff_ceiling(attempt);
            for _ in 0..32 {
                let delay = policy.delay_for(attempt);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling / 2);
            }
        }
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = policy
            .run("test_op", |_| true, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("transient".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_propagate_immediately() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy
            .run("test_op", |_| false, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("fatal".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn attempts_are_bounded() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy
            .run("test_op", |_| true, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("transient".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
