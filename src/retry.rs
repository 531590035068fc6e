//! Retry with exponential backoff and jitter for transient upstream failures.
//!
//! Errors describe themselves through [`Retryable`]: structural 4xx failures
//! and auth failures return immediately, network failures, 5xx and quota
//! responses are retried. Quota responses wait `quota_multiplier` times longer.

use crate::config::RetryConfig;
use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// How the retry loop treats a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryClass {
    /// Transient (network, 5xx): retry with normal backoff.
    Retry,
    /// Quota exceeded (429 and equivalents): retry with multiplied backoff.
    RetryQuota,
    /// Credential problem (401/403): return immediately.
    Auth,
    /// Structural failure (other 4xx, bad config): return immediately.
    Fatal,
}

/// Errors that know whether retrying them can help.
pub trait Retryable {
    fn retry_class(&self) -> RetryClass;
}

/// Retry policy for one unit of work.
///
/// `max_attempts` is the total attempt budget including the first call, so a
/// budget of 3 allows at most 2 backoff sleeps.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
    pub quota_multiplier: u32,
    /// When false every retry waits `base_delay` (+ jitter).
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Policy with the default jitter (up to 1s) and a 3x quota multiplier.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_jitter: Duration::from_millis(1000),
            quota_multiplier: 3,
            exponential: true,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            quota_multiplier: config.quota_multiplier,
            exponential: true,
        }
    }

    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    pub fn with_quota_multiplier(mut self, multiplier: u32) -> Self {
        self.quota_multiplier = multiplier;
        self
    }

    pub fn with_exponential(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    /// Delay before retrying after failed attempt `attempt` (0-based).
    ///
    /// `base * 2^attempt + random(0..=max_jitter)`, multiplied for quota errors.
    pub fn delay_for(&self, attempt: u32, quota: bool) -> Duration {
        let factor = if self.exponential {
            2u32.saturating_pow(attempt)
        } else {
            1
        };
        let mut delay = self.base_delay.saturating_mul(factor);

        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms > 0 {
            delay += Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        }

        if quota {
            delay = delay.saturating_mul(self.quota_multiplier.max(1));
        }
        delay
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned unmodified.
    pub async fn run<F, Fut, T, E>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let class = err.retry_class();
            if matches!(class, RetryClass::Auth | RetryClass::Fatal) {
                debug!(class = ?class, error = %err, "Not retrying");
                return Err(err);
            }
            if attempt + 1 >= max_attempts {
                warn!(attempts = max_attempts, error = %err, "Retry budget exhausted");
                return Err(err);
            }

            let delay = self.delay_for(attempt, class == RetryClass::RetryQuota);
            warn!(
                attempt = attempt + 1,
                max_attempts = max_attempts,
                delay_ms = delay.as_millis() as u64,
                quota = class == RetryClass::RetryQuota,
                error = %err,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Runs `op` under a default policy with the given budget and base delay.
pub async fn with_retry<F, Fut, T, E>(op: F, max_attempts: u32, base_delay: Duration) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    RetryPolicy::new(max_attempts, base_delay).run(op).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[derive(Debug)]
    struct TestError(RetryClass);

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error {:?}", self.0)
        }
    }

    impl Retryable for TestError {
        fn retry_class(&self) -> RetryClass {
            self.0
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100)).with_jitter(Duration::ZERO)
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let p = policy(5);
        assert_eq!(p.delay_for(0, false), Duration::from_millis(100));
        assert_eq!(p.delay_for(1, false), Duration::from_millis(200));
        assert_eq!(p.delay_for(3, false), Duration::from_millis(800));
    }

    #[test]
    fn test_quota_delay_is_multiplied() {
        let p = policy(5);
        assert_eq!(p.delay_for(1, true), Duration::from_millis(600));
        let p = p.with_quota_multiplier(5);
        assert_eq!(p.delay_for(0, true), Duration::from_millis(500));
    }

    #[test]
    fn test_linear_delay_when_not_exponential() {
        let p = policy(5).with_exponential(false);
        assert_eq!(p.delay_for(0, false), Duration::from_millis(100));
        assert_eq!(p.delay_for(4, false), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounded() {
        let p = RetryPolicy::new(3, Duration::from_millis(100));
        for _ in 0..50 {
            let d = p.delay_for(0, false);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(1100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_with_one_sleep_per_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let c = Arc::clone(&calls);
        let result: Result<&str, TestError> = policy(3)
            .run(|| {
                let c = Arc::clone(&c);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError(RetryClass::Retry))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps: 100ms + 200ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), TestError> = policy(3)
            .run(|| {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError(RetryClass::RetryQuota))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().0, RetryClass::RetryQuota);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_and_auth_are_not_retried() {
        for class in [RetryClass::Fatal, RetryClass::Auth] {
            let calls = Arc::new(AtomicU32::new(0));
            let c = Arc::clone(&calls);
            let start = Instant::now();
            let result: Result<(), TestError> = policy(5)
                .run(|| {
                    let c = Arc::clone(&c);
                    async move {
                        c.fetch_add(1, Ordering::SeqCst);
                        Err(TestError(class))
                    }
                })
                .await;
            assert!(result.is_err());
            assert_eq!(calls.load(Ordering::SeqCst), 1);
            assert_eq!(start.elapsed(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_zero_budget_runs_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let result: Result<(), TestError> = with_retry(
            || {
                let c = Arc::clone(&c);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(TestError(RetryClass::Retry))
                }
            },
            0,
            Duration::from_millis(10),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
