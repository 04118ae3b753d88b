// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policy and rate limiting for provider calls.

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::EmbeddingError;

/// Errors that can tell whether another attempt may succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for EmbeddingError {
    fn is_retryable(&self) -> bool {
        EmbeddingError::is_retryable(self)
    }
}

/// Exponential backoff: `base_delay * 2^attempt`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retries are used up. `op` receives the zero-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        "attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Token bucket: holds up to `capacity` tokens, refilled continuously at
/// `refill_per_sec`. Each request takes one token.
pub struct RateLimiter {
    state: Mutex<RateState>,
    capacity: f64,
    refill_per_sec: f64,
}

struct RateState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    /// Limiter allowing `requests_per_second` with a one-second burst.
    /// Returns `None` for a non-positive rate, meaning unlimited.
    pub fn new(requests_per_second: f64) -> Option<Self> {
        Self::with_burst(requests_per_second, requests_per_second.max(1.0))
    }

    pub fn with_burst(requests_per_second: f64, burst: f64) -> Option<Self> {
        if !(requests_per_second > 0.0) || !(burst >= 1.0) {
            return None;
        }
        Some(Self {
            state: Mutex::new(RateState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            capacity: burst,
            refill_per_sec: requests_per_second,
        })
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(guard.last_refill).as_secs_f64();
                guard.last_refill = now;
                guard.tokens = (guard.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                if guard.tokens >= 1.0 {
                    guard.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - guard.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub fn requests_per_second(&self) -> f64 {
        self.refill_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(30));
        assert_eq!(policy.backoff(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<u32, EmbeddingError> = RetryPolicy::default()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(EmbeddingError::transient("busy"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();
        let result: Result<(), EmbeddingError> = RetryPolicy::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EmbeddingError::transient("down")) }
            })
            .await;
        assert!(matches!(result, Err(EmbeddingError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(7) && elapsed < Duration::from_millis(7100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), EmbeddingError> = RetryPolicy::default()
            .run(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EmbeddingError::fatal("malformed")) }
            })
            .await;
        assert!(matches!(result, Err(EmbeddingError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_paces_requests() {
        let limiter = RateLimiter::new(10.0).unwrap();
        let started = Instant::now();
        for _ in 0..25 {
            limiter.acquire().await;
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1400), "{:?}", elapsed);
        assert!(elapsed <= Duration::from_millis(1700), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(5.0).unwrap());
        let started = Instant::now();
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_rate_limiter_disabled() {
        assert!(RateLimiter::new(0.0).is_none());
        assert!(RateLimiter::new(-1.0).is_none());
    }
}
