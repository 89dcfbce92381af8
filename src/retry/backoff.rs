//! Bounded-attempt retry engine with exponential backoff and jitter.
//!
//! Mirrors `original_source/retry/retry_max_times.go`: sleep before each
//! attempt (including the first), invoke the closure, stop on success, and
//! return the last error once `max_times` attempts are exhausted.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::CacheError;

/// Configuration for the bounded retry engine.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Number of attempts (>= 1).
    pub max_times: u32,
    /// Base delay between attempts.
    pub base_timeout: Duration,
    /// Upper bound on a single delay. Zero means uncapped.
    pub max_delay: Duration,
    /// Whether the delay grows exponentially with jitter, or stays constant.
    pub exponential: bool,
}

impl RetryConfig {
    pub fn new(max_times: u32, base_timeout: Duration) -> Self {
        Self {
            max_times: max_times.max(1),
            base_timeout,
            max_delay: Duration::ZERO,
            exponential: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_exponential(mut self, exponential: bool) -> Self {
        self.exponential = exponential;
        self
    }

    /// Delay before the `retry_times`-th attempt (1-indexed, matching the
    /// source's `retryTimes` counter which starts at 1).
    pub fn delay_for(&self, retry_times: u32) -> Duration {
        if !self.exponential {
            return self.base_timeout;
        }
        let pow = 2u64.saturating_pow(retry_times.saturating_sub(1));
        let scaled = self.base_timeout.saturating_mul(pow as u32);
        let half = scaled / 2;
        let jitter = if half.is_zero() {
            Duration::ZERO
        } else {
            let jitter_nanos = rand::thread_rng().gen_range(0..half.as_nanos().max(1));
            Duration::from_nanos(jitter_nanos.min(u64::MAX as u128) as u64)
        };
        let mut delay = half + jitter;
        if !self.max_delay.is_zero() && delay > self.max_delay {
            delay = self.max_delay;
        }
        delay
    }
}

/// `DoRetry`: retries a fallible async operation, returning the last error
/// if every attempt fails.
pub async fn do_retry<F, Fut>(config: RetryConfig, mut fn_: F) -> Result<(), CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), CacheError>>,
{
    let mut retry_times = 1u32;
    let mut last_err = None;
    for _ in 0..config.max_times {
        tokio::time::sleep(config.delay_for(retry_times)).await;
        match fn_().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                retry_times += 1;
            }
        }
    }
    Err(last_err.unwrap_or(CacheError::StrategyUnsupported))
}

/// `DoRetryReturn`: the value-returning variant of [`do_retry`].
pub async fn do_retry_return<T, F, Fut>(config: RetryConfig, mut fn_: F) -> Result<T, CacheError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CacheError>>,
{
    let mut retry_times = 1u32;
    let mut last_err = None;
    for _ in 0..config.max_times {
        tokio::time::sleep(config.delay_for(retry_times)).await;
        match fn_().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                last_err = Some(e);
                retry_times += 1;
            }
        }
    }
    Err(last_err.unwrap_or(CacheError::StrategyUnsupported))
}

/// `DoRetryWithParams`: this strategy does not support retrying "by name
/// with parameters" — that shape belongs to [`crate::retry::queue`].
pub fn do_retry_with_params(_key: &str, _params: &[serde_json::Value]) -> Result<(), CacheError> {
    Err(CacheError::StrategyUnsupported)
}
