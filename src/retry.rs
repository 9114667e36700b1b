use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Exponential backoff configuration with jitter so concurrent archive
/// downloads hitting the same transient failure don't retry in lockstep.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay for a given retry attempt (0-indexed):
    /// `min(base_delay * 2^attempt, max_delay) + random_jitter(0..base_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let capped = exp.min(self.max_delay);
        let base_ms = self.base_delay.as_millis() as u64;
        let jitter_ms = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        capped + Duration::from_millis(jitter_ms)
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// `classifier` inspects an error and decides whether it is worth retrying.
/// Returns the first `Ok` result, or the last error once retries are
/// exhausted or the classifier aborts.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if classifier(&err) == RetryAction::Abort || attempt >= config.max_retries {
            return Err(err);
        }
        let delay = config.delay_for_attempt(attempt);
        tracing::warn!(
            "attempt {}/{} failed, retrying in {}ms: {}",
            attempt + 1,
            config.max_retries + 1,
            delay.as_millis(),
            err
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
