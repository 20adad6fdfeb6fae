//! Exponential backoff with jitter for transient provider errors

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = exponential.min(self.max_delay.as_secs_f64());
        let delay = if self.jitter {
            capped * rand::thread_rng().gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(delay)
    }
}

pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

/// Rate limits, request timeouts, and server errors
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt >= config.max_attempts {
                    warn!(
                        attempt,
                        max_attempts = config.max_attempts,
                        "Retries exhausted: {}",
                        err
                    );
                    return Err(err);
                }
                let delay = config.delay_for(attempt - 1);
                warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after error: {}",
                    err
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
