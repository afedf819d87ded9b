use super::types::{RetryConfig, RetryMetrics};
use crate::metrics;
use backoff::backoff::Backoff;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Deterministic exponential backoff: attempt `n` waits
/// `min(initial * multiplier^(n-1), max)`.
#[derive(Debug, Clone)]
pub struct CappedExponentialBackoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    retries: i32,
}

impl CappedExponentialBackoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max,
            retries: 0,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = nanos.min(self.max.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }
}

impl Backoff for CappedExponentialBackoff {
    fn reset(&mut self) {
        self.retries = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        self.retries = self.retries.saturating_add(1);
        Some(self.delay_for(self.retries as u32))
    }
}

/// Retry executor with exponential backoff
#[derive(Debug)]
pub struct RetryExecutor {
    name: String,
    config: RetryConfig,
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

impl RetryExecutor {
    /// Create a new retry executor
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            successful_without_retry: AtomicU64::new(0),
            successful_with_retry: AtomicU64::new(0),
            failed_without_retry: AtomicU64::new(0),
            failed_with_retry: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            successful_calls_without_retry: self.successful_without_retry.load(Ordering::Relaxed),
            successful_calls_with_retry: self.successful_with_retry.load(Ordering::Relaxed),
            failed_calls_without_retry: self.failed_without_retry.load(Ordering::Relaxed),
            failed_calls_with_retry: self.failed_with_retry.load(Ordering::Relaxed),
        }
    }

    fn backoff(&self) -> CappedExponentialBackoff {
        CappedExponentialBackoff::new(
            self.config.initial_backoff(),
            self.config.backoff_multiplier,
            self.config.max_backoff(),
        )
    }

    fn count(&self, counter: &AtomicU64, kind: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_retry_call(&self.name, kind);
    }

    /// Execute with retries, but only if error matches predicate.
    ///
    /// Errors rejected by `should_retry` are returned after the attempt that
    /// produced them. Once `max_attempts` is reached the last error is returned.
    /// Dropping the returned future stops the loop; no attempt starts afterwards.
    pub async fn execute_with_predicate<F, Fut, T, E, P>(
        &self,
        mut f: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut backoff = self.backoff();
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(
                retry = %self.name,
                attempt,
                max_attempts,
                "Executing attempt"
            );

            match f(attempt).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(retry = %self.name, attempt, "Call succeeded after retries");
                        self.count(&self.successful_with_retry, "successful_with_retry");
                    } else {
                        self.count(&self.successful_without_retry, "successful_without_retry");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(retry = %self.name, attempt, error = %e, "Error not retryable");
                        if attempt > 1 {
                            self.count(&self.failed_with_retry, "failed_with_retry");
                        } else {
                            self.count(&self.failed_without_retry, "failed_without_retry");
                        }
                        return Err(e);
                    }

                    if attempt >= max_attempts {
                        warn!(
                            retry = %self.name,
                            attempt,
                            max_attempts,
                            error = %e,
                            "Call failed after max attempts"
                        );
                        self.count(&self.failed_with_retry, "failed_with_retry");
                        return Err(e);
                    }

                    if let Some(wait) = backoff.next_backoff() {
                        debug!(
                            retry = %self.name,
                            attempt,
                            wait_ms = wait.as_millis() as u64,
                            error = %e,
                            "Attempt failed, retrying after backoff"
                        );
                        tokio::time::sleep(wait).await;
                    } else {
                        warn!(retry = %self.name, attempt, error = %e, "Backoff exhausted");
                        self.count(&self.failed_with_retry, "failed_with_retry");
                        return Err(e);
                    }
                }
            }
        }
    }
}
