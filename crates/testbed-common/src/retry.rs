//! Bounded retry with exponential backoff and jitter
//!
//! Only for short, in-pass retries of a single API call (status patches,
//! object uploads). Anything that waits on an external system becoming
//! ready returns a requeue from the reconciler instead.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Retry policy for [`retry_with_backoff`]
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Factor applied to the delay after each failure
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default policy with a different attempt budget
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        // +/- 10% jitter
        let jitter = rand::rng().random_range(0.9..=1.1);
        Duration::from_secs_f64((capped * jitter).min(self.max_delay.as_secs_f64()))
    }
}

/// Run `op` until it succeeds or the attempt budget is spent.
///
/// Returns the last error when every attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < attempts => {
                let delay = config.delay_for(attempt);
                warn!(operation, attempt, error = %e, ?delay, "attempt failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<u32, String> = retry_with_backoff(&fast(), "flaky", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_budget_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<(), String> = retry_with_backoff(&fast(), "always-fails", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Err(format!("failure {n}"))
            }
        })
        .await;
        assert_eq!(result, Err("failure 3".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_never_exceeds_max() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3),
            backoff_multiplier: 4.0,
        };
        for attempt in 1..10 {
            assert!(config.delay_for(attempt) <= Duration::from_secs(3));
        }
    }

    #[test]
    fn with_max_attempts_keeps_other_defaults() {
        let config = RetryConfig::with_max_attempts(7);
        assert_eq!(config.max_attempts, 7);
        assert_eq!(config.initial_delay, RetryConfig::default().initial_delay);
    }
}
