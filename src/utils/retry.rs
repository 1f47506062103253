//! Retry utilities for resilient broker calls
//! Bounded exponential backoff, gated by a retryability predicate

use std::time::Duration;
use tracing::{error, warn};

/// Backoff for broker and feed calls
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Ceiling for a single delay
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let scaled = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(retry as i32);
        Duration::from_millis((scaled as u64).min(self.max_delay_ms))
    }
}

/// Run `operation` until it succeeds, `should_retry` refuses the error, or
/// `max_retries` retries are spent. At most `max_retries + 1` attempts.
pub async fn retry_if<F, Fut, T, E, P>(
    operation_name: &str,
    config: &RetryConfig,
    mut should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut retries = 0;

    loop {
        let err = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !should_retry(&err) {
            return Err(err);
        }
        if retries >= config.max_retries {
            error!("{} gave up after {} attempts: {}", operation_name, retries + 1, err);
            return Err(err);
        }

        let delay = config.delay_for(retries);
        warn!(
            "🔁 {} failed (attempt {}/{}), retrying in {:?}: {}",
            operation_name,
            retries + 1,
            config.max_retries + 1,
            delay,
            err
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn always(_: &&str) -> bool {
        true
    }

    fn quick(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 100,
            max_delay_ms: 350,
            backoff_multiplier: 2.0,
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = retry_if("quote", &quick(3), always, || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err("timeout")
            } else {
                Ok(2501.35)
            }
        })
        .await;

        assert_eq!(result, Ok(2501.35));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let calls = AtomicU32::new(0);

        let result = retry_if("place", &quick(2), always, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), &str>("connection reset")
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);

        let result = retry_if(
            "place",
            &quick(5),
            |e: &&str| *e == "transient",
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err::<(), &str>("transient")
                } else {
                    Err("rejected")
                }
            },
        )
        .await;

        assert_eq!(result, Err("rejected"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
