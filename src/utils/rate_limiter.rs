//! Rate limiting protection
//! Minimum spacing between consecutive REST calls

use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Rate limiter for API calls
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_delay: Duration,
}

impl RateLimiter {
    /// Create new rate limiter
    pub fn new(min_delay_ms: u64) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_delay: Duration::from_millis(min_delay_ms),
        }
    }

    /// Create default rate limiter (200ms delay)
    pub fn new_default() -> Self {
        Self::new(200)
    }

    /// Wait if needed before making API call
    pub async fn wait(&self) {
        let mut last = self.last_call.lock().await;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                sleep(self.min_delay - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(30);

        let start = Instant::now();
        limiter.wait().await;
        limiter.wait().await;

        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_rate_limiter_reset() {
        let limiter = RateLimiter::new(1000);

        limiter.wait().await;
        limiter.reset().await;

        let start = Instant::now();
        limiter.wait().await;

        assert!(start.elapsed() < Duration::from_millis(100), "Expected no delay after reset");
    }
}
