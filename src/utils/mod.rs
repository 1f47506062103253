//! Utility modules

pub mod rate_limiter;
pub mod retry;

pub use rate_limiter::RateLimiter;
pub use retry::{retry_if, RetryConfig};

/// Round a price or P&L to two decimals (paise)
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
