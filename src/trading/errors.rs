//! Detailed error types for trading
//! Broker refusals, threshold violations, persistence and transport failures

use thiserror::Error;

/// Trading errors with detailed classification
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TradingError {
    /// Broker refused the order (funds, market closed, invalid instrument)
    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    /// Stop-loss / target on the wrong side of entry, or position not open
    #[error("Invalid threshold: {reason}")]
    InvalidThreshold { reason: String },

    /// Snapshot unreadable or malformed
    #[error("Persistence corrupt: {message}")]
    PersistenceCorrupt { message: String },

    /// Snapshot medium could not be read or written
    #[error("Persistence unavailable: {message}")]
    PersistenceUnavailable { message: String },

    /// Broker has no usable record of an order from a prior session
    #[error("Orphan unreconcilable: {order_ref} ({reason})")]
    OrphanUnreconcilable { order_ref: String, reason: String },

    /// Order not found at the broker
    #[error("Order not found: {order_ref}")]
    OrderNotFound { order_ref: String },

    /// No tracked position under this reference
    #[error("Position not found: {position_ref}")]
    PositionNotFound { position_ref: String },

    /// Position is in a state that does not allow the operation
    #[error("Invalid state for {position_ref}: {state}")]
    InvalidState { position_ref: String, state: String },

    /// Computed or requested quantity is not a positive integer
    #[error("Invalid quantity: {reason}")]
    InvalidQuantity { reason: String },

    /// No quote available for an instrument
    #[error("Quote unavailable: {instrument}")]
    QuoteUnavailable { instrument: String },

    /// Required parameter missing and no saved preference to fall back on
    #[error("Missing parameter: {name}")]
    MissingParameter { name: String },

    /// Market data feed could not take the request
    #[error("Feed unavailable: {message}")]
    FeedUnavailable { message: String },

    /// Rate limited by API
    #[error("Rate limited: {message}")]
    RateLimited { message: String },

    /// API error
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Connection never established; the request did not leave this host
    #[error("Broker unreachable: {message}")]
    Unreachable { message: String },

    /// Network error
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// Timeout error
    #[error("Timeout error: {operation}")]
    TimeoutError { operation: String },

    /// Engine task is gone
    #[error("Engine stopped")]
    EngineStopped,
}

impl TradingError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TradingError::RateLimited { .. }
                | TradingError::Unreachable { .. }
                | TradingError::NetworkError { .. }
                | TradingError::TimeoutError { .. }
                | TradingError::ApiError { .. }
                | TradingError::FeedUnavailable { .. }
        )
    }

    /// The broker provably never accepted the request, so sending it
    /// again cannot create a second order.
    ///
    /// Timeouts, dropped connections and unreadable replies are excluded:
    /// the order may already be working.
    pub fn is_safe_to_resend(&self) -> bool {
        matches!(
            self,
            TradingError::RateLimited { .. } | TradingError::Unreachable { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            TradingError::OrderRejected { .. } => "ORDER_REJECTED",
            TradingError::InvalidThreshold { .. } => "THRESHOLD",
            TradingError::PersistenceCorrupt { .. } => "PERSISTENCE_CORRUPT",
            TradingError::PersistenceUnavailable { .. } => "PERSISTENCE",
            TradingError::OrphanUnreconcilable { .. } => "ORPHAN",
            TradingError::OrderNotFound { .. } => "ORDER_NOT_FOUND",
            TradingError::PositionNotFound { .. } => "POSITION_NOT_FOUND",
            TradingError::InvalidState { .. } => "STATE",
            TradingError::InvalidQuantity { .. } => "QUANTITY",
            TradingError::QuoteUnavailable { .. } => "QUOTE",
            TradingError::MissingParameter { .. } => "PARAMETER",
            TradingError::FeedUnavailable { .. } => "FEED",
            TradingError::RateLimited { .. } => "RATE_LIMIT",
            TradingError::ApiError { .. } => "API",
            TradingError::Unreachable { .. } => "UNREACHABLE",
            TradingError::NetworkError { .. } => "NETWORK",
            TradingError::TimeoutError { .. } => "TIMEOUT",
            TradingError::EngineStopped => "ENGINE",
        }
    }

    pub(crate) fn invalid_threshold(reason: impl Into<String>) -> Self {
        TradingError::InvalidThreshold { reason: reason.into() }
    }
}

impl From<crate::api::ApiError> for TradingError {
    fn from(err: crate::api::ApiError) -> Self {
        use crate::api::ApiError;
        match err {
            ApiError::HttpError(e) if e.is_timeout() => TradingError::TimeoutError {
                operation: e.url().map(|u| u.path().to_string()).unwrap_or_default(),
            },
            ApiError::HttpError(e) if e.is_connect() => TradingError::Unreachable { message: e.to_string() },
            ApiError::HttpError(e) => TradingError::NetworkError { message: e.to_string() },
            ApiError::JsonError(e) => TradingError::ApiError { status: 0, message: e.to_string() },
            ApiError::ApiError { status: 429, message } => TradingError::RateLimited { message },
            ApiError::ApiError { status, message } => TradingError::ApiError { status, message },
            ApiError::RateLimited => TradingError::RateLimited { message: "Rate limited".to_string() },
        }
    }
}

/// Map broker rejection text to a hint the user can act on
pub fn classify_rejection(reason: &str) -> Option<&'static str> {
    let lower = reason.to_lowercase();

    if lower.contains("market") || lower.contains("closed") {
        Some("Market is closed. Trading hours: 9:15 AM - 3:30 PM IST")
    } else if lower.contains("insufficient") || lower.contains("fund") || lower.contains("margin") {
        Some("Insufficient funds. Check your account balance.")
    } else if lower.contains("invalid") || lower.contains("symbol") {
        Some("Invalid symbol. Try searching again.")
    } else if lower.contains("product") {
        Some("Product type issue. Check MIS/CNC settings.")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(TradingError::NetworkError { message: "reset".into() }.is_retryable());
        assert!(TradingError::RateLimited { message: "slow down".into() }.is_retryable());
        assert!(!TradingError::OrderRejected { reason: "RMS: margin".into() }.is_retryable());
        assert!(!TradingError::OrderNotFound { order_ref: "1".into() }.is_retryable());
    }

    #[test]
    fn test_only_unsent_requests_are_safe_to_resend() {
        assert!(TradingError::Unreachable { message: "connection refused".into() }.is_safe_to_resend());
        assert!(TradingError::RateLimited { message: "429".into() }.is_safe_to_resend());

        // Reached the broker, outcome unknown
        assert!(!TradingError::TimeoutError { operation: "/PlaceOrder".into() }.is_safe_to_resend());
        assert!(!TradingError::NetworkError { message: "connection reset".into() }.is_safe_to_resend());
        assert!(!TradingError::ApiError { status: 200, message: "no norenordno".into() }.is_safe_to_resend());
        assert!(!TradingError::ApiError { status: 0, message: "EOF while parsing".into() }.is_safe_to_resend());
        assert!(!TradingError::ApiError { status: 502, message: "bad gateway".into() }.is_safe_to_resend());
    }

    #[test]
    fn test_classify_rejection() {
        assert_eq!(
            classify_rejection("RMS:Margin Exceeds,Insufficient funds"),
            Some("Insufficient funds. Check your account balance.")
        );
        assert!(classify_rejection("Market is Closed").unwrap().starts_with("Market is closed"));
        assert_eq!(classify_rejection("something odd"), None);
    }

    #[test]
    fn test_api_error_conversion() {
        let err: TradingError = crate::api::ApiError::ApiError { status: 429, message: "busy".into() }.into();
        assert_eq!(err.category(), "RATE_LIMIT");

        let err: TradingError = crate::api::ApiError::ApiError { status: 502, message: "bad gateway".into() }.into();
        assert!(err.is_retryable());
    }
}
