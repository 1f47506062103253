//! Broker gateway
//! Order placement, cancellation, status lookup and quotes

pub mod broker;
pub mod paper;
pub mod types;

pub use broker::{Credentials, NorenRestClient};
pub use paper::{PaperBroker, PaperCall, PlacedOrder};
pub use types::{
    Instrument, OrderEvent, OrderIntent, OrderRequest, OrderStatus, OrderStatusReport, OrderType, Side,
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::trading::TradingError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Rate limited")]
    RateLimited,
}

/// Broker operations the lifecycle engine depends on.
///
/// Fills, rejections and cancellations are delivered asynchronously as
/// [`OrderEvent`]s through the engine's event queue, not as return values.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Submit an order, returning the broker's order reference
    async fn place_order(&self, order: &OrderRequest) -> Result<String, TradingError>;

    /// Cancel a working order
    async fn cancel_order(&self, order_ref: &str) -> Result<(), TradingError>;

    /// Authoritative status of an order
    async fn get_order_status(&self, order_ref: &str) -> Result<OrderStatusReport, TradingError>;

    /// Last traded price for an instrument
    async fn get_quote(&self, instrument: &Instrument) -> Result<f64, TradingError>;

    /// Instruments on `exchange` whose name matches `text`; empty when none do
    async fn search_symbol(&self, exchange: &str, text: &str) -> Result<Vec<Instrument>, TradingError>;
}

/// Exchanges tried, in order, when resolving a name
pub const SEARCH_EXCHANGES: [&str; 2] = ["NSE", "BSE"];

/// Resolve a name the user typed: NSE then BSE, as typed then upper-cased.
///
/// The first non-empty answer wins. An error is returned only when no
/// attempt found anything and at least one failed.
pub async fn search_instruments(broker: &dyn BrokerGateway, text: &str) -> Result<Vec<Instrument>, TradingError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let upper = text.to_uppercase();
    let mut last_error = None;

    for exchange in SEARCH_EXCHANGES {
        let mut variants = vec![text];
        if upper != text {
            variants.push(upper.as_str());
        }
        for variant in variants {
            match broker.search_symbol(exchange, variant).await {
                Ok(found) if !found.is_empty() => return Ok(found),
                Ok(_) => debug!("No {} matches for {:?}", exchange, variant),
                Err(err) => {
                    warn!("Symbol search on {} for {:?} failed: {}", exchange, variant, err);
                    last_error = Some(err);
                }
            }
        }
    }

    match last_error {
        Some(err) => Err(err),
        None => Ok(Vec::new()),
    }
}

/// Noren sends numbers as strings; accept both
pub(crate) fn number_field(value: &serde_json::Value, key: &str) -> Option<f64> {
    match value.get(key)? {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Sanitize API error message to avoid leaking sensitive information
/// In production, returns generic error message
/// In debug mode, returns detailed error
pub fn sanitize_api_error(status: u16, detailed_message: String) -> ApiError {
    if cfg!(not(debug_assertions)) && status >= 500 {
        tracing::error!("API error {}: {}", status, detailed_message);
        return ApiError::ApiError {
            status,
            message: "Internal server error".to_string(),
        };
    }

    let safe_message = if detailed_message.len() > 500 {
        let cut = (0..=500)
            .rev()
            .find(|i| detailed_message.is_char_boundary(*i))
            .unwrap_or(0);
        format!("{}... (truncated)", &detailed_message[..cut])
    } else {
        detailed_message
    };

    ApiError::ApiError {
        status,
        message: safe_message,
    }
}
