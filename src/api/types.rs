//! Order and instrument types shared by the gateway, feed and engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tradable instrument (exchange segment + broker token)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: String,
    pub token: String,
    pub symbol: String,
}

impl Instrument {
    pub fn new(exchange: &str, token: &str, symbol: &str) -> Self {
        Self {
            exchange: exchange.to_uppercase(),
            token: token.to_string(),
            symbol: symbol.to_string(),
        }
    }

    /// Feed subscription key, e.g. `NSE|2885`
    pub fn key(&self) -> String {
        format!("{}|{}", self.exchange, self.token)
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.symbol, self.exchange, self.token)
    }
}

/// Position direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// +1 for long, -1 for short
    pub fn sign(self) -> f64 {
        match self {
            Side::Long => 1.0,
            Side::Short => -1.0,
        }
    }

    /// Transaction code used to open the position (`B` / `S`)
    pub fn entry_code(self) -> &'static str {
        match self {
            Side::Long => "B",
            Side::Short => "S",
        }
    }

    /// Transaction code used to close the position
    pub fn exit_code(self) -> &'static str {
        match self {
            Side::Long => "S",
            Side::Short => "B",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Order pricing
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "price")]
pub enum OrderType {
    Market,
    Limit(f64),
}

impl OrderType {
    /// Noren price type code
    pub fn code(&self) -> &'static str {
        match self {
            OrderType::Market => "MKT",
            OrderType::Limit(_) => "LMT",
        }
    }

    pub fn price(&self) -> f64 {
        match self {
            OrderType::Market => 0.0,
            OrderType::Limit(p) => *p,
        }
    }
}

/// Whether an order opens or closes a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderIntent {
    Entry,
    Exit,
}

/// Order request sent to the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: Instrument,
    /// Direction of the *position*; the transaction side follows from `intent`
    pub side: Side,
    pub quantity: u32,
    pub order_type: OrderType,
    pub intent: OrderIntent,
    pub remarks: String,
}

impl OrderRequest {
    /// Buy/sell code for this order
    pub fn transaction_code(&self) -> &'static str {
        match self.intent {
            OrderIntent::Entry => self.side.entry_code(),
            OrderIntent::Exit => self.side.exit_code(),
        }
    }
}

/// Broker order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Open,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Parse a Noren status string
    pub fn from_noren(status: &str) -> Option<Self> {
        match status.trim().to_uppercase().as_str() {
            "COMPLETE" => Some(OrderStatus::Filled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "CANCELED" | "CANCELLED" => Some(OrderStatus::Cancelled),
            "OPEN" => Some(OrderStatus::Open),
            "PENDING" | "TRIGGER_PENDING" => Some(OrderStatus::Pending),
            _ => None,
        }
    }

    /// Filled, rejected or cancelled
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled)
    }
}

/// Result of a status query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub reason: Option<String>,
}

impl OrderStatusReport {
    pub fn filled(price: f64) -> Self {
        Self {
            status: OrderStatus::Filled,
            fill_price: Some(price),
            reason: None,
        }
    }

    pub fn with_status(status: OrderStatus) -> Self {
        Self {
            status,
            fill_price: None,
            reason: None,
        }
    }
}

/// Asynchronous order update from the broker
#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub order_ref: String,
    pub status: OrderStatus,
    pub fill_price: Option<f64>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OrderEvent {
    pub fn new(order_ref: &str, status: OrderStatus, fill_price: Option<f64>) -> Self {
        Self {
            order_ref: order_ref.to_string(),
            status,
            fill_price,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn filled(order_ref: &str, price: f64) -> Self {
        Self::new(order_ref, OrderStatus::Filled, Some(price))
    }

    pub fn from_report(order_ref: &str, report: &OrderStatusReport) -> Self {
        Self {
            order_ref: order_ref.to_string(),
            status: report.status,
            fill_price: report.fill_price,
            reason: report.reason.clone(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_key() {
        let inst = Instrument::new("nse", "2885", "RELIANCE-EQ");
        assert_eq!(inst.key(), "NSE|2885");
        assert_eq!(inst.to_string(), "RELIANCE-EQ (NSE:2885)");
    }

    #[test]
    fn test_transaction_codes() {
        let mut order = OrderRequest {
            instrument: Instrument::new("NSE", "22", "ACC-EQ"),
            side: Side::Short,
            quantity: 1,
            order_type: OrderType::Market,
            intent: OrderIntent::Entry,
            remarks: String::new(),
        };
        assert_eq!(order.transaction_code(), "S");
        order.intent = OrderIntent::Exit;
        assert_eq!(order.transaction_code(), "B");
    }

    #[test]
    fn test_noren_status_mapping() {
        assert_eq!(OrderStatus::from_noren("COMPLETE"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::from_noren("TRIGGER_PENDING"), Some(OrderStatus::Pending));
        assert_eq!(OrderStatus::from_noren("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::from_noren("INVALID_STATUS_TYPE"), None);
        assert!(!OrderStatus::Open.is_terminal());
    }
}
