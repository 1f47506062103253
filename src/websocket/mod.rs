//! Market data feed
//! Subscription contract, ref-counted subscriptions and the Noren wire parser

pub mod noren;
pub mod paper;

pub use noren::NorenFeed;
pub use paper::PaperFeed;

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

use crate::api::{number_field, Instrument, OrderEvent, OrderStatus};
use crate::trading::events::Tick;
use crate::trading::TradingError;

/// Streaming price source.
///
/// Ticks for subscribed instruments are delivered into the engine queue
/// as `EngineEvent::Tick`, keyed by [`Instrument::key`].
#[async_trait]
pub trait MarketFeed: Send + Sync {
    async fn subscribe(&self, instrument: &Instrument) -> Result<(), TradingError>;
    async fn unsubscribe(&self, instrument: &Instrument) -> Result<(), TradingError>;
}

/// Reference counts per instrument key.
///
/// Several positions on one instrument share a single feed subscription;
/// the feed is only told to subscribe on the first holder and to
/// unsubscribe when the last one releases.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    counts: HashMap<String, usize>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference; true when this is the first holder
    pub fn acquire(&mut self, key: &str) -> bool {
        let count = self.counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Drop a reference; true when the last holder released it
    pub fn release(&mut self, key: &str) -> bool {
        match self.counts.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.counts.remove(key);
                true
            }
            None => false,
        }
    }

    pub fn holders(&self, key: &str) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

/// Decoded feed frame
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Tick(Tick),
    Order(OrderEvent),
    /// Connection / subscription acknowledgement (`ck`, `ok`, `uk`)
    Ack(String),
}

/// Parse one Noren websocket text frame.
///
/// `tk`/`tf` frames carrying `lp` become ticks, `om` frames become order
/// events. Anything else (including touchline updates without a last
/// price) yields `None`.
pub fn parse_feed_message(text: &str) -> Option<FeedMessage> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    let kind = value.get("t")?.as_str()?;

    match kind {
        "tk" | "tf" => {
            let exchange = value.get("e")?.as_str()?;
            let token = value.get("tk")?.as_str()?;
            let price = number_field(&value, "lp")?;
            if price <= 0.0 {
                return None;
            }
            let mut tick = Tick::new(format!("{}|{}", exchange.to_uppercase(), token), price);
            if let Some(ts) = value
                .get("ft")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<i64>().ok())
                .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            {
                tick.timestamp = ts;
            }
            Some(FeedMessage::Tick(tick))
        }
        "om" => {
            let order_ref = value.get("norenordno")?.as_str()?;
            let raw_status = value.get("status")?.as_str()?;
            let Some(status) = OrderStatus::from_noren(raw_status) else {
                debug!("Unhandled order status {} for {}", raw_status, order_ref);
                return None;
            };
            let fill_price = number_field(&value, "flprc")
                .or_else(|| number_field(&value, "avgprc"))
                .filter(|p| *p > 0.0);
            let mut event = OrderEvent::new(order_ref, status, fill_price);
            event.reason = value
                .get("rejreason")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            Some(FeedMessage::Order(event))
        }
        "ck" | "ok" | "uk" | "ak" => Some(FeedMessage::Ack(kind.to_string())),
        _ => None,
    }
}
