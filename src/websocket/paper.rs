//! Paper market feed
//! Records subscriptions and injects ticks by hand

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use super::MarketFeed;
use crate::api::Instrument;
use crate::trading::events::{EngineEvent, Tick};
use crate::trading::TradingError;

/// In-process feed for simulation mode and tests
pub struct PaperFeed {
    subscribed: RwLock<BTreeSet<String>>,
    events: Option<mpsc::Sender<EngineEvent>>,
    available: AtomicBool,
}

impl PaperFeed {
    /// Create new feed with no event sink
    pub fn new() -> Self {
        Self {
            subscribed: RwLock::new(BTreeSet::new()),
            events: None,
            available: AtomicBool::new(true),
        }
    }

    /// Feed that forwards pushed ticks into the engine queue
    pub fn with_events(events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            events: Some(events),
            ..Self::new()
        }
    }

    /// Make subscribe calls fail as if the stream were down
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn is_subscribed(&self, instrument: &Instrument) -> bool {
        self.subscribed.read().await.contains(&instrument.key())
    }

    /// Send a tick for a subscribed key; unsubscribed keys are dropped
    pub async fn push_tick(&self, instrument_key: &str, price: f64) -> bool {
        if !self.subscribed.read().await.contains(instrument_key) {
            debug!("Paper tick for unsubscribed {} dropped", instrument_key);
            return false;
        }
        match &self.events {
            Some(events) => events
                .send(EngineEvent::Tick(Tick::new(instrument_key, price)))
                .await
                .is_ok(),
            None => false,
        }
    }
}

impl Default for PaperFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketFeed for PaperFeed {
    async fn subscribe(&self, instrument: &Instrument) -> Result<(), TradingError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(TradingError::FeedUnavailable {
                message: "paper feed offline".to_string(),
            });
        }
        self.subscribed.write().await.insert(instrument.key());
        Ok(())
    }

    async fn unsubscribe(&self, instrument: &Instrument) -> Result<(), TradingError> {
        self.subscribed.write().await.remove(&instrument.key());
        Ok(())
    }
}
