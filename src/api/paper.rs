//! Paper broker
//! Simulation gateway: no real orders, scriptable quotes, fills and failures

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use crate::api::{
    BrokerGateway, Instrument, OrderEvent, OrderRequest, OrderStatus, OrderStatusReport, OrderType,
};
use crate::trading::events::EngineEvent;
use crate::trading::TradingError;

/// Gateway call a scripted failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperCall {
    Place,
    /// Order is accepted and recorded, then the reply is lost
    PlaceReply,
    Cancel,
    Status,
    Quote,
    Search,
}

/// Order accepted by the paper broker
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_ref: String,
    pub request: OrderRequest,
    pub timestamp: String,
}

/// In-process broker for simulation mode and tests
pub struct PaperBroker {
    quotes: RwLock<HashMap<String, f64>>,
    /// Searchable instrument master
    instruments: RwLock<Vec<Instrument>>,
    orders: RwLock<HashMap<String, OrderStatusReport>>,
    placed: RwLock<Vec<PlacedOrder>>,
    failures: Mutex<HashMap<PaperCall, VecDeque<TradingError>>>,
    auto_fill: bool,
    events: Option<mpsc::Sender<EngineEvent>>,
}

impl PaperBroker {
    /// Create new paper broker; orders stay open until filled by hand
    pub fn new() -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            instruments: RwLock::new(Vec::new()),
            orders: RwLock::new(HashMap::new()),
            placed: RwLock::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            auto_fill: false,
            events: None,
        }
    }

    /// Deliver order updates into the engine queue
    pub fn with_events(mut self, events: mpsc::Sender<EngineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Fill market orders at the current quote as soon as they are placed
    pub fn with_auto_fill(mut self, auto_fill: bool) -> Self {
        self.auto_fill = auto_fill;
        self
    }

    /// Set the quote and make the instrument searchable
    pub async fn set_quote(&self, instrument: &Instrument, price: f64) {
        self.add_instrument(instrument.clone()).await;
        self.quotes.write().await.insert(instrument.key(), price);
    }

    pub async fn add_instrument(&self, instrument: Instrument) {
        let mut instruments = self.instruments.write().await;
        if !instruments.contains(&instrument) {
            instruments.push(instrument);
        }
    }

    /// Set the quote by feed key (`NSE|2885`)
    pub async fn set_quote_key(&self, instrument_key: &str, price: f64) {
        self.quotes.write().await.insert(instrument_key.to_string(), price);
    }

    /// Queue an error for the next call of `call`
    pub async fn fail_next(&self, call: PaperCall, error: TradingError) {
        self.failures.lock().await.entry(call).or_default().push_back(error);
    }

    /// Override what `get_order_status` reports for an order
    pub async fn set_order_status(&self, order_ref: &str, report: OrderStatusReport) {
        self.orders.write().await.insert(order_ref.to_string(), report);
    }

    /// Mark an order filled and return the matching event
    pub async fn fill(&self, order_ref: &str, price: f64) -> OrderEvent {
        self.set_order_status(order_ref, OrderStatusReport::filled(price)).await;
        info!("[SIMULATION] Order {} filled @ {}", order_ref, price);
        OrderEvent::filled(order_ref, price)
    }

    /// Mark an order rejected and return the matching event
    pub async fn reject(&self, order_ref: &str, reason: &str) -> OrderEvent {
        let report = OrderStatusReport {
            status: OrderStatus::Rejected,
            fill_price: None,
            reason: Some(reason.to_string()),
        };
        self.set_order_status(order_ref, report.clone()).await;
        OrderEvent::from_report(order_ref, &report)
    }

    /// All orders placed so far, oldest first
    pub async fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.placed.read().await.clone()
    }

    async fn take_failure(&self, call: PaperCall) -> Result<(), TradingError> {
        match self.failures.lock().await.get_mut(&call).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!("[SIMULATION] Scripted {:?} failure: {}", call, error);
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn emit(&self, event: OrderEvent) {
        if let Some(events) = &self.events {
            let events = events.clone();
            // Sent from a task so a full queue never blocks the caller
            tokio::spawn(async move {
                let _ = events.send(EngineEvent::Order(event)).await;
            });
        }
    }
}

impl Default for PaperBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn place_order(&self, order: &OrderRequest) -> Result<String, TradingError> {
        self.take_failure(PaperCall::Place).await?;

        let order_ref = format!("PAPER-{}", uuid::Uuid::new_v4().simple());
        info!(
            "[SIMULATION] {} {} x{} {} ({})",
            order.transaction_code(),
            order.instrument.symbol,
            order.quantity,
            order.order_type.code(),
            order_ref
        );

        self.placed.write().await.push(PlacedOrder {
            order_ref: order_ref.clone(),
            request: order.clone(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        });
        self.set_order_status(&order_ref, OrderStatusReport::with_status(OrderStatus::Open))
            .await;
        self.take_failure(PaperCall::PlaceReply).await?;

        if self.auto_fill && order.order_type == OrderType::Market {
            let quote = self.quotes.read().await.get(&order.instrument.key()).copied();
            if let Some(price) = quote {
                let event = self.fill(&order_ref, price).await;
                self.emit(event);
            }
        }

        Ok(order_ref)
    }

    async fn cancel_order(&self, order_ref: &str) -> Result<(), TradingError> {
        self.take_failure(PaperCall::Cancel).await?;

        let mut orders = self.orders.write().await;
        match orders.get_mut(order_ref) {
            Some(report) if !report.status.is_terminal() => {
                report.status = OrderStatus::Cancelled;
                drop(orders);
                info!("[SIMULATION] Order {} cancelled", order_ref);
                self.emit(OrderEvent::new(order_ref, OrderStatus::Cancelled, None));
                Ok(())
            }
            _ => Err(TradingError::OrderNotFound {
                order_ref: order_ref.to_string(),
            }),
        }
    }

    async fn get_order_status(&self, order_ref: &str) -> Result<OrderStatusReport, TradingError> {
        self.take_failure(PaperCall::Status).await?;

        self.orders
            .read()
            .await
            .get(order_ref)
            .cloned()
            .ok_or_else(|| TradingError::OrderNotFound {
                order_ref: order_ref.to_string(),
            })
    }

    async fn get_quote(&self, instrument: &Instrument) -> Result<f64, TradingError> {
        self.take_failure(PaperCall::Quote).await?;

        self.quotes
            .read()
            .await
            .get(&instrument.key())
            .copied()
            .ok_or_else(|| TradingError::QuoteUnavailable {
                instrument: instrument.to_string(),
            })
    }

    /// Case-sensitive substring match on the trading symbol, like the live search
    async fn search_symbol(&self, exchange: &str, text: &str) -> Result<Vec<Instrument>, TradingError> {
        self.take_failure(PaperCall::Search).await?;

        Ok(self
            .instruments
            .read()
            .await
            .iter()
            .filter(|i| i.exchange.eq_ignore_ascii_case(exchange) && i.symbol.contains(text))
            .cloned()
            .collect())
    }
}
