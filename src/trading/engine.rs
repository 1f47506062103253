//! Trade lifecycle engine
//! Single owner of the active position set: entries, fills, exits, thresholds

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::{BrokerGateway, Instrument, OrderEvent, OrderIntent, OrderRequest, OrderStatus, OrderType};
use crate::config::PreferencesManager;
use crate::trading::events::{ExitRequest, Notification, OpenRequest, PositionView, Sizing, StatusReport};
use crate::trading::exit_manager::{check_exit, log_check};
use crate::trading::position::{ExitReason, NewPosition, OrphanedLeg, Position, PositionState, Thresholds};
use crate::trading::stats::TradingStats;
use crate::trading::store::PositionStore;
use crate::trading::trade_history::{ClosedTrade, CloseOutcome, TradeHistory};
use crate::trading::TradingError;
use crate::utils::{retry_if, RetryConfig};
use crate::websocket::{MarketFeed, SubscriptionSet};

/// Closed trades shown in a status report
const RECENT_TRADES: usize = 5;

/// Reference shown for an order the broker never acknowledged
const UNCONFIRMED: &str = "unconfirmed";

/// Engine tuning
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Backoff for broker and feed calls
    pub retry: RetryConfig,
    /// Snapshot records older than this are dropped on load
    pub stale_after: Duration,
    /// Remarks attached to entry orders
    pub entry_remarks: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            stale_after: Duration::hours(24),
            entry_remarks: "OE-Entry".to_string(),
        }
    }
}

/// Trade lifecycle engine.
///
/// Every mutation goes through `&mut self`, so the runner that owns the
/// engine is the only writer. A position leaves `OPEN` before any exit
/// order is awaited, which is what keeps exits single-flight.
pub struct TradeEngine {
    pub(crate) broker: Arc<dyn BrokerGateway>,
    feed: Arc<dyn MarketFeed>,
    pub(crate) store: PositionStore,
    history: TradeHistory,
    preferences: PreferencesManager,
    pub(crate) settings: EngineSettings,
    /// Keyed by entry order reference
    pub(crate) positions: BTreeMap<String, Position>,
    /// Exit order reference -> entry order reference
    pub(crate) exit_orders: HashMap<String, String>,
    subscriptions: SubscriptionSet,
    /// Positions currently holding a feed subscription
    subscribed: HashSet<String>,
    last_prices: HashMap<String, f64>,
    pub(crate) stats: TradingStats,
    notifier: Option<mpsc::UnboundedSender<Notification>>,
}

impl TradeEngine {
    /// Create new engine with an empty position set
    pub fn new(
        broker: Arc<dyn BrokerGateway>,
        feed: Arc<dyn MarketFeed>,
        store: PositionStore,
        history: TradeHistory,
        preferences: PreferencesManager,
        settings: EngineSettings,
    ) -> Self {
        Self {
            broker,
            feed,
            store,
            history,
            preferences,
            settings,
            positions: BTreeMap::new(),
            exit_orders: HashMap::new(),
            subscriptions: SubscriptionSet::new(),
            subscribed: HashSet::new(),
            last_prices: HashMap::new(),
            stats: TradingStats::new(),
            notifier: None,
        }
    }

    /// Deliver notifications to the command surface
    pub fn with_notifier(mut self, notifier: mpsc::UnboundedSender<Notification>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn position(&self, position_ref: &str) -> Option<&Position> {
        self.positions.get(position_ref)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn is_subscribed(&self, position_ref: &str) -> bool {
        self.subscribed.contains(position_ref)
    }

    pub fn stats(&self) -> &TradingStats {
        &self.stats
    }

    pub fn last_price(&self, instrument: &Instrument) -> Option<f64> {
        self.last_prices.get(&instrument.key()).copied()
    }

    /// Submit an entry order and track the position until it fills
    pub async fn open_position(&mut self, request: OpenRequest) -> Result<PositionView, TradingError> {
        let preferences = self.preferences.get().await;

        let stop_loss_pct = request
            .stop_loss_pct
            .or(preferences.stop_loss_pct)
            .ok_or_else(|| missing("stop_loss_pct"))?;
        let target_pct = request
            .target_pct
            .or(preferences.target_pct)
            .ok_or_else(|| missing("target_pct"))?;

        let reference_price = match request.order_type {
            OrderType::Limit(price) if price.is_finite() && price > 0.0 => price,
            OrderType::Limit(price) => {
                return Err(TradingError::OrderRejected {
                    reason: format!("invalid limit price {}", price),
                })
            }
            OrderType::Market => self.quote(&request.instrument).await?,
        };

        let quantity = match request.sizing {
            Sizing::Quantity(quantity) => quantity,
            Sizing::Capital(capital) => quantity_for(capital, reference_price)?,
            Sizing::Default => quantity_for(preferences.capital.ok_or_else(|| missing("capital"))?, reference_price)?,
        };
        if quantity == 0 {
            return Err(TradingError::InvalidQuantity {
                reason: "quantity must be positive".to_string(),
            });
        }

        // Refuse locally before anything reaches the broker
        let thresholds = Thresholds::from_percentages(request.side, reference_price, stop_loss_pct, target_pct)?;

        let order = OrderRequest {
            instrument: request.instrument.clone(),
            side: request.side,
            quantity,
            order_type: request.order_type,
            intent: OrderIntent::Entry,
            remarks: self.settings.entry_remarks.clone(),
        };

        info!(
            "📤 Placing {} entry {} x{} @ {} ({}) SL {} TGT {}",
            request.side,
            request.instrument,
            quantity,
            reference_price,
            request.order_type.code(),
            thresholds.stop_loss,
            thresholds.target
        );
        self.stats.record_entry_placed();

        let order_ref = match self.place_order(&order, "Place entry order").await {
            Ok(order_ref) => order_ref,
            Err(err) => {
                warn!("❌ Entry for {} failed: {}", request.instrument.symbol, err);
                if let TradingError::OrderRejected { reason } = &err {
                    self.stats.record_entry_rejected();
                    self.notify(Notification::EntryRejected {
                        order_ref: None,
                        symbol: request.instrument.symbol.clone(),
                        reason: reason.clone(),
                    });
                } else {
                    self.stats.record_error();
                    if !err.is_safe_to_resend() && err.is_retryable() {
                        self.notify(Notification::ManualAttention {
                            order_ref: UNCONFIRMED.to_string(),
                            symbol: request.instrument.symbol.clone(),
                            message: format!(
                                "entry may have reached the broker ({}); check the order book before retrying",
                                err
                            ),
                        });
                    }
                }
                return Err(err);
            }
        };

        let position = match Position::awaiting_entry(NewPosition {
            order_ref: order_ref.clone(),
            instrument: request.instrument,
            side: request.side,
            quantity,
            reference_price,
            stop_loss_pct,
            target_pct,
        }) {
            Ok(position) => position,
            Err(err) => {
                error!("Broker accepted order {:?} but it cannot be tracked: {}", order_ref, err);
                self.notify(Notification::ManualAttention {
                    order_ref: order_ref.clone(),
                    symbol: order.instrument.symbol.clone(),
                    message: format!("order placed but not tracked: {}", err),
                });
                return Err(err);
            }
        };

        let view = PositionView::of(&position, self.last_price(&position.instrument));
        self.notify(Notification::EntryPlaced {
            order_ref: order_ref.clone(),
            symbol: position.instrument.symbol.clone(),
            side: position.side,
            quantity,
            reference_price,
            stop_loss: position.stop_loss,
            target: position.target,
        });
        info!("⏳ Awaiting entry fill for {} ({})", order_ref, position.instrument.symbol);

        self.positions.insert(order_ref, position);
        self.checkpoint();
        Ok(view)
    }

    /// Apply a broker order update. Unknown references are ignored.
    pub async fn on_order_event(&mut self, event: OrderEvent) {
        if self.positions.contains_key(&event.order_ref) {
            self.apply_entry_event(event).await;
        } else if let Some(position_ref) = self.exit_orders.get(&event.order_ref).cloned() {
            self.apply_exit_event(position_ref, event).await;
        } else {
            debug!("Ignoring {:?} event for unknown order {}", event.status, event.order_ref);
        }
    }

    async fn apply_entry_event(&mut self, event: OrderEvent) {
        let Some(position) = self.positions.get_mut(&event.order_ref) else {
            return;
        };
        let awaiting = matches!(
            position.state,
            PositionState::AwaitingEntryFill | PositionState::Orphaned(OrphanedLeg::Entry)
        );

        match event.status {
            OrderStatus::Filled if awaiting => {
                let price = event.fill_price.unwrap_or(position.entry_price);
                self.complete_entry(&event.order_ref, price, event.timestamp).await;
            }
            OrderStatus::Rejected | OrderStatus::Cancelled if awaiting => {
                self.discard_entry(&event.order_ref, event.status, event.reason);
            }
            OrderStatus::Pending | OrderStatus::Open if position.state == PositionState::Orphaned(OrphanedLeg::Entry) => {
                info!("⏳ Entry {} still working at broker, waiting for fill", event.order_ref);
                position.state = PositionState::AwaitingEntryFill;
                self.checkpoint();
            }
            status => debug!(
                "Ignoring {:?} for entry {} in state {}",
                status, event.order_ref, position.state
            ),
        }
    }

    async fn complete_entry(&mut self, position_ref: &str, price: f64, filled_at: DateTime<Utc>) {
        let Some(position) = self.positions.get_mut(position_ref) else {
            return;
        };

        if let Err(err) = position.fill_entry(price, filled_at) {
            // No valid levels exist at this fill price; flatten, never monitor
            error!("🚨 Entry {} filled at {} but thresholds are invalid: {}", position_ref, price, err);
            position.fill_unprotected(price, filled_at);
            let symbol = position.instrument.symbol.clone();
            self.stats.record_entry_filled();
            self.checkpoint();
            self.notify(Notification::ManualAttention {
                order_ref: position_ref.to_string(),
                symbol,
                message: format!("filled at {:.2} with invalid thresholds ({}); exiting", price, err),
            });
            match self.submit_exit(position_ref, ExitReason::Manual, price).await {
                Ok(exit_ref) => info!("📤 Unprotected {} flattening via {}", position_ref, exit_ref),
                Err(err) => error!("🆘 Unprotected {} could not be flattened: {}", position_ref, err),
            }
            return;
        }

        let notification = Notification::EntryFilled {
            order_ref: position_ref.to_string(),
            symbol: position.instrument.symbol.clone(),
            price,
            stop_loss: position.stop_loss,
            target: position.target,
        };
        info!(
            "🟢 Entry {} filled at {} | SL {} | TGT {}",
            position_ref, price, position.stop_loss, position.target
        );

        self.stats.record_entry_filled();
        self.subscribe_position(position_ref).await;
        self.checkpoint();
        self.notify(notification);
    }

    fn discard_entry(&mut self, position_ref: &str, status: OrderStatus, reason: Option<String>) {
        let Some(position) = self.positions.remove(position_ref) else {
            return;
        };
        let symbol = position.instrument.symbol.clone();

        if status == OrderStatus::Rejected {
            let reason = reason.unwrap_or_else(|| "rejected by broker".to_string());
            warn!("❌ Entry {} for {} rejected: {}", position_ref, symbol, reason);
            self.stats.record_entry_rejected();
            self.notify(Notification::EntryRejected {
                order_ref: Some(position_ref.to_string()),
                symbol,
                reason,
            });
        } else {
            info!("🚫 Entry {} for {} cancelled", position_ref, symbol);
            self.notify(Notification::EntryCancelled {
                order_ref: position_ref.to_string(),
                symbol,
            });
        }
        self.checkpoint();
    }

    async fn apply_exit_event(&mut self, position_ref: String, event: OrderEvent) {
        let Some(position) = self.positions.get_mut(&position_ref) else {
            self.exit_orders.remove(&event.order_ref);
            return;
        };
        let awaiting = matches!(
            position.state,
            PositionState::AwaitingExitFill | PositionState::Orphaned(OrphanedLeg::Exit)
        );

        match event.status {
            OrderStatus::Filled if awaiting => {
                let price = event
                    .fill_price
                    .or(position.exit.as_ref().map(|e| e.trigger_price))
                    .unwrap_or(position.entry_price);
                self.close_position(&position_ref, price, event.timestamp).await;
            }
            OrderStatus::Rejected | OrderStatus::Cancelled if awaiting => {
                let reason = event.reason.unwrap_or_else(|| format!("{:?}", event.status).to_lowercase());
                warn!(
                    "⚠️ Exit {} for {} refused ({}), back to monitoring",
                    event.order_ref, position_ref, reason
                );
                let monitored = position.abort_exit();
                let symbol = position.instrument.symbol.clone();
                self.exit_orders.remove(&event.order_ref);
                self.stats.record_exit_failed();
                if monitored {
                    self.subscribe_position(&position_ref).await;
                    self.checkpoint();
                    self.notify(Notification::ExitFailed {
                        order_ref: position_ref,
                        symbol,
                        reason,
                    });
                } else {
                    self.checkpoint();
                    self.notify(unprotected_exit_failed(position_ref, symbol, &reason));
                }
            }
            OrderStatus::Pending | OrderStatus::Open if position.state == PositionState::Orphaned(OrphanedLeg::Exit) => {
                info!("⏳ Exit {} still working at broker", event.order_ref);
                position.state = PositionState::AwaitingExitFill;
                self.checkpoint();
            }
            status => debug!(
                "Ignoring {:?} for exit {} of {} in state {}",
                status, event.order_ref, position_ref, position.state
            ),
        }
    }

    /// Remove a filled-out position and record the trade
    async fn close_position(&mut self, position_ref: &str, exit_price: f64, closed_at: DateTime<Utc>) {
        let Some(mut position) = self.positions.remove(position_ref) else {
            return;
        };
        let exit_order_ref = position.exit_order_ref().map(str::to_string);
        if let Some(exit_ref) = &exit_order_ref {
            self.exit_orders.remove(exit_ref);
        }
        self.unsubscribe_position(position_ref, &position.instrument).await;

        let pnl = position.pnl_at(exit_price);
        let outcome = position.fill_type().map(CloseOutcome::from).unwrap_or(CloseOutcome::Manual);
        position.state = PositionState::Closed;

        let trade = ClosedTrade {
            order_ref: position.order_ref.clone(),
            exit_order_ref,
            instrument: position.instrument.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price: Some(exit_price),
            pnl: Some(pnl),
            outcome,
            entry_time: position.entry_time,
            closed_at,
        };

        info!(
            "✅ {} closed at {} ({}), PnL {:.2}",
            position_ref, exit_price, outcome, pnl
        );
        self.stats.record_close(pnl);
        self.record_trade(trade.clone());
        self.checkpoint();
        self.notify(Notification::PositionClosed(trade));
    }

    /// Evaluate a tick against every monitored position on that instrument
    pub async fn on_price_tick(&mut self, instrument_key: &str, price: f64) {
        if !price.is_finite() || price <= 0.0 {
            warn!("Ignoring invalid tick {} for {}", price, instrument_key);
            return;
        }
        self.last_prices.insert(instrument_key.to_string(), price);
        self.stats.record_tick();

        let breaches: Vec<(String, ExitReason)> = self
            .positions
            .values()
            .filter(|p| p.is_open() && self.subscribed.contains(&p.order_ref) && p.instrument.key() == instrument_key)
            .filter_map(|p| {
                let check = check_exit(p, price);
                log_check(p, price, &check);
                check.reason.map(|reason| (p.order_ref.clone(), reason))
            })
            .collect();

        for (position_ref, reason) in breaches {
            if let Err(err) = self.submit_exit(&position_ref, reason, price).await {
                debug!("Exit for {} not submitted: {}", position_ref, err);
            }
        }
    }

    /// Replace an open position's thresholds; unset values keep their percentage
    pub fn update_thresholds(
        &mut self,
        position_ref: &str,
        stop_loss_pct: Option<f64>,
        target_pct: Option<f64>,
    ) -> Result<PositionView, TradingError> {
        let position = self
            .positions
            .get_mut(position_ref)
            .ok_or_else(|| TradingError::PositionNotFound {
                position_ref: position_ref.to_string(),
            })?;

        if !position.is_open() {
            return Err(TradingError::invalid_threshold(format!(
                "{} is {}, thresholds can only change while OPEN",
                position_ref, position.state
            )));
        }

        let stop_loss_pct = stop_loss_pct.unwrap_or(position.stop_loss_pct);
        let target_pct = target_pct.unwrap_or(position.target_pct);
        let thresholds = position.set_thresholds(stop_loss_pct, target_pct)?;
        info!(
            "📝 {} thresholds updated: SL {} ({}%) TGT {} ({}%)",
            position_ref, thresholds.stop_loss, stop_loss_pct, thresholds.target, target_pct
        );

        let view = PositionView::of(position, self.last_prices.get(&position.instrument.key()).copied());
        self.checkpoint();
        Ok(view)
    }

    /// Exit at market. A second call while the exit is in flight is a no-op.
    pub async fn manual_exit(&mut self, position_ref: &str) -> Result<ExitRequest, TradingError> {
        let position = self
            .positions
            .get(position_ref)
            .ok_or_else(|| TradingError::PositionNotFound {
                position_ref: position_ref.to_string(),
            })?;

        let state = position.state;
        let exit_known = position.exit_order_ref().is_some();
        let trigger = self.last_price(&position.instrument).unwrap_or(position.entry_price);

        match state {
            PositionState::AwaitingExitFill => {
                info!("Exit already in flight for {}", position_ref);
                Ok(ExitRequest::AlreadyExiting)
            }
            PositionState::Orphaned(OrphanedLeg::Exit) if exit_known => Ok(ExitRequest::AlreadyExiting),
            PositionState::Open | PositionState::Orphaned(OrphanedLeg::Exit) => {
                let order_ref = self.submit_exit(position_ref, ExitReason::Manual, trigger).await?;
                Ok(ExitRequest::Submitted { order_ref })
            }
            state => Err(TradingError::InvalidState {
                position_ref: position_ref.to_string(),
                state: format!("{} (entry not filled; cancel it instead)", state),
            }),
        }
    }

    /// Ask the broker to cancel a pending entry.
    ///
    /// The position is removed when the cancellation event arrives.
    pub async fn cancel_entry(&mut self, position_ref: &str) -> Result<(), TradingError> {
        let position = self
            .positions
            .get(position_ref)
            .ok_or_else(|| TradingError::PositionNotFound {
                position_ref: position_ref.to_string(),
            })?;

        if !matches!(
            position.state,
            PositionState::AwaitingEntryFill | PositionState::Orphaned(OrphanedLeg::Entry)
        ) {
            return Err(TradingError::InvalidState {
                position_ref: position_ref.to_string(),
                state: position.state.to_string(),
            });
        }

        let broker = Arc::clone(&self.broker);
        retry_if("Cancel order", &self.settings.retry, TradingError::is_retryable, || {
            let broker = Arc::clone(&broker);
            async move { broker.cancel_order(position_ref).await }
        })
        .await?;

        info!("🚫 Cancel requested for entry {}", position_ref);
        Ok(())
    }

    /// Active positions with marks, plus realised totals
    pub fn status(&self) -> StatusReport {
        let trades = self.history.load();
        StatusReport {
            positions: self
                .positions
                .values()
                .map(|p| PositionView::of(p, self.last_price(&p.instrument)))
                .collect(),
            realized_pnl: trades.iter().filter_map(|t| t.pnl).sum(),
            closed_trades: trades.len(),
            recent_trades: trades.iter().rev().take(RECENT_TRADES).cloned().collect(),
            stats: self.stats.clone(),
        }
    }

    /// Write the whole active set to the store
    pub fn persist(&self) -> Result<(), TradingError> {
        self.store.persist(self.positions.values())
    }

    /// Subscribe open positions whose subscription failed earlier
    pub async fn ensure_subscriptions(&mut self) {
        let missing: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.is_open() && !self.subscribed.contains(&p.order_ref))
            .map(|p| p.order_ref.clone())
            .collect();

        for position_ref in missing {
            self.subscribe_position(&position_ref).await;
        }
    }

    /// Move to `AwaitingExitFill` and submit the exit order.
    ///
    /// Refusals return the position to `OPEN` unless it is unprotected.
    /// An unconfirmed outcome (timeout, dropped reply) is never resent and
    /// leaves the position orphaned on the exit leg for reconciliation.
    pub(crate) async fn submit_exit(
        &mut self,
        position_ref: &str,
        reason: ExitReason,
        trigger_price: f64,
    ) -> Result<String, TradingError> {
        let (order, symbol) = {
            let position = self
                .positions
                .get_mut(position_ref)
                .ok_or_else(|| TradingError::PositionNotFound {
                    position_ref: position_ref.to_string(),
                })?;
            position.begin_exit(reason, trigger_price);
            (position.exit_order(reason), position.instrument.symbol.clone())
        };
        self.checkpoint();
        self.stats.record_exit_placed();

        info!("📤 Placing exit for {} ({}) at ~{}", position_ref, reason, trigger_price);
        let result = self.place_order(&order, "Place exit order").await;

        let Some(position) = self.positions.get_mut(position_ref) else {
            return result;
        };

        match result {
            Ok(exit_ref) => {
                if let Some(exit) = position.exit.as_mut() {
                    exit.order_ref = Some(exit_ref.clone());
                }
                self.exit_orders.insert(exit_ref.clone(), position_ref.to_string());
                self.checkpoint();
                self.notify(Notification::ExitTriggered {
                    order_ref: exit_ref.clone(),
                    symbol,
                    reason,
                    price: trigger_price,
                });
                Ok(exit_ref)
            }
            Err(err) if err.is_retryable() => {
                // Ambiguous outcomes are never resent; the order may be working
                error!("🆘 Exit for {} unconfirmed: {}", position_ref, err);
                position.state = PositionState::Orphaned(OrphanedLeg::Exit);
                self.stats.record_exit_failed();
                self.checkpoint();
                self.notify(Notification::ManualAttention {
                    order_ref: position_ref.to_string(),
                    symbol,
                    message: format!(
                        "exit order could not be confirmed ({}); check the broker before exiting again",
                        err
                    ),
                });
                Err(err)
            }
            Err(err) => {
                warn!("⚠️ Exit for {} refused: {}", position_ref, err);
                let monitored = position.abort_exit();
                self.stats.record_exit_failed();
                self.checkpoint();
                if monitored {
                    self.notify(Notification::ExitFailed {
                        order_ref: position_ref.to_string(),
                        symbol,
                        reason: err.to_string(),
                    });
                } else {
                    self.notify(unprotected_exit_failed(position_ref.to_string(), symbol, &err.to_string()));
                }
                Err(err)
            }
        }
    }

    pub(crate) async fn subscribe_position(&mut self, position_ref: &str) {
        if self.subscribed.contains(position_ref) {
            return;
        }
        let Some(instrument) = self.positions.get(position_ref).map(|p| p.instrument.clone()) else {
            return;
        };
        let key = instrument.key();

        if self.subscriptions.acquire(&key) {
            let feed = Arc::clone(&self.feed);
            let result = retry_if("Subscribe", &self.settings.retry, TradingError::is_retryable, || {
                let feed = Arc::clone(&feed);
                let instrument = instrument.clone();
                async move { feed.subscribe(&instrument).await }
            })
            .await;

            if let Err(err) = result {
                self.subscriptions.release(&key);
                self.stats.record_error();
                error!("❌ Could not subscribe {} for {}: {}", key, position_ref, err);
                self.notify(Notification::ManualAttention {
                    order_ref: position_ref.to_string(),
                    symbol: instrument.symbol.clone(),
                    message: format!("price feed unavailable, exits paused: {}", err),
                });
                return;
            }
            info!("📡 Subscribed {}", key);
        }

        self.subscribed.insert(position_ref.to_string());
        debug!("{} monitored on {} ({} holders)", position_ref, key, self.subscriptions.holders(&key));
    }

    pub(crate) async fn unsubscribe_position(&mut self, position_ref: &str, instrument: &Instrument) {
        if !self.subscribed.remove(position_ref) {
            return;
        }
        let key = instrument.key();
        if self.subscriptions.release(&key) {
            match self.feed.unsubscribe(instrument).await {
                Ok(()) => info!("Unsubscribed {}", key),
                Err(err) => warn!("Failed to unsubscribe {}: {}", key, err),
            }
            self.last_prices.remove(&key);
        } else {
            debug!("{} still held by {} positions", key, self.subscriptions.holders(&key));
        }
    }

    pub(crate) fn record_trade(&mut self, trade: ClosedTrade) {
        if let Err(e) = self.history.append(trade) {
            error!("❌ Failed to append trade history: {}", e);
            self.stats.record_error();
        }
    }

    /// Persist after a transition; failures are logged, never fatal
    pub(crate) fn checkpoint(&mut self) {
        if let Err(err) = self.persist() {
            error!("❌ Failed to persist positions: {}", err);
            self.stats.record_error();
        }
    }

    pub(crate) fn notify(&self, notification: Notification) {
        debug!("Notification: {}", notification);
        if let Some(notifier) = &self.notifier {
            let _ = notifier.send(notification);
        }
    }

    /// Place with retry, resending only when the broker never saw the request
    async fn place_order(&self, order: &OrderRequest, operation: &str) -> Result<String, TradingError> {
        let broker = Arc::clone(&self.broker);
        retry_if(operation, &self.settings.retry, TradingError::is_safe_to_resend, || {
            let broker = Arc::clone(&broker);
            async move { broker.place_order(order).await }
        })
        .await
    }

    async fn quote(&self, instrument: &Instrument) -> Result<f64, TradingError> {
        let broker = Arc::clone(&self.broker);
        let price = retry_if("Get quote", &self.settings.retry, TradingError::is_retryable, || {
            let broker = Arc::clone(&broker);
            async move { broker.get_quote(instrument).await }
        })
        .await?;

        if price.is_finite() && price > 0.0 {
            Ok(price)
        } else {
            Err(TradingError::QuoteUnavailable {
                instrument: instrument.to_string(),
            })
        }
    }
}

fn unprotected_exit_failed(order_ref: String, symbol: String, reason: &str) -> Notification {
    Notification::ManualAttention {
        order_ref,
        symbol,
        message: format!("exit refused ({}) and no valid stop-loss exists; exit manually", reason),
    }
}

fn missing(name: &str) -> TradingError {
    TradingError::MissingParameter { name: name.to_string() }
}

/// Whole units `capital` buys at `price`
fn quantity_for(capital: f64, price: f64) -> Result<u32, TradingError> {
    if !capital.is_finite() || capital <= 0.0 {
        return Err(TradingError::InvalidQuantity {
            reason: format!("capital must be positive, got {}", capital),
        });
    }
    let units = (capital / price).floor();
    if units < 1.0 || units > u32::MAX as f64 {
        return Err(TradingError::InvalidQuantity {
            reason: format!("capital {} buys {} units at {}", capital, units, price),
        });
    }
    Ok(units as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderStatusReport, Side};
    use crate::config::{Preferences, PreferencesManager};
    use crate::websocket::PaperFeed;
    use async_trait::async_trait;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        pub Broker {}

        #[async_trait]
        impl BrokerGateway for Broker {
            async fn place_order(&self, order: &OrderRequest) -> Result<String, TradingError>;
            async fn cancel_order(&self, order_ref: &str) -> Result<(), TradingError>;
            async fn get_order_status(&self, order_ref: &str) -> Result<OrderStatusReport, TradingError>;
            async fn get_quote(&self, instrument: &Instrument) -> Result<f64, TradingError>;
            async fn search_symbol(&self, exchange: &str, text: &str) -> Result<Vec<Instrument>, TradingError>;
        }
    }

    struct Harness {
        engine: TradeEngine,
        notifications: mpsc::UnboundedReceiver<Notification>,
        _dir: tempfile::TempDir,
    }

    fn harness(broker: MockBroker, preferences: Preferences) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = EngineSettings {
            retry: RetryConfig {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 5,
                backoff_multiplier: 2.0,
            },
            ..EngineSettings::default()
        };
        let engine = TradeEngine::new(
            Arc::new(broker),
            Arc::new(PaperFeed::new()),
            PositionStore::new(dir.path().join("positions.json")),
            TradeHistory::new(dir.path().join("history.json")),
            PreferencesManager::in_memory(preferences),
            settings,
        )
        .with_notifier(tx);

        Harness {
            engine,
            notifications: rx,
            _dir: dir,
        }
    }

    fn sbin() -> Instrument {
        Instrument::new("NSE", "3045", "SBIN-EQ")
    }

    fn long_request() -> OpenRequest {
        OpenRequest::market(sbin(), Side::Long).quantity(10).thresholds(1.0, 2.0)
    }

    async fn open_filled(engine: &mut TradeEngine) {
        engine.open_position(long_request()).await.unwrap();
        engine.on_order_event(OrderEvent::filled("E1", 100.0)).await;
        assert!(engine.position("E1").unwrap().is_open());
    }

    #[tokio::test]
    async fn test_rejected_entry_creates_no_position() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().times(1).returning(|_| {
            Err(TradingError::OrderRejected {
                reason: "Market is closed".to_string(),
            })
        });
        let mut h = harness(broker, Preferences::default());

        let err = h.engine.open_position(long_request()).await.unwrap_err();

        assert_eq!(err.category(), "ORDER_REJECTED");
        assert_eq!(h.engine.positions().count(), 0);
        assert!(matches!(
            h.notifications.try_recv(),
            Ok(Notification::EntryRejected { order_ref: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_entry_failure_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(TradingError::Unreachable {
                    message: "connection refused".to_string(),
                })
            } else {
                Ok("E1".to_string())
            }
        });
        let mut h = harness(broker, Preferences::default());

        let view = h.engine.open_position(long_request()).await.unwrap();

        assert_eq!(view.order_ref, "E1");
        assert_eq!(view.state, PositionState::AwaitingEntryFill);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_capital_sizing_uses_preferences() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(400.0));
        broker
            .expect_place_order()
            .withf(|order: &OrderRequest| order.quantity == 25 && order.transaction_code() == "B")
            .returning(|_| Ok("E1".to_string()));
        let prefs = Preferences {
            capital: Some(10_000.0),
            stop_loss_pct: Some(0.5),
            target_pct: Some(1.0),
            last_updated: None,
        };
        let mut h = harness(broker, prefs);

        let view = h
            .engine
            .open_position(OpenRequest::market(sbin(), Side::Long))
            .await
            .unwrap();

        assert_eq!(view.quantity, 25);
        assert_eq!(view.stop_loss, 398.0);
        assert_eq!(view.target, 404.0);
    }

    #[tokio::test]
    async fn test_missing_preferences_reported() {
        let mut h = harness(MockBroker::new(), Preferences::default());
        let err = h
            .engine
            .open_position(OpenRequest::market(sbin(), Side::Long).limit(100.0))
            .await
            .unwrap_err();
        assert_eq!(err, missing("stop_loss_pct"));
    }

    #[tokio::test]
    async fn test_exit_refused_returns_to_open() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().returning(|order: &OrderRequest| match order.intent {
            OrderIntent::Entry => Ok("E1".to_string()),
            OrderIntent::Exit => Err(TradingError::OrderRejected {
                reason: "RMS: blocked".to_string(),
            }),
        });
        let mut h = harness(broker, Preferences::default());
        open_filled(&mut h.engine).await;

        h.engine.on_price_tick("NSE|3045", 98.5).await;

        let position = h.engine.position("E1").unwrap();
        assert_eq!(position.state, PositionState::Open);
        assert!(position.exit.is_none());
        assert_eq!(h.engine.stats().exits_failed, 1);
    }

    #[tokio::test]
    async fn test_unconfirmed_entry_is_not_resent() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().times(1).returning(|_| {
            Err(TradingError::ApiError {
                status: 200,
                message: "PlaceOrder response without norenordno".to_string(),
            })
        });
        let mut h = harness(broker, Preferences::default());

        let err = h.engine.open_position(long_request()).await.unwrap_err();

        assert_eq!(err.category(), "API");
        assert_eq!(h.engine.positions().count(), 0);
        assert!(matches!(
            h.notifications.try_recv(),
            Ok(Notification::ManualAttention { .. })
        ));
    }

    #[tokio::test]
    async fn test_exit_timeout_orphans_without_resending() {
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = exits.clone();

        // Broker takes the first exit but the reply never arrives
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().returning(move |order: &OrderRequest| match order.intent {
            OrderIntent::Entry => Ok("E1".to_string()),
            OrderIntent::Exit if counter.fetch_add(1, Ordering::SeqCst) == 0 => Err(TradingError::TimeoutError {
                operation: "/PlaceOrder".to_string(),
            }),
            OrderIntent::Exit => Ok("X2".to_string()),
        });
        let mut h = harness(broker, Preferences::default());
        open_filled(&mut h.engine).await;

        h.engine.on_price_tick("NSE|3045", 98.5).await;

        assert_eq!(exits.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.engine.position("E1").unwrap().state,
            PositionState::Orphaned(OrphanedLeg::Exit)
        );

        // Further ticks do not fire while orphaned
        h.engine.on_price_tick("NSE|3045", 98.0).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        // A human who checked the broker may still exit explicitly
        let result = h.engine.manual_exit("E1").await.unwrap();
        assert_eq!(
            result,
            ExitRequest::Submitted {
                order_ref: "X2".to_string()
            }
        );
        assert_eq!(h.engine.position("E1").unwrap().state, PositionState::AwaitingExitFill);
    }

    #[tokio::test]
    async fn test_unreachable_exit_is_retried() {
        let exits = Arc::new(AtomicUsize::new(0));
        let counter = exits.clone();

        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().returning(move |order: &OrderRequest| match order.intent {
            OrderIntent::Entry => Ok("E1".to_string()),
            OrderIntent::Exit if counter.fetch_add(1, Ordering::SeqCst) < 2 => Err(TradingError::Unreachable {
                message: "connection refused".to_string(),
            }),
            OrderIntent::Exit => Ok("X1".to_string()),
        });
        let mut h = harness(broker, Preferences::default());
        open_filled(&mut h.engine).await;

        h.engine.on_price_tick("NSE|3045", 102.5).await;

        assert_eq!(exits.load(Ordering::SeqCst), 3);
        let position = h.engine.position("E1").unwrap();
        assert_eq!(position.state, PositionState::AwaitingExitFill);
        assert_eq!(position.exit_order_ref(), Some("X1"));
    }

    #[tokio::test]
    async fn test_collapsed_fill_with_refused_exit_stays_out_of_monitoring() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().returning(|order: &OrderRequest| match order.intent {
            OrderIntent::Entry => Ok("E1".to_string()),
            OrderIntent::Exit => Err(TradingError::OrderRejected {
                reason: "RMS: blocked".to_string(),
            }),
        });
        let mut h = harness(broker, Preferences::default());
        h.engine.open_position(long_request()).await.unwrap();

        // 1% of 0.20 rounds back onto the fill price
        h.engine.on_order_event(OrderEvent::filled("E1", 0.2)).await;

        let position = h.engine.position("E1").unwrap();
        assert_eq!(position.state, PositionState::Orphaned(OrphanedLeg::Exit));
        assert!(position.unprotected);
        assert_eq!(position.entry_price, 0.2);
        assert!(position.validate().is_ok());
        assert!(!h.engine.is_subscribed("E1"));

        // Periodic pass must not bring it back under monitoring
        h.engine.ensure_subscriptions().await;
        assert!(!h.engine.is_subscribed("E1"));
        h.engine.on_price_tick("NSE|3045", 0.1).await;
        assert_eq!(h.engine.stats().exits_placed, 1);

        // Survives a restart
        let loaded = h.engine.store.load(Utc::now(), Duration::hours(24)).unwrap();
        assert_eq!(loaded.dropped, 0);
        assert_eq!(loaded.positions.len(), 1);
        assert!(loaded.positions[0].unprotected);

        let mut attention = 0;
        while let Ok(notification) = h.notifications.try_recv() {
            if matches!(notification, Notification::ManualAttention { .. }) {
                attention += 1;
            }
        }
        assert_eq!(attention, 2);
    }

    #[tokio::test]
    async fn test_threshold_update_rules() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().returning(|_| Ok("E1".to_string()));
        let mut h = harness(broker, Preferences::default());

        h.engine.open_position(long_request()).await.unwrap();
        let err = h.engine.update_thresholds("E1", Some(0.5), None).unwrap_err();
        assert_eq!(err.category(), "THRESHOLD");

        h.engine.on_order_event(OrderEvent::filled("E1", 100.0)).await;
        let view = h.engine.update_thresholds("E1", Some(0.5), None).unwrap();
        assert_eq!(view.stop_loss, 99.5);
        assert_eq!(view.target, 102.0);

        let err = h.engine.update_thresholds("E1", Some(-1.0), None).unwrap_err();
        assert_eq!(err.category(), "THRESHOLD");
        assert_eq!(h.engine.position("E1").unwrap().stop_loss, 99.5);

        let err = h.engine.update_thresholds("nope", Some(1.0), None).unwrap_err();
        assert_eq!(err.category(), "POSITION_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_rejected_entry_event_removes_position() {
        let mut broker = MockBroker::new();
        broker.expect_get_quote().returning(|_| Ok(100.0));
        broker.expect_place_order().returning(|_| Ok("E1".to_string()));
        let mut h = harness(broker, Preferences::default());

        h.engine.open_position(long_request()).await.unwrap();
        let mut event = OrderEvent::new("E1", OrderStatus::Rejected, None);
        event.reason = Some("Insufficient funds".to_string());
        h.engine.on_order_event(event).await;

        assert!(h.engine.position("E1").is_none());
        assert_eq!(h.engine.stats().entries_rejected, 1);
    }

    #[test]
    fn test_quantity_for() {
        assert_eq!(quantity_for(10_000.0, 333.0).unwrap(), 30);
        assert!(quantity_for(100.0, 333.0).is_err());
        assert!(quantity_for(-5.0, 10.0).is_err());
    }
}
