//! Engine queue messages and user-facing notifications

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use tokio::sync::oneshot;

use crate::api::{Instrument, OrderEvent, OrderType, Side};
use crate::trading::errors::classify_rejection;
use crate::trading::position::{ExitReason, Position, PositionState};
use crate::trading::stats::TradingStats;
use crate::trading::trade_history::ClosedTrade;
use crate::trading::TradingError;

/// Reply channel carried by a command
pub type Reply<T> = oneshot::Sender<Result<T, TradingError>>;

/// One price update from the market feed
#[derive(Debug, Clone, PartialEq)]
pub struct Tick {
    /// `EXCHANGE|token`
    pub instrument_key: String,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    pub fn new(instrument_key: impl Into<String>, price: f64) -> Self {
        Self {
            instrument_key: instrument_key.into(),
            price,
            timestamp: Utc::now(),
        }
    }
}

/// Everything the engine consumes, in arrival order
#[derive(Debug)]
pub enum EngineEvent {
    Tick(Tick),
    Order(OrderEvent),
    Command(Command),
    /// Retry orphan reconciliation and missing subscriptions
    Reconcile,
}

/// How an entry is sized
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sizing {
    Quantity(u32),
    /// Quantity = floor(capital / reference price)
    Capital(f64),
    /// Capital from the saved preferences
    Default,
}

/// Request to open a position
#[derive(Debug, Clone, PartialEq)]
pub struct OpenRequest {
    pub instrument: Instrument,
    pub side: Side,
    pub sizing: Sizing,
    /// Falls back to the saved preference when `None`
    pub stop_loss_pct: Option<f64>,
    pub target_pct: Option<f64>,
    pub order_type: OrderType,
}

impl OpenRequest {
    /// Market entry sized from preferences
    pub fn market(instrument: Instrument, side: Side) -> Self {
        Self {
            instrument,
            side,
            sizing: Sizing::Default,
            stop_loss_pct: None,
            target_pct: None,
            order_type: OrderType::Market,
        }
    }

    pub fn quantity(mut self, quantity: u32) -> Self {
        self.sizing = Sizing::Quantity(quantity);
        self
    }

    pub fn capital(mut self, capital: f64) -> Self {
        self.sizing = Sizing::Capital(capital);
        self
    }

    pub fn thresholds(mut self, stop_loss_pct: f64, target_pct: f64) -> Self {
        self.stop_loss_pct = Some(stop_loss_pct);
        self.target_pct = Some(target_pct);
        self
    }

    pub fn limit(mut self, price: f64) -> Self {
        self.order_type = OrderType::Limit(price);
        self
    }
}

/// Result of a manual exit request
#[derive(Debug, Clone, PartialEq)]
pub enum ExitRequest {
    /// Exit order accepted by the broker
    Submitted { order_ref: String },
    /// An exit is already in flight; nothing was sent
    AlreadyExiting,
}

/// User requests routed through the engine queue
#[derive(Debug)]
pub enum Command {
    Open {
        request: OpenRequest,
        reply: Reply<PositionView>,
    },
    UpdateThresholds {
        position_ref: String,
        stop_loss_pct: Option<f64>,
        target_pct: Option<f64>,
        reply: Reply<PositionView>,
    },
    Exit {
        position_ref: String,
        reply: Reply<ExitRequest>,
    },
    Cancel {
        position_ref: String,
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<StatusReport>,
    },
}

/// Snapshot of one tracked position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionView {
    pub order_ref: String,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub target: f64,
    pub state: PositionState,
    pub exit_reason: Option<ExitReason>,
    pub last_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub unrealized_pnl_pct: Option<f64>,
}

impl PositionView {
    pub fn of(position: &Position, last_price: Option<f64>) -> Self {
        let marked = last_price.filter(|_| position.state != PositionState::AwaitingEntryFill);
        Self {
            order_ref: position.order_ref.clone(),
            instrument: position.instrument.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            entry_time: position.entry_time,
            stop_loss: position.stop_loss,
            target: position.target,
            state: position.state,
            exit_reason: position.fill_type(),
            last_price,
            unrealized_pnl: marked.map(|p| position.pnl_at(p)),
            unrealized_pnl_pct: marked.map(|p| position.pnl_pct_at(p)),
        }
    }
}

impl fmt::Display for PositionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} x{} [{}] entry {:.2} SL {:.2} TGT {:.2}",
            self.side, self.instrument.symbol, self.quantity, self.state, self.entry_price, self.stop_loss, self.target
        )?;
        if let (Some(price), Some(pnl), Some(pct)) = (self.last_price, self.unrealized_pnl, self.unrealized_pnl_pct) {
            write!(f, " LTP {:.2} PnL {:+.2} ({:+.2}%)", price, pnl, pct)?;
        }
        write!(f, " #{}", self.order_ref)
    }
}

/// Engine status
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub positions: Vec<PositionView>,
    pub realized_pnl: f64,
    pub closed_trades: usize,
    /// Newest first
    pub recent_trades: Vec<ClosedTrade>,
    pub stats: TradingStats,
}

impl StatusReport {
    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.iter().filter_map(|p| p.unrealized_pnl).sum()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.positions.is_empty() {
            writeln!(f, "No active positions")?;
        } else {
            writeln!(f, "Active positions ({}):", self.positions.len())?;
            for view in &self.positions {
                writeln!(f, "  {}", view)?;
            }
            writeln!(f, "Unrealized PnL: {:+.2}", self.unrealized_pnl())?;
        }
        write!(f, "Realized PnL: {:+.2} over {} closed trades", self.realized_pnl, self.closed_trades)?;
        for trade in &self.recent_trades {
            let pnl = trade.pnl.map(|p| format!("{:+.2}", p)).unwrap_or_else(|| "unknown".to_string());
            write!(
                f,
                "\n  {} {} x{} ({}) {}",
                trade.side, trade.instrument.symbol, trade.quantity, trade.outcome, pnl
            )?;
        }
        Ok(())
    }
}

/// Messages for the command surface
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    EntryPlaced {
        order_ref: String,
        symbol: String,
        side: Side,
        quantity: u32,
        reference_price: f64,
        stop_loss: f64,
        target: f64,
    },
    EntryFilled {
        order_ref: String,
        symbol: String,
        price: f64,
        stop_loss: f64,
        target: f64,
    },
    EntryRejected {
        order_ref: Option<String>,
        symbol: String,
        reason: String,
    },
    EntryCancelled {
        order_ref: String,
        symbol: String,
    },
    ExitTriggered {
        order_ref: String,
        symbol: String,
        reason: ExitReason,
        price: f64,
    },
    PositionClosed(ClosedTrade),
    /// Exit order refused; monitoring resumed
    ExitFailed {
        order_ref: String,
        symbol: String,
        reason: String,
    },
    ManualAttention {
        order_ref: String,
        symbol: String,
        message: String,
    },
    /// Orphan dropped because the broker has no usable record
    ReconciledUnknown {
        order_ref: String,
        symbol: String,
        detail: String,
    },
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notification::EntryPlaced {
                order_ref,
                symbol,
                side,
                quantity,
                reference_price,
                stop_loss,
                target,
            } => {
                let qty = *quantity as f64;
                let loss = (reference_price - stop_loss).abs() * qty;
                let profit = (target - reference_price).abs() * qty;
                write!(
                    f,
                    "✅ {} order placed: {} x{} @ ~{:.2}\nStop-loss {:.2} (risk ≈ {:.2}) | Target {:.2} (reward ≈ {:.2})\nOrder #{}",
                    side, symbol, quantity, reference_price, stop_loss, loss, target, profit, order_ref
                )
            }
            Notification::EntryFilled {
                order_ref,
                symbol,
                price,
                stop_loss,
                target,
            } => write!(
                f,
                "🟢 Entry filled: {} @ {:.2} | SL {:.2} | TGT {:.2} (#{})",
                symbol, price, stop_loss, target, order_ref
            ),
            Notification::EntryRejected {
                order_ref,
                symbol,
                reason,
            } => {
                write!(f, "❌ Order for {} rejected: {}", symbol, reason)?;
                if let Some(order_ref) = order_ref {
                    write!(f, " (#{})", order_ref)?;
                }
                if let Some(hint) = classify_rejection(reason) {
                    write!(f, "\n💡 {}", hint)?;
                }
                Ok(())
            }
            Notification::EntryCancelled { order_ref, symbol } => {
                write!(f, "🚫 Entry for {} cancelled (#{})", symbol, order_ref)
            }
            Notification::ExitTriggered {
                order_ref,
                symbol,
                reason,
                price,
            } => write!(f, "🚨 {} for {} at {:.2}, exit order #{} sent", reason, symbol, price, order_ref),
            Notification::PositionClosed(trade) => {
                let pnl = trade
                    .pnl
                    .map(|p| format!("{:+.2}", p))
                    .unwrap_or_else(|| "unknown".to_string());
                write!(
                    f,
                    "🏁 Closed {} {} x{} ({}): entry {:.2} exit {} | PnL {}",
                    trade.side,
                    trade.instrument.symbol,
                    trade.quantity,
                    trade.outcome,
                    trade.entry_price,
                    trade.exit_price.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "-".to_string()),
                    pnl
                )
            }
            Notification::ExitFailed {
                order_ref,
                symbol,
                reason,
            } => write!(
                f,
                "⚠️ Exit for {} refused: {}. Position still monitored (#{})",
                symbol, reason, order_ref
            ),
            Notification::ManualAttention {
                order_ref,
                symbol,
                message,
            } => write!(f, "🆘 {} needs manual attention: {} (#{})", symbol, message, order_ref),
            Notification::ReconciledUnknown {
                order_ref,
                symbol,
                detail,
            } => write!(
                f,
                "❔ {} removed after restart, outcome unknown: {} (#{})",
                symbol, detail, order_ref
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_placed_text_shows_risk_and_reward() {
        let text = Notification::EntryPlaced {
            order_ref: "24011200000001".to_string(),
            symbol: "SBIN-EQ".to_string(),
            side: Side::Long,
            quantity: 10,
            reference_price: 100.0,
            stop_loss: 99.0,
            target: 102.0,
        }
        .to_string();

        assert!(text.contains("risk ≈ 10.00"));
        assert!(text.contains("reward ≈ 20.00"));
    }

    #[test]
    fn test_rejection_text_carries_hint() {
        let text = Notification::EntryRejected {
            order_ref: None,
            symbol: "SBIN-EQ".to_string(),
            reason: "RMS: insufficient funds".to_string(),
        }
        .to_string();

        assert!(text.contains("Insufficient funds"));
    }

    #[test]
    fn test_open_request_builder() {
        let req = OpenRequest::market(Instrument::new("nse", "3045", "SBIN-EQ"), Side::Short)
            .capital(10_000.0)
            .thresholds(0.5, 1.0)
            .limit(800.0);

        assert_eq!(req.instrument.exchange, "NSE");
        assert_eq!(req.sizing, Sizing::Capital(10_000.0));
        assert_eq!(req.order_type, OrderType::Limit(800.0));
        assert_eq!(req.target_pct, Some(1.0));
    }
}
