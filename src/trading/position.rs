//! Position tracking
//! A single trade from entry submission to exit fill

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api::{Instrument, OrderIntent, OrderRequest, OrderType, Side};
use crate::trading::TradingError;
use crate::utils::round2;

/// Lifecycle state of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "leg")]
pub enum PositionState {
    AwaitingEntryFill,
    Open,
    AwaitingExitFill,
    Closed,
    /// Order outcome unknown after a restart or exhausted retries
    Orphaned(OrphanedLeg),
}

/// Which order an orphaned position is waiting on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrphanedLeg {
    Entry,
    Exit,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionState::AwaitingEntryFill => write!(f, "AWAITING_ENTRY_FILL"),
            PositionState::Open => write!(f, "OPEN"),
            PositionState::AwaitingExitFill => write!(f, "AWAITING_EXIT_FILL"),
            PositionState::Closed => write!(f, "CLOSED"),
            PositionState::Orphaned(OrphanedLeg::Entry) => write!(f, "ORPHANED(entry)"),
            PositionState::Orphaned(OrphanedLeg::Exit) => write!(f, "ORPHANED(exit)"),
        }
    }
}

/// Why an exit was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    Target,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss => write!(f, "SL HIT"),
            ExitReason::Target => write!(f, "TARGET HIT"),
            ExitReason::Manual => write!(f, "MANUAL EXIT"),
        }
    }
}

/// Exit order in flight (or being submitted)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingExit {
    /// `None` until the broker acknowledges the order
    pub order_ref: Option<String>,
    pub reason: ExitReason,
    pub trigger_price: f64,
    pub requested_at: DateTime<Utc>,
}

/// Absolute stop-loss / target levels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub stop_loss: f64,
    pub target: f64,
}

impl Thresholds {
    /// Derive levels from percentages around an entry price.
    ///
    /// Long: stop below, target above. Short: inverted. Rounded to 2 decimals.
    pub fn from_percentages(
        side: Side,
        entry_price: f64,
        stop_loss_pct: f64,
        target_pct: f64,
    ) -> Result<Self, TradingError> {
        check_percentage("stop-loss", stop_loss_pct)?;
        check_percentage("target", target_pct)?;

        let (stop_loss, target) = match side {
            Side::Long => (
                round2(entry_price * (1.0 - stop_loss_pct / 100.0)),
                round2(entry_price * (1.0 + target_pct / 100.0)),
            ),
            Side::Short => (
                round2(entry_price * (1.0 + stop_loss_pct / 100.0)),
                round2(entry_price * (1.0 - target_pct / 100.0)),
            ),
        };

        let thresholds = Self { stop_loss, target };
        thresholds.validate(side, entry_price)?;
        Ok(thresholds)
    }

    /// Stop-loss and target strictly on the correct side of entry
    pub fn validate(&self, side: Side, entry_price: f64) -> Result<(), TradingError> {
        if !(self.stop_loss.is_finite() && self.target.is_finite()) || self.stop_loss <= 0.0 || self.target <= 0.0 {
            return Err(TradingError::invalid_threshold(format!(
                "levels must be positive (sl={}, target={})",
                self.stop_loss, self.target
            )));
        }

        let ordered = match side {
            Side::Long => self.stop_loss < entry_price && entry_price < self.target,
            Side::Short => self.target < entry_price && entry_price < self.stop_loss,
        };

        if ordered {
            Ok(())
        } else {
            Err(TradingError::invalid_threshold(format!(
                "{} position needs {} (entry={}, sl={}, target={})",
                side,
                match side {
                    Side::Long => "sl < entry < target",
                    Side::Short => "target < entry < sl",
                },
                entry_price,
                self.stop_loss,
                self.target
            )))
        }
    }
}

fn check_percentage(name: &str, pct: f64) -> Result<(), TradingError> {
    if pct.is_finite() && pct > 0.0 && pct <= 100.0 {
        Ok(())
    } else {
        Err(TradingError::invalid_threshold(format!(
            "{} percentage must be in (0, 100], got {}",
            name, pct
        )))
    }
}

/// Position data
///
/// Keyed by the broker's entry order reference. This is also the snapshot
/// record format; [`Position::validate`] is applied both on creation and
/// when a snapshot is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub order_ref: String,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    /// Fill price once open; reference (quote or limit) price before that
    pub entry_price: f64,
    /// Fill time once open; submission time before that
    pub entry_time: DateTime<Utc>,
    pub stop_loss: f64,
    pub target: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
    #[serde(flatten)]
    pub state: PositionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<PendingExit>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub test: bool,
    /// Entry filled where no valid levels exist; only ever exited
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unprotected: bool,
}

/// Parameters for a freshly submitted entry
#[derive(Debug, Clone)]
pub struct NewPosition {
    pub order_ref: String,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    pub reference_price: f64,
    pub stop_loss_pct: f64,
    pub target_pct: f64,
}

impl Position {
    /// Create a position awaiting its entry fill
    pub fn awaiting_entry(params: NewPosition) -> Result<Self, TradingError> {
        let thresholds = Thresholds::from_percentages(
            params.side,
            params.reference_price,
            params.stop_loss_pct,
            params.target_pct,
        )?;

        let position = Self {
            order_ref: params.order_ref,
            instrument: params.instrument,
            side: params.side,
            quantity: params.quantity,
            entry_price: params.reference_price,
            entry_time: Utc::now(),
            stop_loss: thresholds.stop_loss,
            target: thresholds.target,
            stop_loss_pct: params.stop_loss_pct,
            target_pct: params.target_pct,
            state: PositionState::AwaitingEntryFill,
            exit: None,
            test: false,
            unprotected: false,
        };
        position.validate()?;
        Ok(position)
    }

    /// Check required fields and the threshold invariant
    pub fn validate(&self) -> Result<(), TradingError> {
        if self.order_ref.trim().is_empty() {
            return Err(TradingError::PersistenceCorrupt {
                message: "empty order reference".to_string(),
            });
        }
        if self.instrument.exchange.is_empty() || self.instrument.token.is_empty() {
            return Err(TradingError::PersistenceCorrupt {
                message: format!("{}: incomplete instrument", self.order_ref),
            });
        }
        if self.quantity == 0 {
            return Err(TradingError::InvalidQuantity {
                reason: format!("{}: quantity must be positive", self.order_ref),
            });
        }
        if !self.entry_price.is_finite() || self.entry_price <= 0.0 {
            return Err(TradingError::PersistenceCorrupt {
                message: format!("{}: invalid entry price {}", self.order_ref, self.entry_price),
            });
        }
        if self.state == PositionState::Closed {
            return Err(TradingError::PersistenceCorrupt {
                message: format!("{}: closed positions are not tracked", self.order_ref),
            });
        }
        if self.unprotected {
            return match self.state {
                PositionState::AwaitingExitFill | PositionState::Orphaned(OrphanedLeg::Exit) => Ok(()),
                state => Err(TradingError::invalid_threshold(format!(
                    "{}: unprotected position cannot be {}",
                    self.order_ref, state
                ))),
            };
        }
        self.thresholds().validate(self.side, self.entry_price)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            stop_loss: self.stop_loss,
            target: self.target,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    /// Exit leg in flight, if any
    pub fn fill_type(&self) -> Option<ExitReason> {
        self.exit.as_ref().map(|e| e.reason)
    }

    /// Record the entry fill and re-anchor thresholds on the fill price
    pub fn fill_entry(&mut self, fill_price: f64, filled_at: DateTime<Utc>) -> Result<(), TradingError> {
        let thresholds =
            Thresholds::from_percentages(self.side, fill_price, self.stop_loss_pct, self.target_pct)?;

        self.entry_price = fill_price;
        self.entry_time = filled_at;
        self.stop_loss = thresholds.stop_loss;
        self.target = thresholds.target;
        self.state = PositionState::Open;
        self.exit = None;
        Ok(())
    }

    /// Record an entry fill at a price where the levels collapse.
    ///
    /// The position is marked unprotected and can only move towards an exit.
    pub fn fill_unprotected(&mut self, fill_price: f64, filled_at: DateTime<Utc>) {
        self.entry_price = fill_price;
        self.entry_time = filled_at;
        self.unprotected = true;
        self.state = PositionState::Orphaned(OrphanedLeg::Exit);
        self.exit = None;
    }

    /// Replace thresholds, keeping the old ones if the new ones are invalid
    pub fn set_thresholds(&mut self, stop_loss_pct: f64, target_pct: f64) -> Result<Thresholds, TradingError> {
        let thresholds =
            Thresholds::from_percentages(self.side, self.entry_price, stop_loss_pct, target_pct)?;

        self.stop_loss = thresholds.stop_loss;
        self.target = thresholds.target;
        self.stop_loss_pct = stop_loss_pct;
        self.target_pct = target_pct;
        Ok(thresholds)
    }

    /// Move to `AwaitingExitFill` before the exit order is submitted
    pub fn begin_exit(&mut self, reason: ExitReason, trigger_price: f64) {
        self.state = PositionState::AwaitingExitFill;
        self.exit = Some(PendingExit {
            order_ref: None,
            reason,
            trigger_price,
            requested_at: Utc::now(),
        });
    }

    /// Exit order refused. Returns whether the position is monitored again;
    /// an unprotected position stays orphaned on the exit leg instead.
    pub fn abort_exit(&mut self) -> bool {
        self.exit = None;
        if self.unprotected {
            self.state = PositionState::Orphaned(OrphanedLeg::Exit);
            false
        } else {
            self.state = PositionState::Open;
            true
        }
    }

    pub fn exit_order_ref(&self) -> Option<&str> {
        self.exit.as_ref().and_then(|e| e.order_ref.as_deref())
    }

    /// Market order that closes this position
    pub fn exit_order(&self, reason: ExitReason) -> OrderRequest {
        OrderRequest {
            instrument: self.instrument.clone(),
            side: self.side,
            quantity: self.quantity,
            order_type: OrderType::Market,
            intent: OrderIntent::Exit,
            remarks: format!("Exit-{}", reason),
        }
    }

    /// Realised P&L for an exit at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        round2((exit_price - self.entry_price) * self.quantity as f64 * self.side.sign())
    }

    /// P&L as a percentage of entry
    pub fn pnl_pct_at(&self, price: f64) -> f64 {
        round2((price - self.entry_price) / self.entry_price * 100.0 * self.side.sign())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_long(reference_price: f64) -> Position {
        Position::awaiting_entry(NewPosition {
            order_ref: "24011200000001".to_string(),
            instrument: Instrument::new("NSE", "2885", "RELIANCE-EQ"),
            side: Side::Long,
            quantity: 10,
            reference_price,
            stop_loss_pct: 1.0,
            target_pct: 2.0,
        })
        .unwrap()
    }

    #[test]
    fn test_long_thresholds() {
        let t = Thresholds::from_percentages(Side::Long, 100.0, 1.0, 2.0).unwrap();
        assert_eq!(t.stop_loss, 99.0);
        assert_eq!(t.target, 102.0);
    }

    #[test]
    fn test_short_thresholds_inverted() {
        let t = Thresholds::from_percentages(Side::Short, 200.0, 0.5, 1.0).unwrap();
        assert_eq!(t.stop_loss, 201.0);
        assert_eq!(t.target, 198.0);
    }

    #[test]
    fn test_rounding_collapse_is_rejected() {
        // 0.1% of 1.00 rounds back onto the entry price
        let err = Thresholds::from_percentages(Side::Long, 1.0, 0.1, 2.0).unwrap_err();
        assert_eq!(err.category(), "THRESHOLD");
    }

    #[test]
    fn test_negative_percentage_rejected() {
        assert!(Thresholds::from_percentages(Side::Long, 100.0, -1.0, 2.0).is_err());
        assert!(Thresholds::from_percentages(Side::Short, 100.0, 1.0, 100.0).is_err());
    }

    #[test]
    fn test_fill_entry_reanchors() {
        let mut pos = new_long(100.0);
        assert_eq!(pos.state, PositionState::AwaitingEntryFill);

        pos.fill_entry(105.0, Utc::now()).unwrap();
        assert!(pos.is_open());
        assert_eq!(pos.entry_price, 105.0);
        assert_eq!(pos.stop_loss, 103.95);
        assert_eq!(pos.target, 107.1);
    }

    #[test]
    fn test_exit_roundtrip_states() {
        let mut pos = new_long(100.0);
        pos.fill_entry(100.0, Utc::now()).unwrap();

        pos.begin_exit(ExitReason::StopLoss, 98.5);
        assert_eq!(pos.state, PositionState::AwaitingExitFill);
        assert_eq!(pos.fill_type(), Some(ExitReason::StopLoss));
        assert_eq!(pos.exit_order(ExitReason::StopLoss).transaction_code(), "S");

        assert!(pos.abort_exit());
        assert!(pos.is_open());
        assert_eq!(pos.fill_type(), None);
    }

    #[test]
    fn test_unprotected_fill_never_returns_to_open() {
        let mut pos = new_long(100.0);
        assert!(pos.fill_entry(0.2, Utc::now()).is_err());
        pos.fill_unprotected(0.2, Utc::now());
        assert_eq!(pos.state, PositionState::Orphaned(OrphanedLeg::Exit));
        assert!(pos.validate().is_ok());

        pos.begin_exit(ExitReason::Manual, 0.2);
        assert!(pos.validate().is_ok());
        assert!(!pos.abort_exit());
        assert_eq!(pos.state, PositionState::Orphaned(OrphanedLeg::Exit));

        pos.state = PositionState::Open;
        assert_eq!(pos.validate().unwrap_err().category(), "THRESHOLD");
    }

    #[test]
    fn test_pnl_sign_follows_side() {
        let mut pos = new_long(100.0);
        pos.fill_entry(100.0, Utc::now()).unwrap();
        assert_eq!(pos.pnl_at(98.4), -16.0);

        pos.side = Side::Short;
        assert_eq!(pos.pnl_at(98.4), 16.0);
    }

    #[test]
    fn test_serde_shape() {
        let pos = new_long(100.0);
        let value = serde_json::to_value(&pos).unwrap();
        assert_eq!(value["state"], "awaiting_entry_fill");
        assert!(value.get("test").is_none());

        let back: Position = serde_json::from_value(value).unwrap();
        assert_eq!(back, pos);
    }
}
