//! Position exit manager for stop-loss and target
//! Pure evaluation of one price against one position's levels

use tracing::{debug, info};

use crate::api::Side;
use crate::trading::position::{ExitReason, Position};

/// Exit check result
#[derive(Debug, Clone, PartialEq)]
pub struct ExitCheck {
    pub reason: Option<ExitReason>,
    pub pnl: f64,
    pub pnl_pct: f64,
}

/// Compare a tick price with the position's stop-loss and target.
///
/// A price that satisfies both (gap through) resolves to stop-loss.
pub fn check_exit(position: &Position, price: f64) -> ExitCheck {
    let stop_hit = match position.side {
        Side::Long => price <= position.stop_loss,
        Side::Short => price >= position.stop_loss,
    };
    let target_hit = match position.side {
        Side::Long => price >= position.target,
        Side::Short => price <= position.target,
    };

    let reason = if stop_hit {
        Some(ExitReason::StopLoss)
    } else if target_hit {
        Some(ExitReason::Target)
    } else {
        None
    };

    ExitCheck {
        reason,
        pnl: position.pnl_at(price),
        pnl_pct: position.pnl_pct_at(price),
    }
}

/// Log exit check
pub fn log_check(position: &Position, price: f64, check: &ExitCheck) {
    match check.reason {
        Some(ExitReason::StopLoss) => info!(
            "🚨 SL HIT for {} at {} (SL={}, PnL ≈ {:.2})",
            position.instrument.symbol, price, position.stop_loss, check.pnl
        ),
        Some(reason) => info!(
            "🎯 {} for {} at {} (Target={}, PnL ≈ {:.2})",
            reason, position.instrument.symbol, price, position.target, check.pnl
        ),
        None => debug!(
            "➡️ {} LTP={} SL={} Target={} PnL {:.2}%",
            position.order_ref, price, position.stop_loss, position.target, check.pnl_pct
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Instrument;
    use crate::trading::position::PositionState;
    use chrono::Utc;

    fn open_position(side: Side, stop_loss: f64, target: f64) -> Position {
        Position {
            order_ref: "1".to_string(),
            instrument: Instrument::new("NSE", "2885", "RELIANCE-EQ"),
            side,
            quantity: 10,
            entry_price: 100.0,
            entry_time: Utc::now(),
            stop_loss,
            target,
            stop_loss_pct: 1.0,
            target_pct: 2.0,
            state: PositionState::Open,
            exit: None,
            test: false,
            unprotected: false,
        }
    }

    #[test]
    fn test_long_hold_between_levels() {
        let pos = open_position(Side::Long, 99.0, 102.0);
        let check = check_exit(&pos, 100.5);
        assert_eq!(check.reason, None);
        assert_eq!(check.pnl, 5.0);
    }

    #[test]
    fn test_long_stop_and_target() {
        let pos = open_position(Side::Long, 99.0, 102.0);
        assert_eq!(check_exit(&pos, 98.5).reason, Some(ExitReason::StopLoss));
        assert_eq!(check_exit(&pos, 99.0).reason, Some(ExitReason::StopLoss));
        assert_eq!(check_exit(&pos, 102.0).reason, Some(ExitReason::Target));
    }

    #[test]
    fn test_short_levels_inverted() {
        let pos = open_position(Side::Short, 101.0, 98.0);
        assert_eq!(check_exit(&pos, 101.5).reason, Some(ExitReason::StopLoss));
        assert_eq!(check_exit(&pos, 97.0).reason, Some(ExitReason::Target));
        assert_eq!(check_exit(&pos, 99.5).reason, None);
        assert_eq!(check_exit(&pos, 97.0).pnl, 30.0);
    }

    #[test]
    fn test_gap_through_both_levels_prefers_stop_loss() {
        // Levels crossed so a single price satisfies both comparisons
        let pos = open_position(Side::Long, 101.0, 100.5);
        assert_eq!(check_exit(&pos, 100.8).reason, Some(ExitReason::StopLoss));
    }
}
