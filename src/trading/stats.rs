//! Trading statistics
//! Session counters and realised P&L

use serde::{Deserialize, Serialize};

/// Trading statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingStats {
    pub start_time: String,
    pub entries_placed: u64,
    pub entries_filled: u64,
    pub entries_rejected: u64,
    pub exits_placed: u64,
    pub exits_filled: u64,
    pub exits_failed: u64,
    pub orphans_reconciled: u64,
    pub unknown_closes: u64,
    pub wins: u64,
    pub losses: u64,
    pub ticks: u64,
    pub errors: u64,
    pub realized_pnl: f64,
    pub last_update: String,
}

impl TradingStats {
    /// Create new stats with current time
    pub fn new() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            start_time: now.clone(),
            last_update: now,
            ..Self::default()
        }
    }

    pub fn record_entry_placed(&mut self) {
        self.entries_placed += 1;
        self.update_time();
    }

    pub fn record_entry_filled(&mut self) {
        self.entries_filled += 1;
        self.update_time();
    }

    pub fn record_entry_rejected(&mut self) {
        self.entries_rejected += 1;
        self.update_time();
    }

    pub fn record_exit_placed(&mut self) {
        self.exits_placed += 1;
        self.update_time();
    }

    pub fn record_exit_failed(&mut self) {
        self.exits_failed += 1;
        self.update_time();
    }

    /// Record an exit fill and its realised P&L
    pub fn record_close(&mut self, pnl: f64) {
        self.exits_filled += 1;
        if pnl >= 0.0 {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.realized_pnl += pnl;
        self.update_time();
    }

    /// Record a position dropped with unknown outcome
    pub fn record_unknown_close(&mut self) {
        self.unknown_closes += 1;
        self.update_time();
    }

    pub fn record_reconciled(&mut self) {
        self.orphans_reconciled += 1;
        self.update_time();
    }

    pub fn record_tick(&mut self) {
        self.ticks += 1;
    }

    /// Record error
    pub fn record_error(&mut self) {
        self.errors += 1;
        self.update_time();
    }

    /// Win rate over known outcomes, in percent
    pub fn win_rate(&self) -> f64 {
        let closed = self.wins + self.losses;
        if closed == 0 {
            0.0
        } else {
            self.wins as f64 / closed as f64 * 100.0
        }
    }

    /// Get summary
    pub fn summary(&self) -> String {
        format!(
            "📊 Stats: entries placed={}, filled={}, rejected={} | exits placed={}, filled={}, failed={} | orphans reconciled={}, unknown={} | wins={} losses={} ({:.1}%) | ticks={} errors={} | PnL={:.2}",
            self.entries_placed,
            self.entries_filled,
            self.entries_rejected,
            self.exits_placed,
            self.exits_filled,
            self.exits_failed,
            self.orphans_reconciled,
            self.unknown_closes,
            self.wins,
            self.losses,
            self.win_rate(),
            self.ticks,
            self.errors,
            self.realized_pnl
        )
    }

    fn update_time(&mut self) {
        self.last_update = chrono::Utc::now().to_rfc3339();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trading_stats() {
        let mut stats = TradingStats::new();

        stats.record_entry_placed();
        stats.record_entry_filled();
        stats.record_exit_placed();
        stats.record_close(-16.0);
        stats.record_close(20.0);
        stats.record_error();

        assert_eq!(stats.entries_placed, 1);
        assert_eq!(stats.exits_filled, 2);
        assert_eq!(stats.wins, 1);
        assert_eq!(stats.losses, 1);
        assert_eq!(stats.realized_pnl, 4.0);
        assert_eq!(stats.win_rate(), 50.0);
        assert!(stats.summary().contains("PnL=4.00"));
    }
}
