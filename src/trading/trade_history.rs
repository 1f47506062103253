//! Closed trade ledger
//! Append-only record of every position that left the active set

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::api::{Instrument, Side};
use crate::trading::position::ExitReason;

/// How a position ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    StopLoss,
    Target,
    Manual,
    /// Reconciliation found no usable broker record; P&L unknown
    Unknown,
}

impl From<ExitReason> for CloseOutcome {
    fn from(reason: ExitReason) -> Self {
        match reason {
            ExitReason::StopLoss => CloseOutcome::StopLoss,
            ExitReason::Target => CloseOutcome::Target,
            ExitReason::Manual => CloseOutcome::Manual,
        }
    }
}

impl fmt::Display for CloseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseOutcome::StopLoss => write!(f, "stop_loss"),
            CloseOutcome::Target => write!(f, "target"),
            CloseOutcome::Manual => write!(f, "manual"),
            CloseOutcome::Unknown => write!(f, "unknown"),
        }
    }
}

/// Closed trade record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub order_ref: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_order_ref: Option<String>,
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: u32,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<f64>,
    pub outcome: CloseOutcome,
    pub entry_time: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

/// Trade history manager
pub struct TradeHistory {
    file_path: PathBuf,
}

impl TradeHistory {
    /// Create new trade history manager
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Load trade history
    pub fn load(&self) -> Vec<ClosedTrade> {
        if !self.file_path.exists() {
            return Vec::new();
        }

        match std::fs::read_to_string(&self.file_path) {
            Ok(content) => match serde_json::from_str::<Vec<ClosedTrade>>(&content) {
                Ok(records) => records,
                Err(e) => {
                    warn!("Failed to parse trade history: {}", e);
                    Vec::new()
                }
            },
            Err(e) => {
                warn!("Failed to read trade history: {}", e);
                Vec::new()
            }
        }
    }

    /// Save trade history with secure permissions
    pub fn save(&self, records: &[ClosedTrade]) -> anyhow::Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(records)?;
        std::fs::write(&self.file_path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut permissions = std::fs::metadata(&self.file_path)?.permissions();
            permissions.set_mode(0o600);
            std::fs::set_permissions(&self.file_path, permissions)?;
        }

        Ok(())
    }

    /// Append one closed trade
    pub fn append(&self, trade: ClosedTrade) -> anyhow::Result<()> {
        let mut records = self.load();
        info!(
            "📒 Closed {} {} x{} ({}), PnL {}",
            trade.side,
            trade.instrument.symbol,
            trade.quantity,
            trade.outcome,
            trade.pnl.map(|p| format!("{:.2}", p)).unwrap_or_else(|| "unknown".to_string())
        );
        records.push(trade);
        self.save(&records)
    }

    /// Sum of known P&L; unknown outcomes are excluded
    pub fn total_pnl(&self) -> f64 {
        self.load().iter().filter_map(|t| t.pnl).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade(order_ref: &str, pnl: Option<f64>, outcome: CloseOutcome) -> ClosedTrade {
        ClosedTrade {
            order_ref: order_ref.to_string(),
            exit_order_ref: None,
            instrument: Instrument::new("NSE", "3045", "SBIN-EQ"),
            side: Side::Long,
            quantity: 10,
            entry_price: 100.0,
            exit_price: pnl.map(|p| 100.0 + p / 10.0),
            pnl,
            outcome,
            entry_time: Utc::now(),
            closed_at: Utc::now(),
        }
    }

    #[test]
    fn test_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::new(dir.path().join("history.json"));
        assert!(history.load().is_empty());
    }

    #[test]
    fn test_append_and_total() {
        let dir = tempfile::tempdir().unwrap();
        let history = TradeHistory::new(dir.path().join("nested").join("history.json"));

        history.append(trade("1", Some(-16.0), CloseOutcome::StopLoss)).unwrap();
        history.append(trade("2", Some(20.0), CloseOutcome::Target)).unwrap();
        history.append(trade("3", None, CloseOutcome::Unknown)).unwrap();

        let records = history.load();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].outcome, CloseOutcome::Unknown);
        assert_eq!(history.total_pnl(), 4.0);
    }

    #[test]
    fn test_outcome_from_exit_reason() {
        assert_eq!(CloseOutcome::from(ExitReason::Target), CloseOutcome::Target);
        assert_eq!(CloseOutcome::from(ExitReason::Manual).to_string(), "manual");
    }
}
