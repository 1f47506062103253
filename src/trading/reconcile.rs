//! Startup recovery and orphan reconciliation
//! Resolve positions whose order outcome was unknown after a restart

use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{OrderEvent, OrderStatus};
use crate::trading::engine::TradeEngine;
use crate::trading::events::Notification;
use crate::trading::position::{OrphanedLeg, PositionState};
use crate::trading::trade_history::{ClosedTrade, CloseOutcome};
use crate::trading::TradingError;
use crate::utils::retry_if;

/// Result of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    /// Broker status applied (filled, or resumed waiting)
    pub resolved: usize,
    /// Dropped with unknown outcome
    pub dropped: usize,
    /// Broker unreachable; retried on the next pass
    pub still_orphaned: usize,
    /// Exit leg with no order reference; needs a human
    pub needs_attention: usize,
}

/// Result of startup recovery
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoverySummary {
    pub loaded: usize,
    pub dropped_on_load: usize,
    pub snapshot_corrupt: bool,
    pub reconcile: ReconcileReport,
}

impl TradeEngine {
    /// Load the snapshot, resume open positions and reconcile orphans.
    ///
    /// Only an unreadable storage medium is an error here.
    pub async fn recover(&mut self) -> Result<RecoverySummary, TradingError> {
        let loaded = self.store.load(Utc::now(), self.settings.stale_after)?;

        let mut summary = RecoverySummary {
            loaded: loaded.positions.len(),
            dropped_on_load: loaded.dropped,
            snapshot_corrupt: loaded.corrupt,
            ..RecoverySummary::default()
        };

        for position in loaded.positions {
            if let Some(exit_ref) = position.exit_order_ref() {
                self.exit_orders.insert(exit_ref.to_string(), position.order_ref.clone());
            }
            self.positions.insert(position.order_ref.clone(), position);
        }

        // Snapshot now reflects the orphan marks and dropped records
        self.checkpoint();

        let open: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.is_open())
            .map(|p| p.order_ref.clone())
            .collect();
        for position_ref in open {
            self.subscribe_position(&position_ref).await;
        }

        summary.reconcile = self.reconcile_orphans().await;

        let unattended: Vec<(String, String)> = self
            .positions
            .values()
            .filter(|p| p.state == PositionState::Orphaned(OrphanedLeg::Exit) && p.exit_order_ref().is_none())
            .map(|p| (p.order_ref.clone(), p.instrument.symbol.clone()))
            .collect();
        for (order_ref, symbol) in unattended {
            self.notify(Notification::ManualAttention {
                order_ref,
                symbol,
                message: "exit was being placed when the process stopped; check the broker and exit manually"
                    .to_string(),
            });
        }

        info!(
            "🔄 Recovery: {} loaded, {} dropped, {} resolved, {} unknown, {} pending retry, {} need attention",
            summary.loaded,
            summary.dropped_on_load,
            summary.reconcile.resolved,
            summary.reconcile.dropped,
            summary.reconcile.still_orphaned,
            summary.reconcile.needs_attention
        );
        Ok(summary)
    }

    /// Query the broker for every orphaned position and apply the answer
    pub async fn reconcile_orphans(&mut self) -> ReconcileReport {
        let orphans: Vec<(String, OrphanedLeg, Option<String>)> = self
            .positions
            .values()
            .filter_map(|p| match p.state {
                PositionState::Orphaned(leg) => {
                    Some((p.order_ref.clone(), leg, p.exit_order_ref().map(str::to_string)))
                }
                _ => None,
            })
            .collect();

        let mut report = ReconcileReport::default();

        for (position_ref, leg, exit_ref) in orphans {
            let order_ref = match (leg, exit_ref) {
                (OrphanedLeg::Entry, _) => position_ref.clone(),
                (OrphanedLeg::Exit, Some(exit_ref)) => exit_ref,
                (OrphanedLeg::Exit, None) => {
                    report.needs_attention += 1;
                    continue;
                }
            };

            let broker = Arc::clone(&self.broker);
            let status = retry_if("Order status", &self.settings.retry, TradingError::is_retryable, || {
                let broker = Arc::clone(&broker);
                let order_ref = order_ref.clone();
                async move { broker.get_order_status(&order_ref).await }
            })
            .await;

            match status {
                Ok(status_report) => match status_report.status {
                    OrderStatus::Filled | OrderStatus::Pending | OrderStatus::Open => {
                        info!("🔄 {} order {} is {:?} at broker", leg_name(leg), order_ref, status_report.status);
                        self.stats.record_reconciled();
                        self.on_order_event(OrderEvent::from_report(&order_ref, &status_report))
                            .await;
                        report.resolved += 1;
                    }
                    OrderStatus::Rejected | OrderStatus::Cancelled => {
                        let detail = format!(
                            "{} order {} was {:?}{}",
                            leg_name(leg),
                            order_ref,
                            status_report.status,
                            status_report.reason.map(|r| format!(" ({})", r)).unwrap_or_default()
                        )
                        .to_lowercase();
                        self.drop_unknown(&position_ref, leg, detail).await;
                        report.dropped += 1;
                    }
                },
                Err(err) if err.is_retryable() => {
                    warn!("⚠️ {} still orphaned, broker unreachable: {}", position_ref, err);
                    report.still_orphaned += 1;
                }
                Err(err) => {
                    let unreconcilable = TradingError::OrphanUnreconcilable {
                        order_ref: order_ref.clone(),
                        reason: err.to_string(),
                    };
                    warn!("⚠️ {}", unreconcilable);
                    self.drop_unknown(&position_ref, leg, unreconcilable.to_string()).await;
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// Remove an orphan and record it as closed with unknown outcome
    async fn drop_unknown(&mut self, position_ref: &str, leg: OrphanedLeg, detail: String) {
        let Some(position) = self.positions.remove(position_ref) else {
            return;
        };
        let exit_order_ref = position.exit_order_ref().map(str::to_string);
        if let Some(exit_ref) = &exit_order_ref {
            self.exit_orders.remove(exit_ref);
        }
        self.unsubscribe_position(position_ref, &position.instrument).await;

        warn!("❔ Dropping {} with unknown outcome: {}", position_ref, detail);

        self.stats.record_unknown_close();
        self.record_trade(ClosedTrade {
            order_ref: position.order_ref.clone(),
            exit_order_ref,
            instrument: position.instrument.clone(),
            side: position.side,
            quantity: position.quantity,
            entry_price: position.entry_price,
            exit_price: None,
            pnl: None,
            outcome: CloseOutcome::Unknown,
            entry_time: position.entry_time,
            closed_at: Utc::now(),
        });
        self.checkpoint();

        if leg == OrphanedLeg::Exit {
            self.notify(Notification::ManualAttention {
                order_ref: position_ref.to_string(),
                symbol: position.instrument.symbol.clone(),
                message: "exit order did not complete; the holding may still be open at the broker".to_string(),
            });
        }
        self.notify(Notification::ReconciledUnknown {
            order_ref: position_ref.to_string(),
            symbol: position.instrument.symbol,
            detail,
        });
    }
}

fn leg_name(leg: OrphanedLeg) -> &'static str {
    match leg {
        OrphanedLeg::Entry => "Entry",
        OrphanedLeg::Exit => "Exit",
    }
}
