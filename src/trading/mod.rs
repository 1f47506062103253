//! Trading module
//! Position lifecycle, exit monitoring, persistence and reconciliation

pub mod engine;
pub mod errors;
pub mod events;
pub mod exit_manager;
pub mod position;
pub mod reconcile;
pub mod runner;
pub mod stats;
pub mod store;
pub mod trade_history;

pub use engine::{EngineSettings, TradeEngine};
pub use errors::{classify_rejection, TradingError};
pub use events::{
    Command, EngineEvent, ExitRequest, Notification, OpenRequest, PositionView, Sizing, StatusReport, Tick,
};
pub use exit_manager::{check_exit, ExitCheck};
pub use position::{ExitReason, NewPosition, OrphanedLeg, PendingExit, Position, PositionState, Thresholds};
pub use reconcile::{ReconcileReport, RecoverySummary};
pub use runner::{run, EngineHandle, RunnerSettings};
pub use stats::TradingStats;
pub use store::{LoadedSnapshot, PositionStore};
pub use trade_history::{ClosedTrade, CloseOutcome, TradeHistory};
