//! Order Executor - chat-driven trade execution with exit monitoring
//!
//! Features:
//! - Entry orders sized by quantity or capital, market or limit
//! - Stop-loss / target monitoring on streaming ticks
//! - Crash-safe position snapshots with orphan reconciliation on restart
//! - Paper broker and feed for simulation mode

pub mod api;
pub mod commands;
pub mod config;
pub mod trading;
pub mod utils;
pub mod websocket;

// Re-export commonly used types
pub use api::{
    ApiError, BrokerGateway, Credentials, Instrument, NorenRestClient, OrderEvent, OrderStatus, OrderType,
    PaperBroker, Side,
};
pub use commands::{parse_intent, parse_intent_with, parse_percentage, CommandError, Intent, SymbolBook};
pub use config::{Config, PreferenceUpdates, Preferences, PreferencesManager};
pub use trading::{
    run, ClosedTrade, CloseOutcome, EngineHandle, EngineSettings, ExitRequest, Notification, OpenRequest,
    Position, PositionState, PositionStore, PositionView, RunnerSettings, StatusReport, TradeEngine,
    TradeHistory, TradingError, TradingStats,
};
pub use websocket::{MarketFeed, NorenFeed, PaperFeed};

/// Executor version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
