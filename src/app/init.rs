//! Application initialization
//! Handles config loading, logging setup, and component wiring

use anyhow::Result;
use order_executor::trading::EngineEvent;
use order_executor::*;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// Paper gateway and feed, kept so the console can drive prices
#[derive(Clone)]
pub struct Simulation {
    pub broker: Arc<PaperBroker>,
    pub feed: Arc<PaperFeed>,
}

/// Instruments the paper broker can find with `/search`
const PAPER_INSTRUMENTS: [(&str, &str, &str); 4] = [
    ("NSE", "2885", "RELIANCE-EQ"),
    ("NSE", "3045", "SBIN-EQ"),
    ("NSE", "1594", "INFY-EQ"),
    ("NSE", "11536", "TCS-EQ"),
];

/// Application components container
pub struct AppComponents {
    pub engine: TradeEngine,
    /// Shared with the console for symbol search
    pub broker: Arc<dyn BrokerGateway>,
    pub handle: EngineHandle,
    pub events: mpsc::Receiver<EngineEvent>,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub preferences: PreferencesManager,
    pub simulation: Option<Simulation>,
}

/// Initialize logging; `RUST_LOG` wins over the configured level
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(parse_log_level(log_level).as_str().to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Parse log level string
fn parse_log_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Load configuration with environment variable priority.
///
/// Environment variables take precedence over config files so the
/// session token never has to live on disk.
pub fn load_config() -> Result<Config> {
    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("No config file found ({}), using defaults", e);
            Config::default()
        }
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Build the engine and its collaborators
pub async fn init_components(config: &Config, cancel: &CancellationToken) -> Result<AppComponents> {
    let (handle, events) = EngineHandle::channel(1024);
    let (notifier, notifications) = mpsc::unbounded_channel();

    let preferences = PreferencesManager::load(&config.storage.preferences_path);

    let (broker, feed, simulation): (Arc<dyn BrokerGateway>, Arc<dyn MarketFeed>, Option<Simulation>) =
        if config.broker.simulation_mode {
            warn!("🎮 SIMULATION MODE ENABLED - No real orders will be placed!");
            let broker = Arc::new(PaperBroker::new().with_events(handle.events()).with_auto_fill(true));
            let feed = Arc::new(PaperFeed::with_events(handle.events()));
            let gateway: Arc<dyn BrokerGateway> = broker.clone();
            let market: Arc<dyn MarketFeed> = feed.clone();
            (gateway, market, Some(Simulation { broker, feed }))
        } else {
            let credentials = config.credentials();
            let broker = NorenRestClient::new(
                &config.broker.base_url,
                credentials.clone(),
                &config.broker.product_type,
            )
            .map_err(|e| anyhow::anyhow!("Failed to create broker client: {}", e))?;
            let feed: Arc<dyn MarketFeed> =
                NorenFeed::start(config.broker.ws_url.clone(), credentials, handle.events(), cancel.clone());
            info!("Broker client ready ({})", config.broker.base_url);
            let gateway: Arc<dyn BrokerGateway> = Arc::new(broker);
            (gateway, feed, None)
        };

    if let Some(simulation) = &simulation {
        for (exchange, token, symbol) in PAPER_INSTRUMENTS {
            simulation.broker.add_instrument(Instrument::new(exchange, token, symbol)).await;
        }
    }

    let engine = TradeEngine::new(
        Arc::clone(&broker),
        feed,
        PositionStore::new(&config.storage.snapshot_path),
        TradeHistory::new(&config.storage.history_path),
        preferences.clone(),
        config.engine_settings(),
    )
    .with_notifier(notifier);

    Ok(AppComponents {
        engine,
        broker,
        handle,
        events,
        notifications,
        preferences,
        simulation,
    })
}
