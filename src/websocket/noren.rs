//! Noren streaming client
//! Touchline ticks and order updates, reconnect with resubscribe

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{parse_feed_message, FeedMessage, MarketFeed};
use crate::api::{Credentials, Instrument};
use crate::trading::events::EngineEvent;
use crate::trading::TradingError;

const WS_TIMEOUT_SECONDS: u64 = 30;
const WS_RECONNECT_DELAY: u64 = 5;
const WS_HEARTBEAT_INTERVAL: u64 = 20;

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

type FeedResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Live market feed over the broker websocket
pub struct NorenFeed {
    /// Keys to (re)subscribe on every connect
    desired: Arc<RwLock<BTreeSet<String>>>,
    commands: mpsc::UnboundedSender<FeedCommand>,
}

impl NorenFeed {
    /// Spawn the connection task and return the feed handle
    pub fn start(
        url: String,
        credentials: Credentials,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let desired = Arc::new(RwLock::new(BTreeSet::new()));
        let (commands, command_rx) = mpsc::unbounded_channel();

        let connection = Connection {
            url,
            credentials,
            desired: desired.clone(),
            events,
            cancel,
        };
        tokio::spawn(connection.run(command_rx));

        Arc::new(Self { desired, commands })
    }

    fn send(&self, command: FeedCommand) -> Result<(), TradingError> {
        self.commands.send(command).map_err(|_| TradingError::FeedUnavailable {
            message: "feed connection task stopped".to_string(),
        })
    }
}

#[async_trait]
impl MarketFeed for NorenFeed {
    async fn subscribe(&self, instrument: &Instrument) -> Result<(), TradingError> {
        let key = instrument.key();
        self.desired.write().await.insert(key.clone());
        self.send(FeedCommand::Subscribe(key))
    }

    async fn unsubscribe(&self, instrument: &Instrument) -> Result<(), TradingError> {
        let key = instrument.key();
        self.desired.write().await.remove(&key);
        self.send(FeedCommand::Unsubscribe(key))
    }
}

struct Connection {
    url: String,
    credentials: Credentials,
    desired: Arc<RwLock<BTreeSet<String>>>,
    events: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
}

impl Connection {
    /// Connection loop
    async fn run(self, mut commands: mpsc::UnboundedReceiver<FeedCommand>) {
        info!("🚀 Market feed starting");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            info!("Connecting to market feed...");
            match self.session(&mut commands).await {
                Ok(true) => break,
                Ok(false) => warn!("Market feed closed, reconnecting..."),
                Err(e) => error!("Market feed error: {}", e),
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(WS_RECONNECT_DELAY)) => {}
            }
        }

        info!("Market feed stopped");
    }

    /// One connected session; `Ok(true)` means stop for good
    async fn session(&self, commands: &mut mpsc::UnboundedReceiver<FeedCommand>) -> FeedResult<bool> {
        let (mut ws, _) = tokio::time::timeout(Duration::from_secs(WS_TIMEOUT_SECONDS), connect_async(self.url.as_str()))
            .await
            .map_err(|_| "Connection timeout")??;

        let login = json!({
            "t": "c",
            "uid": self.credentials.user_id,
            "actid": self.credentials.account_id,
            "susertoken": self.credentials.session_token,
            "source": "API",
        });
        ws.send(Message::Text(login.to_string())).await?;
        ws.send(Message::Text(json!({ "t": "o", "actid": self.credentials.account_id }).to_string()))
            .await?;

        let keys: Vec<String> = self.desired.read().await.iter().cloned().collect();
        if !keys.is_empty() {
            ws.send(Message::Text(json!({ "t": "t", "k": keys.join("#") }).to_string()))
                .await?;
            info!("📡 Subscribed to {} instruments", keys.len());
        }

        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_INTERVAL));

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = ws.close(None).await;
                    return Ok(true);
                }
                command = commands.recv() => {
                    let Some(command) = command else {
                        let _ = ws.close(None).await;
                        return Ok(true);
                    };
                    let frame = match command {
                        FeedCommand::Subscribe(key) => {
                            debug!("📡 Subscribing {}", key);
                            json!({ "t": "t", "k": key })
                        }
                        FeedCommand::Unsubscribe(key) => {
                            debug!("Unsubscribing {}", key);
                            json!({ "t": "u", "k": key })
                        }
                    };
                    ws.send(Message::Text(frame.to_string())).await?;
                }
                msg = tokio::time::timeout(Duration::from_secs(WS_TIMEOUT_SECONDS), ws.next()) => {
                    match msg {
                        Ok(Some(Ok(Message::Text(text)))) => {
                            if !self.dispatch(&text).await {
                                return Ok(true);
                            }
                        }
                        Ok(Some(Ok(Message::Ping(data)))) => {
                            ws.send(Message::Pong(data)).await?;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            warn!("Market feed closed by server");
                            return Ok(false);
                        }
                        Ok(Some(Err(e))) => {
                            return Err(e.into());
                        }
                        Ok(None) => {
                            warn!("Market feed stream ended");
                            return Ok(false);
                        }
                        Err(_) => {
                            ws.send(Message::Text(json!({ "t": "h" }).to_string())).await?;
                        }
                        _ => {}
                    }
                }
                _ = heartbeat.tick() => {
                    ws.send(Message::Text(json!({ "t": "h" }).to_string())).await?;
                }
            }
        }
    }

    /// Forward a frame to the engine; false once the engine is gone
    async fn dispatch(&self, text: &str) -> bool {
        let event = match parse_feed_message(text) {
            Some(FeedMessage::Tick(tick)) => EngineEvent::Tick(tick),
            Some(FeedMessage::Order(order)) => {
                info!("📬 Order update {} -> {:?}", order.order_ref, order.status);
                EngineEvent::Order(order)
            }
            Some(FeedMessage::Ack(kind)) => {
                debug!("Feed ack: {}", kind);
                return true;
            }
            None => {
                debug!("Ignoring feed frame: {}", text);
                return true;
            }
        };

        self.events.send(event).await.is_ok()
    }
}
