//! Engine event loop
//! One queue for ticks, order updates and commands, applied in arrival order

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::OrderEvent;
use crate::trading::engine::TradeEngine;
use crate::trading::events::{
    Command, EngineEvent, ExitRequest, OpenRequest, PositionView, Reply, StatusReport, Tick,
};
use crate::trading::reconcile::ReconcileReport;
use crate::trading::TradingError;

/// Runner timers
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub reconcile_interval: Duration,
    pub stats_interval: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
        }
    }
}

/// Cloneable sender side of the engine queue
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Create the queue; hand the receiver to [`run`]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Raw sender for feeds and broker callbacks
    pub fn events(&self) -> mpsc::Sender<EngineEvent> {
        self.tx.clone()
    }

    pub async fn open(&self, request: OpenRequest) -> Result<PositionView, TradingError> {
        self.request(|reply| Command::Open { request, reply }).await
    }

    pub async fn update_thresholds(
        &self,
        position_ref: &str,
        stop_loss_pct: Option<f64>,
        target_pct: Option<f64>,
    ) -> Result<PositionView, TradingError> {
        let position_ref = position_ref.to_string();
        self.request(|reply| Command::UpdateThresholds {
            position_ref,
            stop_loss_pct,
            target_pct,
            reply,
        })
        .await
    }

    pub async fn exit(&self, position_ref: &str) -> Result<ExitRequest, TradingError> {
        let position_ref = position_ref.to_string();
        self.request(|reply| Command::Exit { position_ref, reply }).await
    }

    pub async fn cancel(&self, position_ref: &str) -> Result<(), TradingError> {
        let position_ref = position_ref.to_string();
        self.request(|reply| Command::Cancel { position_ref, reply }).await
    }

    pub async fn status(&self) -> Result<StatusReport, TradingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Command(Command::Status { reply })).await?;
        rx.await.map_err(|_| TradingError::EngineStopped)
    }

    pub async fn tick(&self, instrument_key: &str, price: f64) -> Result<(), TradingError> {
        self.send(EngineEvent::Tick(Tick::new(instrument_key, price))).await
    }

    pub async fn order_event(&self, event: OrderEvent) -> Result<(), TradingError> {
        self.send(EngineEvent::Order(event)).await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, TradingError> {
        let (reply, rx) = oneshot::channel();
        self.send(EngineEvent::Command(build(reply))).await?;
        rx.await.map_err(|_| TradingError::EngineStopped)?
    }

    async fn send(&self, event: EngineEvent) -> Result<(), TradingError> {
        self.tx.send(event).await.map_err(|_| TradingError::EngineStopped)
    }
}

impl TradeEngine {
    /// Apply one queued event
    pub async fn handle(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Tick(tick) => self.on_price_tick(&tick.instrument_key, tick.price).await,
            EngineEvent::Order(order) => self.on_order_event(order).await,
            EngineEvent::Command(command) => self.execute(command).await,
            EngineEvent::Reconcile => {
                let report = self.reconcile_orphans().await;
                self.ensure_subscriptions().await;
                if report != ReconcileReport::default() {
                    info!("🔄 Reconcile pass: {:?}", report);
                }
            }
        }
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Open { request, reply } => {
                let _ = reply.send(self.open_position(request).await);
            }
            Command::UpdateThresholds {
                position_ref,
                stop_loss_pct,
                target_pct,
                reply,
            } => {
                let _ = reply.send(self.update_thresholds(&position_ref, stop_loss_pct, target_pct));
            }
            Command::Exit { position_ref, reply } => {
                let _ = reply.send(self.manual_exit(&position_ref).await);
            }
            Command::Cancel { position_ref, reply } => {
                let _ = reply.send(self.cancel_entry(&position_ref).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }
}

/// Drive the engine until cancelled or every sender is gone.
///
/// Returns the engine so callers can inspect the final state.
pub async fn run(
    mut engine: TradeEngine,
    mut events: mpsc::Receiver<EngineEvent>,
    settings: RunnerSettings,
    cancel: CancellationToken,
) -> TradeEngine {
    let mut reconcile = interval_at(Instant::now() + settings.reconcile_interval, settings.reconcile_interval);
    let mut stats = interval_at(Instant::now() + settings.stats_interval, settings.stats_interval);

    info!("🚀 Trade engine running ({} positions)", engine.positions().count());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Shutdown requested");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => engine.handle(event).await,
                    None => {
                        debug!("Engine queue closed");
                        break;
                    }
                }
            }
            _ = reconcile.tick() => {
                engine.handle(EngineEvent::Reconcile).await;
            }
            _ = stats.tick() => {
                info!("{}", engine.stats().summary());
            }
        }
    }

    engine.checkpoint();
    info!("{}", engine.stats().summary());
    info!("Trade engine stopped");
    engine
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_handle_queues_ticks_in_order() {
        let (handle, mut events) = EngineHandle::channel(4);

        assert_ok!(handle.tick("NSE|2885", 2500.0).await);
        assert_ok!(handle.tick("NSE|2885", 2499.5).await);

        let mut prices = Vec::new();
        for _ in 0..2 {
            match events.recv().await {
                Some(EngineEvent::Tick(tick)) => prices.push(tick.price),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(prices, vec![2500.0, 2499.5]);
    }

    #[tokio::test]
    async fn test_handle_reports_stopped_engine() {
        let (handle, events) = EngineHandle::channel(1);
        drop(events);

        let err = assert_err!(handle.tick("NSE|2885", 2500.0).await);
        assert_eq!(err, TradingError::EngineStopped);
        let err = assert_err!(handle.exit("24011200000007").await);
        assert_eq!(err, TradingError::EngineStopped);
    }
}
