use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::supervisor::WorkerRegistry;
use crate::bus::{tick_channel, EventBus, Subscription};
use crate::config::WorkerSettings;
use crate::models::{InstanceKey, Tick};
use crate::strategy::{StrategyStatus, TradingEngine};

/// Consumption loop for one instance: ticks in, engine decisions out
///
/// The worker owns its engine outright; everyone else sees it through the
/// status snapshots it publishes after every tick.
pub struct Worker {
    key: InstanceKey,
    engine: TradingEngine,
    bus: Arc<dyn EventBus>,
    registry: WorkerRegistry,
    settings: WorkerSettings,
    status: watch::Sender<StrategyStatus>,
}

impl Worker {
    pub fn new(
        key: InstanceKey,
        engine: TradingEngine,
        bus: Arc<dyn EventBus>,
        registry: WorkerRegistry,
        settings: WorkerSettings,
    ) -> (Self, watch::Receiver<StrategyStatus>) {
        let (status, status_rx) = watch::channel(engine.status());

        let worker = Self {
            key,
            engine,
            bus,
            registry,
            settings,
            status,
        };

        (worker, status_rx)
    }

    /// Consume ticks until `cancel` fires, then persist once and return
    pub async fn run(mut self, cancel: CancellationToken) {
        let channel = tick_channel(&self.key.symbol);
        let poll = self.settings.tick_poll();
        let resubscribe_after = self.settings.resubscribe_after();

        let mut subscription: Option<Box<dyn Subscription>> = None;
        let mut last_seen = Instant::now();

        tracing::info!("Strategy started for {}", self.key);

        while !cancel.is_cancelled() {
            if subscription.is_some() && last_seen.elapsed() >= resubscribe_after {
                tracing::info!(
                    "No ticks for {} in {:?}, resubscribing",
                    self.key,
                    resubscribe_after
                );
                subscription = None;
            }

            if subscription.is_none() {
                match self.bus.subscribe(&channel).await {
                    Ok(sub) => {
                        subscription = Some(sub);
                        last_seen = Instant::now();
                    }
                    Err(e) => {
                        tracing::warn!("{} could not subscribe to {}: {}", self.key, channel, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(poll) => continue,
                        }
                    }
                }
            }

            let Some(sub) = subscription.as_mut() else {
                continue;
            };

            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = sub.next_message(poll) => message,
            };

            match message {
                Ok(Some(raw)) => {
                    if self.consume(&raw) {
                        last_seen = Instant::now();
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("{} lost its tick subscription: {}", self.key, e);
                    subscription = None;
                }
            }
        }

        if let Err(e) = self.engine.save_position() {
            tracing::error!("Failed to save {} on stop: {}", self.key, e);
        }
        self.status.send_replace(self.engine.status());

        tracing::info!("Strategy stopped for {}", self.key);
    }

    /// Feed one raw bus message to the engine; false if it was not a tick for this symbol
    fn consume(&mut self, raw: &str) -> bool {
        let tick: Tick = match serde_json::from_str(raw) {
            Ok(tick) => tick,
            Err(e) => {
                tracing::warn!("{} ignoring malformed tick: {}", self.key, e);
                return false;
            }
        };

        if tick.symbol != self.key.symbol {
            return false;
        }

        self.registry.touch(&self.key, Utc::now());

        if let Err(e) = self.engine.on_tick(tick.price) {
            tracing::error!("{} failed to process tick at ${:.4}: {}", self.key, tick.price, e);
        }
        self.status.send_replace(self.engine.status());

        true
    }
}
