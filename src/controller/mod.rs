//! Lifecycle manager: starts, tracks and stops one worker per instance and
//! answers remote commands.

pub mod supervisor;
pub mod worker;

pub use supervisor::{StopAllReport, WorkerRegistry, WorkerSnapshot};
pub use worker::Worker;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::api::ReferenceData;
use crate::bus::{publish_json, EventBus, Subscription, ALIVE_KEY, COMMAND_CHANNEL};
use crate::config::Settings;
use crate::execution::{PositionManager, TradeLog};
use crate::models::InstanceKey;
use crate::persistence::{ActiveSetStore, SymbolListStore};
use crate::protocol::{Command, Reply, Request};
use crate::strategy::{self, StrategyStatus, TradingEngine};
use crate::{Error, Result};

/// Strategy used when relaunching instances after a restart
pub const RECOVERY_STRATEGY: &str = "base";

const ALIVE_REFRESH_SECS: u64 = 30;

/// Strategy status plus tick freshness, as returned by `status`
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    #[serde(flatten)]
    pub strategy: StrategyStatus,
    pub last_tick: Option<DateTime<Utc>>,
    /// Seconds since the last tick, or since the worker started if none arrived yet
    pub tick_age: f64,
    pub stale: bool,
}

pub struct Controller {
    settings: Settings,
    bus: Arc<dyn EventBus>,
    reference: Arc<dyn ReferenceData>,
    registry: WorkerRegistry,
    active_set: ActiveSetStore,
    symbol_list: SymbolListStore,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(settings: Settings, bus: Arc<dyn EventBus>, reference: Arc<dyn ReferenceData>) -> Self {
        let active_set = ActiveSetStore::new(settings.active_set_path());
        let symbol_list = SymbolListStore::new(settings.symbol_list_path());

        Self {
            settings,
            bus,
            reference,
            registry: WorkerRegistry::new(),
            active_set,
            symbol_list,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    /// Cancelled by the `shutdown` command; cancel it to end [`run`](Self::run)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Launch a worker for `key`
    ///
    /// Reference data is best effort: without it the instance seeds its 24h
    /// range from the first tick. `fund_amnt` of `None` disables accounting.
    pub async fn start(&self, key: InstanceKey, strategy_name: &str, fund_amnt: Option<f64>) -> Result<()> {
        if self.registry.is_running(&key) {
            tracing::info!("{} already running", key);
            return Err(Error::AlreadyRunning);
        }

        let strategy = strategy::from_name(strategy_name, &self.settings.strategy)?;

        let reference = match self.reference.high_low_24h(&key.symbol).await {
            Ok(range) => Some(range),
            Err(e) => {
                tracing::warn!("No 24h range for {}, seeding from first tick: {}", key.symbol, e);
                None
            }
        };

        let trade_data = self.settings.trade_data_dir();
        let mut position = PositionManager::load(&trade_data, &key.owner, &key.symbol);
        position.configure_funds(fund_amnt);

        let engine = TradingEngine::new(
            &key.symbol,
            &key.owner,
            strategy,
            position,
            TradeLog::new(&trade_data, &key.owner, &key.symbol),
            reference,
            self.settings.strategy.prediction_ttl_secs,
        );

        let (worker, status) = Worker::new(
            key.clone(),
            engine,
            self.bus.clone(),
            self.registry.clone(),
            self.settings.workers.clone(),
        );
        self.registry
            .spawn(key.clone(), status, move |cancel| worker.run(cancel))?;

        tracing::info!("Started {} trader for {}", strategy_name, key);
        Ok(())
    }

    pub async fn stop(&self, key: &InstanceKey) -> Result<()> {
        self.registry
            .stop(key, self.settings.workers.stop_timeout())
            .await
    }

    pub async fn stop_all(&self) -> StopAllReport {
        let report = self
            .registry
            .stop_all(self.settings.workers.stop_all_timeout())
            .await;
        tracing::info!(
            "Stopped {} worker(s), {} still running",
            report.stopped.len(),
            report.still_running.len()
        );
        report
    }

    pub fn status(&self, key: &InstanceKey) -> Result<InstanceStatus> {
        self.status_at(key, Utc::now())
    }

    pub fn status_at(&self, key: &InstanceKey, now: DateTime<Utc>) -> Result<InstanceStatus> {
        let snapshot = self.live_snapshot(key)?;

        let since = snapshot.last_tick.unwrap_or(snapshot.started_at);
        let tick_age = (now - since).num_milliseconds().max(0) as f64 / 1000.0;

        Ok(InstanceStatus {
            strategy: snapshot.status,
            last_tick: snapshot.last_tick,
            tick_age,
            stale: tick_age >= self.settings.workers.stale_after_secs as f64,
        })
    }

    /// Snapshot of a worker that is still running; a finished (crashed) one counts as not running
    fn live_snapshot(&self, key: &InstanceKey) -> Result<WorkerSnapshot> {
        match self.registry.snapshot(key) {
            Some(snapshot) if snapshot.alive => Ok(snapshot),
            _ => Err(Error::NotRunning),
        }
    }

    /// Symbols running for `owner`
    pub fn list(&self, owner: &str) -> Vec<String> {
        self.registry
            .keys()
            .into_iter()
            .filter(|key| key.owner == owner)
            .map(|key| key.symbol)
            .collect()
    }

    /// Every running instance as `symbol|owner`
    pub fn list_all(&self) -> Vec<String> {
        self.registry.keys().iter().map(ToString::to_string).collect()
    }

    /// Current balance of a funded instance; `None` when unfunded
    pub fn get_balance(&self, key: &InstanceKey) -> Result<Option<f64>> {
        let snapshot = self.live_snapshot(key)?;
        Ok(snapshot.status.position.balance)
    }

    /// Add `BASE/QUOTE` to the feed's symbol list, restarting the feed if it changed
    pub async fn add_coin(&self, coin: &str) -> Result<Vec<String>> {
        let coin = normalize_coin(coin)?;
        let (coins, changed) = self.symbol_list.add(&coin)?;

        if changed {
            self.restart_feed().await?;
        }

        Ok(coins)
    }

    async fn restart_feed(&self) -> Result<()> {
        let Some((program, args)) = self.settings.feed_restart_command.split_first() else {
            tracing::debug!("No feed restart command configured");
            return Ok(());
        };

        tracing::info!("Restarting market feed: {:?}", self.settings.feed_restart_command);
        let status = tokio::process::Command::new(program).args(args).status().await?;

        if !status.success() {
            return Err(Error::External(format!("{} exited with {}", program, status)));
        }

        Ok(())
    }

    /// Write the running instance keys for the next startup
    pub fn save_active_set(&self) -> Result<()> {
        self.active_set.save(&self.registry.keys())
    }

    /// Relaunch every instance from the last snapshot, without funding
    ///
    /// Returns how many were started. Individual failures are logged.
    pub async fn startup(&self) -> Result<usize> {
        let keys = self.active_set.load()?;
        let mut started = 0;

        for key in keys {
            tracing::warn!("Relaunching {} without funding; re-fund with a new start", key);
            match self.start(key.clone(), RECOVERY_STRATEGY, None).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!("Failed to relaunch {}: {}", key, e),
            }
        }

        Ok(started)
    }

    /// Execute one command and build its reply
    pub async fn handle_command(&self, command: &Command) -> Reply {
        match Request::parse(command) {
            Ok(request) => self.execute(request).await.into(),
            Err(e) => Reply::error(e),
        }
    }

    async fn execute(&self, request: Request) -> Result<Reply> {
        let reply = match request {
            Request::Start {
                key,
                strategy,
                fund_amnt,
            } => {
                self.start(key, &strategy, fund_amnt).await?;
                Reply::ok()
            }
            Request::Stop { key } => {
                self.stop(&key).await?;
                Reply::ok()
            }
            Request::Status { key } => {
                let status = serde_json::to_value(self.status(&key)?)?;
                Reply::ok().with("status", status)
            }
            Request::GetBalance { key } => Reply::ok().with("balance", json!(self.get_balance(&key)?)),
            Request::List { owner } => Reply::ok().with("traders", json!(self.list(&owner))),
            Request::ListAll => Reply::ok().with("traders", json!(self.list_all())),
            Request::StopAll => {
                let report = self.stop_all().await;
                Reply::ok()
                    .with("stopped", key_list(&report.stopped))
                    .with("still_running", key_list(&report.still_running))
            }
            Request::AddCoin { coin } => Reply::ok().with("coin_list", json!(self.add_coin(&coin).await?)),
            Request::Shutdown => {
                tracing::info!("Shutdown requested");
                self.shutdown.cancel();
                Reply::ok()
            }
        };

        Ok(reply)
    }

    /// Command dispatch loop; returns once shutdown is requested
    ///
    /// Commands are handled one at a time. The liveness flag reads "true"
    /// while this runs and "false" after it returns.
    pub async fn run(&self) -> Result<()> {
        let poll = self.settings.workers.command_poll();
        let mut commands: Option<Box<dyn Subscription>> = Some(self.bus.subscribe(COMMAND_CHANNEL).await?);

        self.bus.set(ALIVE_KEY, "true").await?;
        let mut alive_at = Instant::now();
        tracing::info!("Controller {} accepting commands", self.settings.controller_id);

        while !self.shutdown.is_cancelled() {
            if alive_at.elapsed().as_secs() >= ALIVE_REFRESH_SECS {
                if let Err(e) = self.bus.set(ALIVE_KEY, "true").await {
                    tracing::warn!("Failed to refresh liveness flag: {}", e);
                }
                alive_at = Instant::now();
            }

            if commands.is_none() {
                match self.bus.subscribe(COMMAND_CHANNEL).await {
                    Ok(sub) => commands = Some(sub),
                    Err(e) => {
                        tracing::error!("Command subscription failed: {}", e);
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(poll) => continue,
                        }
                    }
                }
            }

            let Some(sub) = commands.as_mut() else {
                continue;
            };

            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = sub.next_message(poll) => message,
            };

            match message {
                Ok(Some(raw)) => self.dispatch(&raw).await,
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("Command subscription lost: {}", e);
                    commands = None;
                }
            }
        }

        self.bus.set(ALIVE_KEY, "false").await?;
        tracing::info!("Controller {} stopped accepting commands", self.settings.controller_id);

        Ok(())
    }

    async fn dispatch(&self, raw: &str) {
        let command: Command = match serde_json::from_str(raw) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Ignoring malformed command: {}", e);
                return;
            }
        };

        tracing::info!("Command {} (owner {:?}, symbol {:?})", command.cmd, command.owner, command.symbol);

        let reply = self.handle_command(&command).await;
        if let Some(message) = reply.error_message() {
            tracing::warn!("Command {} failed: {}", command.cmd, message);
        }

        if let Some(reply_to) = &command.reply_to {
            if let Err(e) = publish_json(self.bus.as_ref(), reply_to, &reply).await {
                tracing::error!("Failed to publish reply to {}: {}", reply_to, e);
            }
        }
    }
}

fn key_list(keys: &[InstanceKey]) -> Value {
    json!(keys.iter().map(ToString::to_string).collect::<Vec<_>>())
}

/// Trim, uppercase and check `BASE/QUOTE`
pub fn normalize_coin(coin: &str) -> Result<String> {
    let coin = coin.trim().to_uppercase();

    let valid = coin.split_once('/').is_some_and(|(base, quote)| {
        !base.is_empty()
            && !quote.is_empty()
            && base.chars().chain(quote.chars()).all(|c| c.is_ascii_alphanumeric())
    });

    if valid {
        Ok(coin)
    } else {
        Err(Error::InvalidCoin(coin))
    }
}
