use crate::Result;
use ::config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration shared by the controller, the feed and the client.
///
/// Every field has a default so an empty config file (or none at all) is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub redis_url: String,
    /// Root for position files, trade logs, the active-instance snapshot and the symbol list
    pub data_dir: PathBuf,
    /// Selects which supervised controller instance an external launcher addresses
    pub controller_id: String,
    pub feed: FeedSettings,
    pub reference: ReferenceSettings,
    pub workers: WorkerSettings,
    pub strategy: StrategySettings,
    /// argv run after `add_coin` changes the symbol list; empty disables it
    pub feed_restart_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSettings {
    pub ws_url: String,
    pub reconnect_delay_ms: u64,
    pub reconnect_jitter_ms: u64,
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReferenceSettings {
    pub rest_url: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub tick_poll_ms: u64,
    pub resubscribe_after_secs: u64,
    pub stale_after_secs: u64,
    pub stop_timeout_ms: u64,
    pub stop_all_timeout_ms: u64,
    pub command_poll_ms: u64,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub stop_loss_pct: f64,
    pub entry_discount_pct: f64,
    pub take_profit_pct: f64,
    pub prediction_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            data_dir: PathBuf::from("data"),
            controller_id: "alpha".to_string(),
            feed: FeedSettings::default(),
            reference: ReferenceSettings::default(),
            workers: WorkerSettings::default(),
            strategy: StrategySettings::default(),
            feed_restart_command: Vec::new(),
        }
    }
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://ws.kraken.com".to_string(),
            reconnect_delay_ms: 5_000,
            reconnect_jitter_ms: 0,
            ping_interval_secs: 40,
        }
    }
}

impl Default for ReferenceSettings {
    fn default() -> Self {
        Self {
            rest_url: "https://api.kraken.com".to_string(),
            max_retries: 5,
            retry_delay_ms: 2_000,
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick_poll_ms: 5_000,
            resubscribe_after_secs: 30,
            stale_after_secs: 60,
            stop_timeout_ms: 5_000,
            stop_all_timeout_ms: 1_000,
            command_poll_ms: 500,
            request_timeout_ms: 2_000,
        }
    }
}

impl Default for StrategySettings {
    fn default() -> Self {
        Self {
            stop_loss_pct: 2.0,
            entry_discount_pct: 0.5,
            take_profit_pct: 3.0,
            prediction_ttl_secs: 86_400,
        }
    }
}

impl Settings {
    /// Load defaults, then an optional TOML file, then `TRADER_*` environment overrides
    ///
    /// Nested keys use a double underscore, e.g. `TRADER_WORKERS__STOP_TIMEOUT_MS=2000`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = path.unwrap_or_else(|| Path::new("controller.toml"));

        let settings = Config::builder()
            .add_source(File::from(file).required(false))
            .add_source(
                Environment::with_prefix("TRADER")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(" ")
                    .with_list_parse_key("feed_restart_command")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(settings)
    }

    pub fn active_set_path(&self) -> PathBuf {
        self.data_dir.join("active_traders.json")
    }

    pub fn symbol_list_path(&self) -> PathBuf {
        self.data_dir.join("symbol_list.json")
    }

    pub fn trade_data_dir(&self) -> PathBuf {
        self.data_dir.join("trade_data")
    }
}

impl FeedSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

impl WorkerSettings {
    pub fn tick_poll(&self) -> Duration {
        Duration::from_millis(self.tick_poll_ms)
    }

    pub fn resubscribe_after(&self) -> Duration {
        Duration::from_secs(self.resubscribe_after_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn stop_all_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_all_timeout_ms)
    }

    pub fn command_poll(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
