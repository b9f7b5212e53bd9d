use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::clean_symbol;
use crate::persistence::{read_json, write_json};
use crate::{Error, Result};

/// Where an instance is in its trade cycle, derived from [`PositionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionPhase {
    /// No prediction, no position
    Idle,
    /// Buy limit set, waiting for the entry condition
    AwaitingEntry,
    /// Position filled, exit not yet predicted
    Open,
    /// Position filled and a sell limit is set
    AwaitingExit,
}

/// Allocation that enables quantity/balance accounting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundsConfig {
    pub amount: f64,
}

/// Persisted trading state of one instance
///
/// Fields are read freely; they only change through [`PositionManager`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionState {
    pub position_open: bool,
    pub entry_price: Option<f64>,
    pub sell_price: Option<f64>,
    pub last_sale_price: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub buy_limit_set: bool,
    pub sell_limit_set: bool,
    pub buy_prediction_timestamp: Option<DateTime<Utc>>,
    pub buy_prediction_resets: u32,
    pub last_trade_time: Option<DateTime<Utc>>,
    pub qty_held: Option<f64>,
    pub balance: Option<f64>,
    pub funds_config: Option<FundsConfig>,
}

impl Default for PositionState {
    fn default() -> Self {
        Self {
            position_open: false,
            entry_price: None,
            sell_price: None,
            last_sale_price: None,
            trailing_stop: None,
            buy_limit_set: false,
            sell_limit_set: false,
            buy_prediction_timestamp: None,
            buy_prediction_resets: 0,
            last_trade_time: None,
            qty_held: None,
            balance: None,
            funds_config: None,
        }
    }
}

impl PositionState {
    pub fn phase(&self) -> PositionPhase {
        match (self.position_open, self.buy_limit_set, self.sell_limit_set) {
            (true, _, true) => PositionPhase::AwaitingExit,
            (true, _, false) => PositionPhase::Open,
            (false, true, _) => PositionPhase::AwaitingEntry,
            (false, false, _) => PositionPhase::Idle,
        }
    }
}

/// Owns the [`PositionState`] of one (owner, symbol) instance and its file on disk
///
/// No method writes to disk implicitly; callers decide when to [`save`](Self::save).
pub struct PositionManager {
    symbol: String,
    path: PathBuf,
    state: PositionState,
}

impl PositionManager {
    /// Fresh state for `symbol`, stored under `<trade_data_dir>/<owner>/<SYMBOL>/position_info.json`
    pub fn new(trade_data_dir: &Path, owner: &str, symbol: &str) -> Self {
        let path = trade_data_dir
            .join(owner)
            .join(clean_symbol(symbol))
            .join("position_info.json");

        Self {
            symbol: symbol.to_string(),
            path,
            state: PositionState::default(),
        }
    }

    /// Load persisted state, falling back to defaults when the file is missing or unreadable
    pub fn load(trade_data_dir: &Path, owner: &str, symbol: &str) -> Self {
        let mut pm = Self::new(trade_data_dir, owner, symbol);

        match read_json::<PositionState>(&pm.path) {
            Ok(Some(state)) => {
                tracing::info!(
                    "Restored {} position state ({:?})",
                    symbol,
                    state.phase()
                );
                pm.state = state;
            }
            Ok(None) => {
                tracing::warn!(
                    "No position file for {} at {}, initializing",
                    symbol,
                    pm.path.display()
                );
            }
            Err(e) => {
                tracing::error!(
                    "Unreadable position file {} ({}), initializing",
                    pm.path.display(),
                    e
                );
            }
        }

        pm
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn phase(&self) -> PositionPhase {
        self.state.phase()
    }

    pub fn is_position_open(&self) -> bool {
        self.state.position_open
    }

    pub fn has_buy_limit(&self) -> bool {
        self.state.buy_limit_set
    }

    pub fn has_sell_limit(&self) -> bool {
        self.state.sell_limit_set
    }

    pub fn funds_enabled(&self) -> bool {
        self.state.funds_config.is_some()
    }

    /// Record a predicted entry (live trading - uses current time)
    pub fn set_buy_limit(&mut self, entry_price: f64) {
        self.set_buy_limit_at(entry_price, Utc::now());
    }

    /// Record a predicted entry with explicit timestamp
    pub fn set_buy_limit_at(&mut self, entry_price: f64, timestamp: DateTime<Utc>) {
        self.state.entry_price = Some(entry_price);
        self.state.buy_limit_set = true;
        self.state.buy_prediction_timestamp = Some(timestamp);
    }

    pub fn set_sell_limit(&mut self, sell_price: f64) {
        self.state.sell_price = Some(sell_price);
        self.state.sell_limit_set = true;
    }

    /// Fill the outstanding buy prediction
    pub fn open_position(&mut self, entry_price: f64, trailing_stop: f64) {
        self.open_position_at(entry_price, trailing_stop, Utc::now());
    }

    pub fn open_position_at(&mut self, entry_price: f64, trailing_stop: f64, timestamp: DateTime<Utc>) {
        self.state.position_open = true;
        self.state.entry_price = Some(entry_price);
        self.state.buy_limit_set = false;
        // a filled prediction can no longer go stale
        self.state.buy_prediction_timestamp = None;
        self.state.trailing_stop = Some(trailing_stop);
        self.state.last_trade_time = Some(timestamp);
    }

    pub fn close_position(&mut self, exit_price: f64) {
        self.close_position_at(exit_price, Utc::now());
    }

    pub fn close_position_at(&mut self, exit_price: f64, timestamp: DateTime<Utc>) {
        self.state.position_open = false;
        self.state.sell_price = None;
        self.state.sell_limit_set = false;
        self.state.last_sale_price = Some(exit_price);
        self.state.trailing_stop = None;
        self.state.last_trade_time = Some(timestamp);
    }

    /// Tighten the trailing stop; ignored if no position is open
    pub fn update_trailing_stop(&mut self, trailing_stop: f64) {
        if self.state.position_open {
            self.state.trailing_stop = Some(trailing_stop);
        }
    }

    /// Drop an unfilled buy prediction. Safe to call with no prediction outstanding.
    pub fn reset_limits(&mut self) {
        self.state.buy_limit_set = false;
        self.state.entry_price = None;
        self.state.buy_prediction_timestamp = None;
        self.state.buy_prediction_resets += 1;
    }

    /// Apply (or remove) the funding allocation requested at start
    ///
    /// A new allocation resets the balance to the allocated amount unless a
    /// position is currently open.
    pub fn configure_funds(&mut self, amount: Option<f64>) {
        let funds = amount.map(|amount| FundsConfig { amount });

        if funds == self.state.funds_config {
            return;
        }

        if let Some(ref f) = funds {
            if !self.state.position_open {
                self.state.balance = Some(f.amount);
                self.state.qty_held = None;
            }
            tracing::info!("{} funded with {:.2}", self.symbol, f.amount);
        }

        self.state.funds_config = funds;
    }

    /// Quantity bought with the full balance at the entry price
    pub fn calculate_buy_qty(&mut self) -> Result<f64> {
        if !self.funds_enabled() {
            return Err(Error::InvalidState("funds not configured".into()));
        }

        let balance = self
            .state
            .balance
            .ok_or_else(|| Error::InvalidState("no balance".into()))?;

        let entry_price = match self.state.entry_price {
            Some(p) if p > 0.0 => p,
            Some(p) => return Err(Error::InvalidState(format!("entry price {} is not positive", p))),
            None => return Err(Error::InvalidState("no entry price".into())),
        };

        let qty = balance / entry_price;
        self.state.qty_held = Some(qty);
        self.state.balance = Some(0.0);

        Ok(qty)
    }

    /// Proceeds of selling the held quantity at `sell_price`; becomes the new balance
    pub fn calculate_sell_total(&mut self, sell_price: f64) -> Result<f64> {
        if !self.funds_enabled() {
            return Err(Error::InvalidState("funds not configured".into()));
        }

        let qty = self
            .state
            .qty_held
            .ok_or_else(|| Error::InvalidState("no quantity held".into()))?;

        let total = qty * sell_price;
        self.state.balance = Some(total);
        self.state.qty_held = None;

        Ok(total)
    }

    /// Seconds since the outstanding buy prediction was made
    pub fn prediction_age(&self) -> Option<f64> {
        self.prediction_age_at(Utc::now())
    }

    pub fn prediction_age_at(&self, now: DateTime<Utc>) -> Option<f64> {
        self.state
            .buy_prediction_timestamp
            .map(|ts| (now - ts).num_milliseconds() as f64 / 1000.0)
    }

    /// Write state to disk
    ///
    /// With neither a position nor a buy prediction outstanding, leftover
    /// prediction fields are cleared first so an idle file is always clean.
    pub fn save(&mut self) -> Result<()> {
        if !self.state.position_open && !self.state.buy_limit_set {
            self.state.entry_price = None;
            self.state.sell_price = None;
            self.state.sell_limit_set = false;
            self.state.buy_prediction_timestamp = None;
        }

        write_json(&self.path, &self.state)?;
        tracing::debug!("Saved {} position ({:?})", self.symbol, self.phase());

        Ok(())
    }
}
