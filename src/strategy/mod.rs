// Trading strategy module
pub mod breakout;
pub mod engine;
pub mod trailing_stop;

pub use breakout::BreakoutStrategy;
pub use engine::{StrategyStatus, TradingEngine};
pub use trailing_stop::TrailingStopStrategy;

use crate::config::StrategySettings;
use crate::execution::PositionState;
use crate::models::TrendState;
use crate::{Error, Result};

/// Market context the engine hands to a strategy on every decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketView {
    pub last_price: f64,
    pub local_high: f64,
    pub local_low: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    pub trend: Option<TrendState>,
}

/// Replaceable decision logic for entries, exits and trailing stops
///
/// The engine owns sequencing, persistence and logging; implementations
/// only answer questions about prices.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Stop-loss distance below entry, in percent
    fn stop_loss_pct(&self) -> f64;

    /// Price at which to enter when idle
    fn predict_entry(&self, price: f64, market: &MarketView) -> f64;

    /// Price at which to exit once a position is open
    fn predict_exit(&self, price: f64, market: &MarketView, position: &PositionState) -> f64;

    fn should_buy(&self, price: f64, market: &MarketView, position: &PositionState) -> bool;

    fn should_sell(&self, price: f64, market: &MarketView, position: &PositionState) -> bool;

    /// Trailing stop placed when a position opens
    fn initial_trailing_stop(&self, entry_price: f64) -> f64 {
        entry_price * (1.0 - self.stop_loss_pct() / 100.0)
    }

    /// Candidate stop for the current price. The engine only ever tightens.
    fn trailing_stop(&self, price: f64, market: &MarketView, position: &PositionState) -> f64;
}

/// Build a strategy by the name used in `start` commands
pub fn from_name(name: &str, settings: &StrategySettings) -> Result<Box<dyn Strategy>> {
    match name {
        "base" | "default" | "trailing_stop" => Ok(Box::new(TrailingStopStrategy::new(settings))),
        "breakout" => Ok(Box::new(BreakoutStrategy::new(settings))),
        other => Err(Error::UnknownStrategy(other.to_string())),
    }
}
