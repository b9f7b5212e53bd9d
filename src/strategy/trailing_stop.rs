use super::{MarketView, Strategy};
use crate::config::StrategySettings;
use crate::execution::PositionState;

/// Buy a small dip below the predicting tick, ride a trailing stop out
///
/// - Entry: current price less `entry_discount_pct`
/// - Exit target: entry plus `take_profit_pct` (recorded as the sell limit)
/// - Stop: `stop_loss_pct` below entry, then below each new price
/// - Sell as soon as price trades at or through the stop
#[derive(Debug, Clone)]
pub struct TrailingStopStrategy {
    stop_loss_pct: f64,
    entry_discount_pct: f64,
    take_profit_pct: f64,
}

impl TrailingStopStrategy {
    pub fn new(settings: &StrategySettings) -> Self {
        Self {
            stop_loss_pct: settings.stop_loss_pct,
            entry_discount_pct: settings.entry_discount_pct,
            take_profit_pct: settings.take_profit_pct,
        }
    }
}

impl Default for TrailingStopStrategy {
    fn default() -> Self {
        Self::new(&StrategySettings::default())
    }
}

impl Strategy for TrailingStopStrategy {
    fn name(&self) -> &str {
        "trailing_stop"
    }

    fn stop_loss_pct(&self) -> f64 {
        self.stop_loss_pct
    }

    fn predict_entry(&self, price: f64, _market: &MarketView) -> f64 {
        price * (1.0 - self.entry_discount_pct / 100.0)
    }

    fn predict_exit(&self, price: f64, _market: &MarketView, position: &PositionState) -> f64 {
        position.entry_price.unwrap_or(price) * (1.0 + self.take_profit_pct / 100.0)
    }

    fn should_buy(&self, price: f64, _market: &MarketView, position: &PositionState) -> bool {
        position.entry_price.is_some_and(|entry| price <= entry)
    }

    fn should_sell(&self, price: f64, _market: &MarketView, position: &PositionState) -> bool {
        position.trailing_stop.is_some_and(|stop| price <= stop)
    }

    fn trailing_stop(&self, price: f64, _market: &MarketView, _position: &PositionState) -> f64 {
        price * (1.0 - self.stop_loss_pct / 100.0)
    }
}
