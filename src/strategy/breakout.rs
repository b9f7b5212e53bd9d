use super::{MarketView, Strategy};
use crate::config::StrategySettings;
use crate::execution::PositionState;

/// Enter when price clears the local high, exit on the trailing stop
#[derive(Debug, Clone)]
pub struct BreakoutStrategy {
    stop_loss_pct: f64,
    margin_pct: f64,
    take_profit_pct: f64,
}

impl BreakoutStrategy {
    pub fn new(settings: &StrategySettings) -> Self {
        Self {
            stop_loss_pct: settings.stop_loss_pct,
            margin_pct: settings.entry_discount_pct,
            take_profit_pct: settings.take_profit_pct,
        }
    }
}

impl Strategy for BreakoutStrategy {
    fn name(&self) -> &str {
        "breakout"
    }

    fn stop_loss_pct(&self) -> f64 {
        self.stop_loss_pct
    }

    fn predict_entry(&self, price: f64, market: &MarketView) -> f64 {
        market.local_high.max(price) * (1.0 + self.margin_pct / 100.0)
    }

    fn predict_exit(&self, price: f64, _market: &MarketView, position: &PositionState) -> f64 {
        position.entry_price.unwrap_or(price) * (1.0 + self.take_profit_pct / 100.0)
    }

    fn should_buy(&self, price: f64, _market: &MarketView, position: &PositionState) -> bool {
        position.entry_price.is_some_and(|entry| price >= entry)
    }

    fn should_sell(&self, price: f64, _market: &MarketView, position: &PositionState) -> bool {
        position.trailing_stop.is_some_and(|stop| price <= stop)
    }

    fn trailing_stop(&self, price: f64, _market: &MarketView, _position: &PositionState) -> f64 {
        price * (1.0 - self.stop_loss_pct / 100.0)
    }
}
