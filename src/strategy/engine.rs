use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{MarketView, Strategy};
use crate::execution::{PositionManager, PositionPhase, PositionState, TradeEvent, TradeLog, TradeLogEntry};
use crate::models::TrendState;
use crate::Result;

/// Per-instance decision loop: turns one tick at a time into buy/sell
/// decisions, trend tracking and trailing-stop management.
///
/// Persistence goes through the owned [`PositionManager`]; every decision
/// point saves explicitly.
pub struct TradingEngine {
    symbol: String,
    owner: String,
    strategy: Box<dyn Strategy>,
    pm: PositionManager,
    log: TradeLog,
    prediction_ttl_secs: f64,

    last_price: Option<f64>,
    local_high: Option<f64>,
    local_low: Option<f64>,
    high_24h: Option<f64>,
    low_24h: Option<f64>,
    trend: Option<TrendState>,
}

/// Point-in-time view of an engine, used for `status` replies
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyStatus {
    pub symbol: String,
    pub owner: String,
    pub strategy: String,
    pub phase: PositionPhase,
    pub last_price: Option<f64>,
    pub local_high: Option<f64>,
    pub local_low: Option<f64>,
    pub high_24h: Option<f64>,
    pub low_24h: Option<f64>,
    pub trend_state: Option<TrendState>,
    pub stop_loss_threshold: f64,
    #[serde(flatten)]
    pub position: PositionState,
}

impl TradingEngine {
    /// `reference` is the external (24h high, 24h low); when absent the
    /// extremes are seeded from the first tick.
    pub fn new(
        symbol: &str,
        owner: &str,
        strategy: Box<dyn Strategy>,
        pm: PositionManager,
        log: TradeLog,
        reference: Option<(f64, f64)>,
        prediction_ttl_secs: u64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            owner: owner.to_string(),
            strategy,
            pm,
            log,
            prediction_ttl_secs: prediction_ttl_secs as f64,
            last_price: None,
            local_high: None,
            local_low: None,
            high_24h: reference.map(|(high, _)| high),
            low_24h: reference.map(|(_, low)| low),
            trend: None,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn position(&self) -> &PositionManager {
        &self.pm
    }

    pub fn position_mut(&mut self) -> &mut PositionManager {
        &mut self.pm
    }

    pub fn trade_log(&self) -> &TradeLog {
        &self.log
    }

    pub fn trend(&self) -> Option<TrendState> {
        self.trend
    }

    pub fn status(&self) -> StrategyStatus {
        StrategyStatus {
            symbol: self.symbol.clone(),
            owner: self.owner.clone(),
            strategy: self.strategy.name().to_string(),
            phase: self.pm.phase(),
            last_price: self.last_price,
            local_high: self.local_high,
            local_low: self.local_low,
            high_24h: self.high_24h,
            low_24h: self.low_24h,
            trend_state: self.trend,
            stop_loss_threshold: self.strategy.stop_loss_pct(),
            position: self.pm.state().clone(),
        }
    }

    pub fn save_position(&mut self) -> Result<()> {
        self.pm.save()
    }

    /// Process one price observation (live trading - uses current time)
    pub fn on_tick(&mut self, price: f64) -> Result<Vec<TradeEvent>> {
        self.on_tick_at(price, Utc::now())
    }

    /// Process one price observation with explicit timestamp
    ///
    /// Returns the trade events recorded on this tick, in order.
    pub fn on_tick_at(&mut self, price: f64, now: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        let mut events = Vec::new();

        let Some(last_price) = self.last_price else {
            self.seed(price);
            return Ok(events);
        };

        let market = self.market_view(last_price);

        if !self.pm.is_position_open() && !self.pm.has_buy_limit() && !self.pm.has_sell_limit() {
            let entry = self.strategy.predict_entry(price, &market);
            tracing::info!("{} [{}] place buy order at ${:.4}", self.symbol, self.owner, entry);
            self.pm.set_buy_limit_at(entry, now);
            self.pm.save()?;
            self.record(TradeLogEntry::new(&self.symbol, Some(entry), TradeEvent::BuyPrediction), &mut events);
        } else if self.pm.is_position_open() && !self.pm.has_sell_limit() {
            let exit = self.strategy.predict_exit(price, &market, self.pm.state());
            tracing::info!("{} [{}] place sell order at ${:.4}", self.symbol, self.owner, exit);
            self.pm.set_sell_limit(exit);
            self.pm.save()?;
            self.record(TradeLogEntry::new(&self.symbol, Some(exit), TradeEvent::SellPrediction), &mut events);
        }

        if self.pm.has_buy_limit() {
            if !self.pm.is_position_open() && self.strategy.should_buy(price, &market, self.pm.state()) {
                self.execute_buy(now, &mut events)?;
            }
        } else if self.pm.has_sell_limit()
            && self.pm.is_position_open()
            && self.strategy.should_sell(price, &market, self.pm.state())
        {
            self.execute_sale(now, &mut events)?;
        }

        self.update_trend_extremes(price, last_price);

        if self.pm.is_position_open() {
            self.tighten_trailing_stop(price);
        }

        self.last_price = Some(price);
        tracing::debug!(
            "{} | price: ${:.4} | trend: {:?}",
            self.symbol,
            price,
            self.trend
        );

        if !self.pm.is_position_open() {
            if let Some(age) = self.pm.prediction_age_at(now) {
                if age > self.prediction_ttl_secs {
                    tracing::info!("{} [{}] buy prediction stale after {:.0}s, resetting", self.symbol, self.owner, age);
                    self.pm.reset_limits();
                    self.pm.save()?;
                    self.record(
                        TradeLogEntry::new(&self.symbol, None, TradeEvent::PredictionReset)
                            .with_note(format!("unfilled for {:.0}s", age)),
                        &mut events,
                    );
                }
            }
        }

        Ok(events)
    }

    /// First tick: seed extremes and the trend, never trade
    fn seed(&mut self, price: f64) {
        let high_24h = *self.high_24h.get_or_insert(price);
        let low_24h = *self.low_24h.get_or_insert(price);

        self.last_price = Some(price);
        self.local_high = Some(high_24h);
        self.local_low = Some(low_24h);
        self.trend = None;

        tracing::info!(
            "{} [{}] seeded at ${:.4} (24h high ${:.4}, low ${:.4})",
            self.symbol,
            self.owner,
            price,
            high_24h,
            low_24h
        );
    }

    fn market_view(&self, last_price: f64) -> MarketView {
        MarketView {
            last_price,
            local_high: self.local_high.unwrap_or(last_price),
            local_low: self.local_low.unwrap_or(last_price),
            high_24h: self.high_24h.unwrap_or(last_price),
            low_24h: self.low_24h.unwrap_or(last_price),
            trend: self.trend,
        }
    }

    fn execute_buy(&mut self, now: DateTime<Utc>, events: &mut Vec<TradeEvent>) -> Result<()> {
        let Some(entry) = self.pm.state().entry_price else {
            return Ok(());
        };
        let trailing_stop = self.strategy.initial_trailing_stop(entry);

        self.pm.open_position_at(entry, trailing_stop, now);

        let qty = if self.pm.funds_enabled() {
            match self.pm.calculate_buy_qty() {
                Ok(qty) => Some(qty),
                Err(e) => {
                    tracing::warn!("{} [{}] could not size buy: {}", self.symbol, self.owner, e);
                    None
                }
            }
        } else {
            None
        };

        tracing::info!(
            "✅ {} [{}] buy executed at ${:.4} (stop ${:.4})",
            self.symbol,
            self.owner,
            entry,
            trailing_stop
        );

        self.pm.save()?;
        self.record(
            TradeLogEntry::new(&self.symbol, Some(entry), TradeEvent::BuyExecuted).with_amount(qty),
            events,
        );
        Ok(())
    }

    fn execute_sale(&mut self, now: DateTime<Utc>, events: &mut Vec<TradeEvent>) -> Result<()> {
        let Some(exit) = self.pm.state().trailing_stop else {
            return Ok(());
        };

        let balance = if self.pm.funds_enabled() {
            match self.pm.calculate_sell_total(exit) {
                Ok(total) => Some(total),
                Err(e) => {
                    tracing::warn!("{} [{}] could not total sale: {}", self.symbol, self.owner, e);
                    None
                }
            }
        } else {
            None
        };

        self.pm.close_position_at(exit, now);

        tracing::info!(
            "💰 {} [{}] trailing stop sale at ${:.4}",
            self.symbol,
            self.owner,
            exit
        );

        self.pm.save()?;
        self.record(
            TradeLogEntry::new(&self.symbol, Some(exit), TradeEvent::TrailingStopSale).with_amount(balance),
            events,
        );
        Ok(())
    }

    /// Track local and 24h extremes. A single tick against the trend flips it.
    fn update_trend_extremes(&mut self, price: f64, last_price: f64) {
        if matches!(self.trend, None | Some(TrendState::Up)) {
            if price > last_price {
                self.trend = Some(TrendState::Up);
            }
            raise(&mut self.local_high, price);
            raise(&mut self.high_24h, price);
            if price < last_price {
                self.trend = Some(TrendState::Down);
            }
        }

        // not an else: a flip to down on this tick also updates the lows
        if self.trend == Some(TrendState::Down) {
            lower(&mut self.local_low, price);
            lower(&mut self.low_24h, price);
            if price > last_price {
                self.trend = Some(TrendState::Up);
            }
        }
    }

    fn tighten_trailing_stop(&mut self, price: f64) {
        let market = self.market_view(self.last_price.unwrap_or(price));
        let candidate = self.strategy.trailing_stop(price, &market, self.pm.state());

        match self.pm.state().trailing_stop {
            Some(current) if candidate <= current => {}
            _ => self.pm.update_trailing_stop(candidate),
        }
    }

    /// Append to the trade log. A failed append is logged and the tick carries on.
    fn record(&self, entry: TradeLogEntry, events: &mut Vec<TradeEvent>) {
        events.push(entry.event);
        if let Err(e) = self.log.append(entry) {
            tracing::warn!(
                "{} [{}] failed to append to {}: {}",
                self.symbol,
                self.owner,
                self.log.path().display(),
                e
            );
        }
    }
}

fn raise(slot: &mut Option<f64>, price: f64) {
    if slot.map_or(true, |v| price > v) {
        *slot = Some(price);
    }
}

fn lower(slot: &mut Option<f64>, price: f64) {
    if slot.map_or(true, |v| price < v) {
        *slot = Some(price);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategySettings;
    use crate::strategy::TrailingStopStrategy;
    use chrono::Duration;
    use tempfile::{tempdir, TempDir};

    fn engine(dir: &TempDir, reference: Option<(f64, f64)>) -> TradingEngine {
        let pm = PositionManager::new(dir.path(), "alice", "SOL/USD");
        let log = TradeLog::new(dir.path(), "alice", "SOL/USD");
        TradingEngine::new(
            "SOL/USD",
            "alice",
            Box::new(TrailingStopStrategy::new(&StrategySettings::default())),
            pm,
            log,
            reference,
            86_400,
        )
    }

    fn feed(engine: &mut TradingEngine, prices: &[f64]) -> Vec<TradeEvent> {
        prices
            .iter()
            .flat_map(|p| engine.on_tick(*p).unwrap())
            .collect()
    }

    #[test]
    fn test_seed_tick_never_trades() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((190.0, 170.0)));

        let events = engine.on_tick(180.0).unwrap();

        assert!(events.is_empty());
        assert_eq!(engine.position().phase(), PositionPhase::Idle);
        let status = engine.status();
        assert_eq!(status.last_price, Some(180.0));
        assert_eq!(status.local_high, Some(190.0));
        assert_eq!(status.local_low, Some(170.0));
        assert_eq!(status.trend_state, None);
        assert!(engine.trade_log().entries().unwrap().is_empty());
    }

    #[test]
    fn test_seed_without_reference_uses_first_price() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, None);

        engine.on_tick(50.0).unwrap();

        let status = engine.status();
        assert_eq!(status.high_24h, Some(50.0));
        assert_eq!(status.low_24h, Some(50.0));
    }

    #[test]
    fn test_idle_predicts_entry_and_persists() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((110.0, 90.0)));

        let events = feed(&mut engine, &[100.0, 101.0]);

        assert_eq!(events, vec![TradeEvent::BuyPrediction]);
        assert_eq!(engine.position().phase(), PositionPhase::AwaitingEntry);
        let entry = engine.position().state().entry_price.unwrap();
        assert!(entry <= 101.0);

        let restored = PositionManager::load(dir.path(), "alice", "SOL/USD");
        assert!(restored.has_buy_limit());
    }

    #[test]
    fn test_trailing_stop_never_decreases_while_open() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((110.0, 90.0)));

        let mut stops = Vec::new();
        for price in [100.0, 101.0, 99.0, 105.0] {
            engine.on_tick(price).unwrap();
            if let Some(stop) = engine.position().state().trailing_stop {
                stops.push(stop);
            }
        }

        assert!(engine.position().is_position_open());
        assert_eq!(stops.len(), 2);
        assert!(stops.windows(2).all(|w| w[1] >= w[0]));
        assert!(stops[1] > stops[0]);
    }

    #[test]
    fn test_stop_does_not_loosen_on_dip() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((110.0, 90.0)));

        feed(&mut engine, &[100.0, 101.0, 99.0, 105.0]);
        let before = engine.position().state().trailing_stop.unwrap();

        // dip that stays above the stop
        engine.on_tick(103.5).unwrap();
        let after = engine.position().state().trailing_stop.unwrap();

        assert!(engine.position().is_position_open());
        assert_eq!(before, after);
    }

    #[test]
    fn test_full_cycle_logs_in_order() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((190.0, 170.0)));

        let events = feed(&mut engine, &[180.0, 182.0, 181.0, 200.0, 150.0]);

        assert_eq!(
            events,
            vec![
                TradeEvent::BuyPrediction,
                TradeEvent::BuyExecuted,
                TradeEvent::SellPrediction,
                TradeEvent::TrailingStopSale,
            ]
        );
        assert_eq!(engine.position().phase(), PositionPhase::Idle);

        let sale = engine.position().state().last_sale_price.unwrap();
        assert!((sale - 196.0).abs() < 1e-9);
    }

    #[test]
    fn test_funded_cycle_tracks_quantity_and_balance() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((190.0, 170.0)));
        engine.position_mut().configure_funds(Some(1000.0));

        feed(&mut engine, &[180.0, 182.0, 181.0, 200.0, 150.0]);

        let entries = engine.trade_log().entries().unwrap();
        let buy = entries.iter().find(|e| e.event == TradeEvent::BuyExecuted).unwrap();
        let sale = entries
            .iter()
            .find(|e| e.event == TradeEvent::TrailingStopSale)
            .unwrap();

        let qty = buy.qty_held.unwrap();
        assert!((qty - 1000.0 / buy.price.unwrap()).abs() < 1e-9);
        assert!((sale.balance.unwrap() - qty * 196.0).abs() < 1e-6);
        assert_eq!(engine.position().state().balance, sale.balance);
    }

    #[test]
    fn test_trend_flips_on_single_counter_tick() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((200.0, 100.0)));

        engine.on_tick(150.0).unwrap();
        engine.on_tick(151.0).unwrap();
        assert_eq!(engine.trend(), Some(TrendState::Up));

        engine.on_tick(150.5).unwrap();
        assert_eq!(engine.trend(), Some(TrendState::Down));

        engine.on_tick(150.6).unwrap();
        assert_eq!(engine.trend(), Some(TrendState::Up));
    }

    #[test]
    fn test_new_extremes_extend_24h_range() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((105.0, 95.0)));

        // upward breakout raises the highs
        engine.on_tick(100.0).unwrap();
        engine.on_tick(110.0).unwrap();
        assert_eq!(engine.status().high_24h, Some(110.0));
        assert_eq!(engine.status().local_high, Some(110.0));

        // a drop flips the trend and lowers the lows on the same tick
        engine.on_tick(80.0).unwrap();
        assert_eq!(engine.status().low_24h, Some(80.0));
        assert_eq!(engine.status().local_low, Some(80.0));
    }

    #[test]
    fn test_stale_prediction_resets_once() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((110.0, 90.0)));
        let start = Utc::now();

        engine.on_tick_at(100.0, start).unwrap();
        // entry at 101 * 0.995, never reached by the prices below
        engine.on_tick_at(101.0, start).unwrap();

        let later = start + Duration::hours(25);
        let events = engine.on_tick_at(102.0, later).unwrap();
        assert_eq!(events, vec![TradeEvent::PredictionReset]);
        assert_eq!(engine.position().state().buy_prediction_resets, 1);
        assert!(!engine.position().has_buy_limit());

        // the next tick makes a fresh prediction instead of resetting again
        let events = engine.on_tick_at(102.0, later + Duration::seconds(1)).unwrap();
        assert_eq!(events, vec![TradeEvent::BuyPrediction]);
        assert_eq!(engine.position().state().buy_prediction_resets, 1);

        // and that one goes stale exactly once more a window later
        let much_later = later + Duration::hours(25);
        let events = engine.on_tick_at(103.0, much_later).unwrap();
        assert_eq!(events, vec![TradeEvent::PredictionReset]);
        assert_eq!(engine.position().state().buy_prediction_resets, 2);
    }

    #[test]
    fn test_open_position_never_resets_prediction() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((110.0, 90.0)));
        let start = Utc::now();

        engine.on_tick_at(100.0, start).unwrap();
        engine.on_tick_at(101.0, start).unwrap();
        engine.on_tick_at(99.0, start).unwrap();
        assert!(engine.position().is_position_open());

        let events = engine
            .on_tick_at(100.0, start + Duration::hours(48))
            .unwrap();
        assert!(!events.contains(&TradeEvent::PredictionReset));
        assert_eq!(engine.position().state().buy_prediction_resets, 0);
    }

    #[test]
    fn test_restored_open_position_resumes_with_sell_prediction() {
        let dir = tempdir().unwrap();
        {
            let mut pm = PositionManager::new(dir.path(), "alice", "SOL/USD");
            pm.set_buy_limit(100.0);
            pm.open_position(100.0, 98.0);
            pm.save().unwrap();
        }

        let pm = PositionManager::load(dir.path(), "alice", "SOL/USD");
        let log = TradeLog::new(dir.path(), "alice", "SOL/USD");
        let mut engine = TradingEngine::new(
            "SOL/USD",
            "alice",
            Box::new(TrailingStopStrategy::default()),
            pm,
            log,
            Some((110.0, 90.0)),
            86_400,
        );

        let events = feed(&mut engine, &[101.0, 102.0]);
        assert_eq!(events, vec![TradeEvent::SellPrediction]);
        assert_eq!(engine.position().phase(), PositionPhase::AwaitingExit);
    }

    #[test]
    fn test_unwritable_trade_log_does_not_stall_ticks() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((190.0, 170.0)));
        let log_path = engine.trade_log().path().to_path_buf();
        std::fs::create_dir_all(log_path.parent().unwrap()).unwrap();
        std::fs::write(&log_path, "{corrupt").unwrap();

        let events = feed(&mut engine, &[180.0, 182.0, 181.0, 200.0]);
        assert_eq!(
            events,
            vec![TradeEvent::BuyPrediction, TradeEvent::BuyExecuted, TradeEvent::SellPrediction]
        );

        let status = engine.status();
        assert_eq!(status.last_price, Some(200.0));
        assert_eq!(status.high_24h, Some(200.0));
        let on_disk = PositionManager::load(dir.path(), "alice", "SOL/USD");
        assert_eq!(on_disk.phase(), PositionPhase::AwaitingExit);

        engine.on_tick(150.0).unwrap();
        let on_disk = PositionManager::load(dir.path(), "alice", "SOL/USD");
        assert_eq!(on_disk.phase(), PositionPhase::Idle);
        assert!((on_disk.state().last_sale_price.unwrap() - 196.0).abs() < 1e-9);
        assert!(engine.trade_log().entries().is_err());
    }

    #[test]
    fn test_status_flattens_position_fields() {
        let dir = tempdir().unwrap();
        let mut engine = engine(&dir, Some((110.0, 90.0)));
        feed(&mut engine, &[100.0, 101.0]);

        let json = serde_json::to_value(engine.status()).unwrap();
        assert_eq!(json["symbol"], "SOL/USD");
        assert_eq!(json["phase"], "awaiting_entry");
        assert_eq!(json["buy_limit_set"], true);
        assert_eq!(json["position_open"], false);
        assert_eq!(json["stop_loss_threshold"], 2.0);
    }
}
