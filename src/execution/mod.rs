// Position state and trade log persistence
pub mod position_manager;
pub mod trade_log;

pub use position_manager::{FundsConfig, PositionManager, PositionPhase, PositionState};
pub use trade_log::{TradeEvent, TradeLog, TradeLogEntry};
