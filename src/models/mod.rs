use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one running strategy: a symbol traded on behalf of an owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceKey {
    pub symbol: String,
    pub owner: String,
}

impl InstanceKey {
    pub fn new(symbol: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            owner: owner.into(),
        }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.symbol, self.owner)
    }
}

/// Normalized price observation published by the market data feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// Milliseconds since the Unix epoch
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
    pub symbol: String,
    pub price: f64,
}

impl Tick {
    pub fn now(symbol: impl Into<String>, price: f64) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            symbol: symbol.into(),
            price,
        }
    }
}

/// Direction of the most recent price move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendState {
    Up,
    Down,
}

/// Strip a trailing USD quote from a pair for use in file paths and log entries.
///
/// Any other separator is flattened so the result is always a single path
/// component.
pub fn clean_symbol(symbol: &str) -> String {
    symbol.strip_suffix("/USD").unwrap_or(symbol).replace('/', "-")
}
