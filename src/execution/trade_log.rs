use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::models::clean_symbol;
use crate::persistence::{read_json, write_json};
use crate::Result;

/// Kind of decision recorded in the trade log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeEvent {
    BuyPrediction,
    SellPrediction,
    BuyExecuted,
    TrailingStopSale,
    PredictionReset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLogEntry {
    /// ISO-8601 wall clock time
    pub timestamp: DateTime<Utc>,
    /// Seconds since the Unix epoch
    pub raw_timestamp: f64,
    pub symbol: String,
    pub price: Option<f64>,
    pub event: TradeEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty_held: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl TradeLogEntry {
    pub fn new(symbol: &str, price: Option<f64>, event: TradeEvent) -> Self {
        let timestamp = Utc::now();
        Self {
            timestamp,
            raw_timestamp: timestamp.timestamp_millis() as f64 / 1000.0,
            symbol: clean_symbol(symbol),
            price,
            event,
            qty_held: None,
            balance: None,
            note: None,
        }
    }

    /// Attach the accounting amount that belongs to this event kind
    pub fn with_amount(mut self, amount: Option<f64>) -> Self {
        match self.event {
            TradeEvent::BuyExecuted => self.qty_held = amount,
            TradeEvent::TrailingStopSale => self.balance = amount,
            _ => {}
        }
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Append-only JSON array of [`TradeLogEntry`] for one instance
pub struct TradeLog {
    path: PathBuf,
}

impl TradeLog {
    /// Log stored at `<trade_data_dir>/<owner>/<SYMBOL>/trade_calls.json`
    pub fn new(trade_data_dir: &Path, owner: &str, symbol: &str) -> Self {
        Self {
            path: trade_data_dir
                .join(owner)
                .join(clean_symbol(symbol))
                .join("trade_calls.json"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: TradeLogEntry) -> Result<()> {
        let mut entries = self.entries()?;
        entries.push(entry);
        write_json(&self.path, &entries)
    }

    pub fn entries(&self) -> Result<Vec<TradeLogEntry>> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }
}
