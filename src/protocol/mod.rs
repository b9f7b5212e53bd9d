//! Command protocol spoken over the bus.
//!
//! A caller publishes a [`Command`] on `controller:commands` carrying a
//! `reply_to` channel it is already subscribed to; the controller answers
//! with exactly one [`Reply`] on that channel.

pub mod client;

pub use client::{reply_channel, RpcClient};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::models::InstanceKey;
use crate::{Error, Result};

/// Wire form of a command; every field but `cmd` is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fund_amnt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Command {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    pub fn fund_amnt(mut self, amount: f64) -> Self {
        self.fund_amnt = Some(amount);
        self
    }

    pub fn coin(mut self, coin: impl Into<String>) -> Self {
        self.coin = Some(coin.into());
        self
    }
}

/// A validated command
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Start {
        key: InstanceKey,
        strategy: String,
        fund_amnt: Option<f64>,
    },
    Stop {
        key: InstanceKey,
    },
    Status {
        key: InstanceKey,
    },
    GetBalance {
        key: InstanceKey,
    },
    List {
        owner: String,
    },
    ListAll,
    StopAll,
    AddCoin {
        coin: String,
    },
    Shutdown,
}

pub const DEFAULT_STRATEGY: &str = "default";

impl Request {
    pub fn parse(command: &Command) -> Result<Self> {
        let request = match command.cmd.as_str() {
            "start" => Request::Start {
                key: instance_key(command)?,
                strategy: command
                    .strategy
                    .clone()
                    .unwrap_or_else(|| DEFAULT_STRATEGY.to_string()),
                fund_amnt: command.fund_amnt,
            },
            "stop" => Request::Stop {
                key: instance_key(command)?,
            },
            "status" => Request::Status {
                key: instance_key(command)?,
            },
            "get_balance" => Request::GetBalance {
                key: instance_key(command)?,
            },
            "list" => Request::List {
                owner: command.owner.clone().ok_or(Error::MissingField("owner"))?,
            },
            "list_all" | "list all" => Request::ListAll,
            "stop_all" => Request::StopAll,
            "add_coin" => Request::AddCoin {
                coin: command.coin.clone().unwrap_or_default(),
            },
            "shutdown" => Request::Shutdown,
            other => return Err(Error::InvalidCommand(other.to_string())),
        };

        Ok(request)
    }
}

fn instance_key(command: &Command) -> Result<InstanceKey> {
    let symbol = command
        .symbol
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingField("symbol"))?;
    let owner = command
        .owner
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or(Error::MissingField("owner"))?;

    Ok(InstanceKey::new(symbol, owner))
}

/// `{ok: bool, ...}` with command-specific fields flattened alongside `ok`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub ok: bool,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            ok: true,
            fields: Map::new(),
        }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        Self {
            ok: false,
            fields: Map::new(),
        }
        .with("error", Value::String(message.to_string()))
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.get("error").and_then(Value::as_str)
    }
}

impl From<Result<Reply>> for Reply {
    fn from(result: Result<Reply>) -> Self {
        result.unwrap_or_else(Reply::error)
    }
}
