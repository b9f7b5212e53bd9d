use thiserror::Error;

/// Errors surfaced by the controller, the bus and the per-instance components.
///
/// Missing state files and market-data socket failures are recovered where
/// they happen and never show up here.
#[derive(Error, Debug)]
pub enum Error {
    #[error("timed out waiting for reply")]
    Timeout,

    #[error("not running")]
    NotRunning,

    #[error("already running")]
    AlreadyRunning,

    #[error("unknown command: {0}")]
    InvalidCommand(String),

    #[error("missing {0}")]
    MissingField(&'static str),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("coin must be formatted correctly i.e. 'SOL/USD' (got '{0}')")]
    InvalidCoin(String),

    #[error("worker did not stop within {0}ms")]
    StopTimeout(u64),

    #[error("reference data unavailable: {0}")]
    ReferenceData(String),

    #[error("external command failed: {0}")]
    External(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
