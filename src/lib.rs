// Core modules
pub mod api;
pub mod bus;
pub mod config;
pub mod controller;
pub mod error;
pub mod execution;
pub mod feed;
pub mod models;
pub mod persistence;
pub mod protocol;
pub mod strategy;

// Re-export commonly used types
pub use crate::bus::{EventBus, MemoryBus, RedisBus};
pub use crate::config::Settings;
pub use crate::controller::Controller;
pub use crate::error::Error;
pub use crate::models::*;
pub use crate::strategy::Strategy;

// Error handling
pub type Result<T> = std::result::Result<T, Error>;

/// Default log filter for the binaries, overridden by `RUST_LOG`
pub fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trade_controller=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// SIGINT or SIGTERM, whichever arrives first
///
/// Handlers are installed by [`ShutdownSignal::install`], so a signal sent
/// before `recv` is awaited is not lost.
pub struct ShutdownSignal {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    /// Wait for the next shutdown signal and return its name
    pub async fn recv(&mut self) -> std::io::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT"),
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }

        #[cfg(not(unix))]
        {
            tokio::signal::ctrl_c().await.map(|_| "SIGINT")
        }
    }
}
