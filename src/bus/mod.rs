//! Publish/subscribe transport with a small key-value store.
//!
//! Delivery is at-most-once: a message published while nobody is subscribed
//! to its channel is gone. Anyone expecting a reply must subscribe to the
//! reply channel before publishing the request.

pub mod memory;
pub mod redis_bus;

pub use memory::MemoryBus;
pub use redis_bus::RedisBus;

use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Channel the controller listens on for commands
pub const COMMAND_CHANNEL: &str = "controller:commands";

/// Key holding the controller liveness flag ("true" / "false")
pub const ALIVE_KEY: &str = "controller:alive";

/// Per-symbol tick channel
pub fn tick_channel(symbol: &str) -> String {
    format!("ticks:{}", symbol)
}

/// Per-symbol last-value cache key
pub fn lvc_key(symbol: &str) -> String {
    format!("lvc:{}", symbol)
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Fire-and-forget publish of a raw message
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Attach a new subscriber; only messages published after this returns are seen
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `timeout` for the next message.
    ///
    /// `Ok(None)` means nothing arrived in time. An error means the
    /// subscription is dead and should be recreated.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>>;
}

/// Serialize and publish through a trait object
pub async fn publish_json<T: Serialize>(bus: &dyn EventBus, channel: &str, value: &T) -> Result<()> {
    let message = serde_json::to_string(value)?;
    bus.publish(channel, &message).await
}

/// Serialize and store through a trait object
pub async fn set_json<T: Serialize>(bus: &dyn EventBus, key: &str, value: &T) -> Result<()> {
    let message = serde_json::to_string(value)?;
    bus.set(key, &message).await
}
