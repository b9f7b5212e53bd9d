use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Command, Reply};
use crate::bus::{publish_json, EventBus, ALIVE_KEY, COMMAND_CHANNEL};
use crate::{Error, Result};

/// Fresh correlation channel for one request
pub fn reply_channel() -> String {
    format!("controller:reply:{}", Uuid::new_v4())
}

/// Request/response over the bus
///
/// Each request gets its own reply channel, subscribed before the command
/// is published, so a reply can never be missed by a live caller.
#[derive(Clone)]
pub struct RpcClient {
    bus: Arc<dyn EventBus>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(bus: Arc<dyn EventBus>, timeout: Duration) -> Self {
        Self { bus, timeout }
    }

    /// Send a command and wait for its reply; [`Error::Timeout`] if none arrives in time
    pub async fn request(&self, mut command: Command) -> Result<Reply> {
        let reply_to = reply_channel();
        command.reply_to = Some(reply_to.clone());

        let mut replies = self.bus.subscribe(&reply_to).await?;
        publish_json(self.bus.as_ref(), COMMAND_CHANNEL, &command).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }

            let Some(raw) = replies.next_message(remaining).await? else {
                return Err(Error::Timeout);
            };

            match serde_json::from_str::<Reply>(&raw) {
                Ok(reply) => return Ok(reply),
                Err(e) => tracing::warn!("Ignoring malformed reply on {}: {}", reply_to, e),
            }
        }
    }

    /// Publish a command without waiting for (or asking for) a reply
    pub async fn send(&self, mut command: Command) -> Result<()> {
        command.reply_to = None;
        publish_json(self.bus.as_ref(), COMMAND_CHANNEL, &command).await
    }

    /// Whether the controller's dispatch loop reports itself running
    pub async fn is_alive(&self) -> Result<bool> {
        Ok(self.bus.get(ALIVE_KEY).await?.as_deref() == Some("true"))
    }
}
