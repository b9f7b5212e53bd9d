use super::{EventBus, Subscription};
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Msg};
use std::pin::Pin;
use tokio::time::{timeout, Duration};

/// Redis-backed bus: PUBLISH/SUBSCRIBE for channels, GET/SET for keys
///
/// Cloning shares the underlying multiplexed connection. Every subscription
/// opens its own dedicated pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    conn: ConnectionManager,
}

impl RedisBus {
    /// Connect to Redis
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://127.0.0.1:6379")
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;

        let conn = timeout(Duration::from_secs(5), ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| Error::Timeout)??;

        tracing::info!("Connected to Redis at {}", redis_url);

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl EventBus for RedisBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        tracing::debug!("Subscribed to {}", channel);

        Ok(Box::new(RedisSubscription {
            channel: channel.to_string(),
            messages: Box::pin(pubsub.into_on_message()),
        }))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }
}

struct RedisSubscription {
    channel: String,
    messages: Pin<Box<dyn Stream<Item = Msg> + Send>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_message(&mut self, wait: Duration) -> Result<Option<String>> {
        match timeout(wait, self.messages.next()).await {
            Err(_) => Ok(None),
            Ok(Some(msg)) => Ok(Some(msg.get_payload::<String>()?)),
            Ok(None) => {
                tracing::warn!("Pub/sub connection for {} closed", self.channel);
                Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "pub/sub connection closed",
                ))
                .into())
            }
        }
    }
}
