use super::{EventBus, Subscription};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// In-process bus with the same delivery semantics as the Redis one
///
/// Cloneable; all clones share channels and keys.
#[derive(Clone, Default)]
pub struct MemoryBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<String>>>>,
    store: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = channels.get(channel) {
            // no receivers is not an error: the message is simply dropped
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        let rx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        Ok(Box::new(MemorySubscription { rx }))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

struct MemorySubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(message)) => return Ok(Some(message)),
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::warn!("Subscriber lagged, {} messages dropped", skipped);
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_publish_reaches_existing_subscriber() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("ticks:SOL/USD").await.unwrap();

        bus.publish("ticks:SOL/USD", "hello").await.unwrap();

        assert_eq!(sub.next_message(WAIT).await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_message() {
        let bus = MemoryBus::new();
        bus.publish("reply:1", "lost").await.unwrap();

        let mut sub = bus.subscribe("reply:1").await.unwrap();
        assert_eq!(sub.next_message(WAIT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_order_preserved_within_channel() {
        let bus = MemoryBus::new();
        let mut sub = bus.subscribe("c").await.unwrap();

        for i in 0..5 {
            bus.publish("c", &i.to_string()).await.unwrap();
        }

        for i in 0..5 {
            assert_eq!(sub.next_message(WAIT).await.unwrap(), Some(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_channels_are_isolated() {
        let bus = MemoryBus::new();
        let mut sol = bus.subscribe("ticks:SOL/USD").await.unwrap();

        bus.publish("ticks:ETH/USD", "eth").await.unwrap();
        assert_eq!(sol.next_message(WAIT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_key_value_store() {
        let bus = MemoryBus::new();
        assert_eq!(bus.get("controller:alive").await.unwrap(), None);

        bus.set("controller:alive", "true").await.unwrap();
        assert_eq!(
            bus.get("controller:alive").await.unwrap(),
            Some("true".to_string())
        );
    }

    #[tokio::test]
    async fn test_dropped_subscription_releases_receiver() {
        let bus = MemoryBus::new();
        let sub = bus.subscribe("c").await.unwrap();
        assert_eq!(bus.subscriber_count("c"), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count("c"), 0);
    }
}
