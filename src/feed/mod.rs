//! Exchange trade stream republished as normalized ticks.
//!
//! The feed never gives up: any socket error or close is followed by a
//! delay and a fresh connection with fresh subscriptions. Trades missed
//! while disconnected are not replayed.

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use crate::bus::{lvc_key, publish_json, set_json, tick_channel, EventBus};
use crate::config::FeedSettings;
use crate::models::Tick;
use crate::Result;

/// Local observer of every trade, called before the tick is published
pub type PriceCallback = Arc<dyn Fn(&str, f64) + Send + Sync>;

/// Handle returned by [`MarketDataFeed::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

/// Cloneable; clones share callbacks and latest prices.
#[derive(Clone)]
pub struct MarketDataFeed {
    symbols: Vec<String>,
    bus: Arc<dyn EventBus>,
    settings: FeedSettings,
    callbacks: Arc<Mutex<Vec<(CallbackId, PriceCallback)>>>,
    next_id: Arc<AtomicU64>,
    latest_prices: Arc<Mutex<HashMap<String, f64>>>,
}

impl MarketDataFeed {
    pub fn new(symbols: Vec<String>, bus: Arc<dyn EventBus>, settings: FeedSettings) -> Self {
        Self {
            symbols,
            bus,
            settings,
            callbacks: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(0)),
            latest_prices: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn subscribe(&self, callback: impl Fn(&str, f64) + Send + Sync + 'static) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback; false if it was not registered
    pub fn unsubscribe(&self, id: CallbackId) -> bool {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id);
        callbacks.len() != before
    }

    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        self.latest_prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(symbol)
            .copied()
    }

    /// Run the connection loop in its own task until `cancel` fires
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let feed = self.clone();
        tokio::spawn(async move { feed.run(cancel).await })
    }

    async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            "Market data feed starting for {} symbol(s) via {}",
            self.symbols.len(),
            self.settings.ws_url
        );

        loop {
            match self.stream_once(&cancel).await {
                Ok(()) => tracing::warn!("Websocket closed"),
                Err(e) => tracing::warn!("Websocket error: {}", e),
            }

            if cancel.is_cancelled() {
                break;
            }

            let delay = self.reconnect_delay();
            tracing::info!("Websocket disconnected, reconnecting in {:?}", delay);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        tracing::info!("Market data feed stopped");
    }

    fn reconnect_delay(&self) -> Duration {
        let jitter = match self.settings.reconnect_jitter_ms {
            0 => 0,
            max => rand::thread_rng().gen_range(0..=max),
        };
        self.settings.reconnect_delay() + Duration::from_millis(jitter)
    }

    /// One connection lifetime. Ok on a clean close or cancellation.
    async fn stream_once(&self, cancel: &CancellationToken) -> Result<()> {
        let (ws_stream, _response) = connect_async(self.settings.ws_url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        for symbol in &self.symbols {
            let request = json!({
                "event": "subscribe",
                "pair": [symbol],
                "subscription": {"name": "trade"}
            });
            write.send(Message::Text(request.to_string())).await?;
        }
        tracing::info!("Subscribed to trades for {:?}", self.symbols);

        let period = self.settings.ping_interval().max(Duration::from_secs(1));
        let mut ping = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    write.send(Message::Ping(Vec::new())).await?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_message(&text).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::debug!("Close frame: {:?}", frame);
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
        }
    }

    /// Notify callbacks, publish the tick and refresh the last-value cache.
    /// Non-trade messages are ignored.
    pub async fn handle_message(&self, text: &str) -> Option<Tick> {
        let (symbol, price) = parse_trade_message(text)?;

        let callbacks: Vec<PriceCallback> = self
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(&symbol, price);
        }

        let tick = Tick::now(symbol.clone(), price);

        if let Err(e) = publish_json(self.bus.as_ref(), &tick_channel(&symbol), &tick).await {
            tracing::warn!("Failed to publish {} tick: {}", symbol, e);
        }
        if let Err(e) = set_json(self.bus.as_ref(), &lvc_key(&symbol), &tick).await {
            tracing::warn!("Failed to update {} last value: {}", symbol, e);
        }

        self.latest_prices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(symbol, price);

        Some(tick)
    }
}

/// Extract `(SYMBOL, price)` from a trade message
///
/// Trade messages are arrays ending in `"trade", "<pair>"` with the trade
/// list at index 1; the first trade's price is used.
pub fn parse_trade_message(text: &str) -> Option<(String, f64)> {
    let value: Value = serde_json::from_str(text).ok()?;
    let items = value.as_array()?;

    if items.len() < 4 || items[items.len() - 2].as_str()? != "trade" {
        return None;
    }

    let symbol = items[items.len() - 1].as_str()?.to_uppercase();
    let first = items[1].as_array()?.first()?;

    let price = match first.get(0)? {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };

    Some((symbol, price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    const TRADE: &str =
        r#"[337,[["181.25000","0.50000000","1700000000.123456","b","m",""]],"trade","sol/usd"]"#;

    fn feed(bus: &MemoryBus, ws_url: &str) -> MarketDataFeed {
        MarketDataFeed::new(
            vec!["SOL/USD".to_string()],
            Arc::new(bus.clone()),
            FeedSettings {
                ws_url: ws_url.to_string(),
                reconnect_delay_ms: 10,
                reconnect_jitter_ms: 5,
                ping_interval_secs: 40,
            },
        )
    }

    #[test]
    fn test_parse_trade_message() {
        let (symbol, price) = parse_trade_message(TRADE).unwrap();
        assert_eq!(symbol, "SOL/USD");
        assert_eq!(price, 181.25);
    }

    #[test]
    fn test_parse_ignores_other_messages() {
        assert_eq!(parse_trade_message(r#"{"event":"heartbeat"}"#), None);
        assert_eq!(
            parse_trade_message(r#"{"event":"subscriptionStatus","status":"subscribed"}"#),
            None
        );
        assert_eq!(parse_trade_message(r#"[337,[],"trade","SOL/USD"]"#), None);
        assert_eq!(parse_trade_message(r#"[337,[["x"]],"book","SOL/USD"]"#), None);
        assert_eq!(parse_trade_message("not json"), None);
    }

    #[tokio::test]
    async fn test_handle_message_publishes_and_caches() {
        let bus = MemoryBus::new();
        let feed = feed(&bus, "ws://unused");
        let mut ticks = bus.subscribe(&tick_channel("SOL/USD")).await.unwrap();

        let tick = feed.handle_message(TRADE).await.unwrap();
        assert_eq!(tick.symbol, "SOL/USD");

        let raw = ticks
            .next_message(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        let published: Tick = serde_json::from_str(&raw).unwrap();
        assert_eq!(published.price, 181.25);

        let cached = bus.get(&lvc_key("SOL/USD")).await.unwrap().unwrap();
        assert_eq!(serde_json::from_str::<Tick>(&cached).unwrap(), published);
        assert_eq!(feed.latest_price("SOL/USD"), Some(181.25));
    }

    #[tokio::test]
    async fn test_callbacks_subscribe_and_unsubscribe() {
        let bus = MemoryBus::new();
        let feed = feed(&bus, "ws://unused");
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let id = feed.subscribe(move |symbol, price| {
            assert_eq!(symbol, "SOL/USD");
            assert_eq!(price, 181.25);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        feed.handle_message(TRADE).await;
        assert!(feed.unsubscribe(id));
        assert!(!feed.unsubscribe(id));
        feed.handle_message(TRADE).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // each connection serves one trade and then closes
        let server = tokio::spawn(async move {
            for price in ["100.5", "101.5"] {
                let (stream, _) = listener.accept().await.unwrap();
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

                let subscribe = ws.next().await.unwrap().unwrap();
                assert!(subscribe.to_text().unwrap().contains("\"subscribe\""));

                let trade = format!(
                    r#"[1,[["{}","0.1","1700000000.0","s","l",""]],"trade","SOL/USD"]"#,
                    price
                );
                ws.send(Message::Text(trade)).await.unwrap();
                ws.close(None).await.unwrap();
            }
        });

        let bus = MemoryBus::new();
        let feed = feed(&bus, &format!("ws://{}", addr));
        let mut ticks = bus.subscribe(&tick_channel("SOL/USD")).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = feed.start(cancel.clone());

        let mut prices = Vec::new();
        for _ in 0..2 {
            let raw = ticks
                .next_message(Duration::from_secs(5))
                .await
                .unwrap()
                .expect("tick before timeout");
            prices.push(serde_json::from_str::<Tick>(&raw).unwrap().price);
        }
        assert_eq!(prices, vec![100.5, 101.5]);

        server.await.unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
