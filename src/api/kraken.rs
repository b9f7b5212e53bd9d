use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReferenceSettings;
use crate::{Error, Result};

const TICKER_PATH: &str = "/0/public/Ticker";

// Type alias for the rate limiter to simplify signatures
type KrakenRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Source of the rolling 24h range used to seed a new instance
#[async_trait]
pub trait ReferenceData: Send + Sync {
    /// `(high, low)` over the last 24 hours
    async fn high_low_24h(&self, symbol: &str) -> Result<(f64, f64)>;
}

/// Kraken public REST client
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct KrakenClient {
    client: Client,
    base_url: String,
    max_retries: u32,
    retry_delay: Duration,
    rate_limiter: Arc<KrakenRateLimiter>,
}

/// Envelope of every Kraken public response
#[derive(Debug, Deserialize)]
struct KrakenResponse {
    #[serde(default)]
    error: Vec<String>,
    result: Option<HashMap<String, TickerInfo>>,
}

/// Subset of the ticker payload; `h`/`l` are `[today, last 24 hours]`
#[derive(Debug, Deserialize)]
struct TickerInfo {
    h: Vec<String>,
    l: Vec<String>,
}

impl KrakenClient {
    pub fn new(settings: &ReferenceSettings) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;

        // public endpoints allow roughly one call per second
        let quota = Quota::per_second(NonZeroU32::MIN);

        Ok(Self {
            client,
            base_url: settings.rest_url.trim_end_matches('/').to_string(),
            max_retries: settings.max_retries.max(1),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Kraken pair name for a `BASE/QUOTE` symbol
    pub fn pair_name(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    /// Make a rate-limited ticker request with retry logic
    async fn fetch_ticker(&self, pair: &str) -> Result<KrakenResponse> {
        let url = format!("{}{}", self.base_url, TICKER_PATH);

        for attempt in 1..=self.max_retries {
            self.rate_limiter.until_ready().await;

            match self.client.get(&url).query(&[("pair", pair)]).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(
                            "Kraken returned {} for {}, retrying in {:?} (attempt {}/{})",
                            status,
                            pair,
                            self.retry_delay,
                            attempt,
                            self.max_retries
                        );
                        tokio::time::sleep(self.retry_delay).await;
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    return Err(Error::ReferenceData(format!(
                        "Kraken API error ({}): {}",
                        status, body
                    )));
                }
                Err(e) if attempt < self.max_retries => {
                    tracing::warn!(
                        "Network error fetching {}: {}, retrying in {:?} (attempt {}/{})",
                        pair,
                        e,
                        self.retry_delay,
                        attempt,
                        self.max_retries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::ReferenceData(format!(
            "ticker for {} failed after {} attempts",
            pair, self.max_retries
        )))
    }
}

#[async_trait]
impl ReferenceData for KrakenClient {
    async fn high_low_24h(&self, symbol: &str) -> Result<(f64, f64)> {
        let pair = Self::pair_name(symbol);
        let response = self.fetch_ticker(&pair).await?;

        if !response.error.is_empty() {
            return Err(Error::ReferenceData(response.error.join(", ")));
        }

        // Kraken keys the result by its own pair name (e.g. XXBTZUSD), so take the only entry
        let info = response
            .result
            .and_then(|r| r.into_values().next())
            .ok_or_else(|| Error::ReferenceData(format!("no ticker data for {}", pair)))?;

        let high = parse_rolling(&info.h, "high")?;
        let low = parse_rolling(&info.l, "low")?;

        tracing::debug!("{} 24h range: high ${:.4}, low ${:.4}", symbol, high, low);

        Ok((high, low))
    }
}

fn parse_rolling(values: &[String], field: &str) -> Result<f64> {
    values
        .get(1)
        .and_then(|v| v.parse::<f64>().ok())
        .ok_or_else(|| Error::ReferenceData(format!("malformed 24h {} in ticker", field)))
}
