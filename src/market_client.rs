//! The exchange-protocol capability the ingestor depends on (§6.1).
//!
//! Treated abstractly by design: `MarketClient` names the operations an
//! ingestor needs and nothing about any one venue's quirks. `RestMarketClient`
//! is the one concrete implementation that keeps the crate runnable
//! end-to-end without taking on a full multi-exchange protocol layer.

use async_trait::async_trait;
use reqwest::{Client, header};
use serde::Deserialize;

use crate::error::{LakeError, Result};

/// One OHLCV candle: `[ts, open, high, low, close, volume]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One funding-rate observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FundingPoint {
    pub timestamp: i64,
    pub funding_rate: f64,
}

/// Enough of a venue's market listing to decide activity and type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketInfo {
    pub id: String,
    pub market_type: String,
    pub active: bool,
}

/// Distinguishes the one error kind the ingestor treats specially
/// (bounded 30s-sleep retry) from everything else (bounded 1s-sleep retry).
#[derive(Debug)]
pub enum ClientError {
    RateLimit,
    Other(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::RateLimit => write!(f, "rate limited"),
            ClientError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Abstract capability an `ExchangeIngestor` consumes (§6.1). Implementors
/// must be internally thread-safe: instances are shared across workers for
/// the same `(exchange, market)` (§5).
#[async_trait]
pub trait MarketClient: Send + Sync {
    async fn load_markets(&self) -> std::result::Result<Vec<MarketInfo>, ClientError>;

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ms: i64,
        limit: usize,
    ) -> std::result::Result<Vec<Candle>, ClientError>;

    async fn fetch_funding_rate_history(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> std::result::Result<Vec<FundingPoint>, ClientError>;

    async fn milliseconds(&self) -> std::result::Result<i64, ClientError>;

    fn parse_timeframe(&self, tf: &str) -> Result<i64>;
}

/// Public Binance-compatible REST client, built with the same
/// gzip/brotli/deflate + custom-user-agent `reqwest::Client` construction
/// idiom used elsewhere in this codebase for outbound HTTP.
pub struct RestMarketClient {
    client: Client,
    base_url: String,
}

impl RestMarketClient {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .default_headers(headers)
            .user_agent("dl-datalake/0.1 (rust)")
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn map_err(status: reqwest::StatusCode, body: String) -> ClientError {
        if status.as_u16() == 429 {
            ClientError::RateLimit
        } else {
            ClientError::Other(format!("HTTP {status}: {body}"))
        }
    }
}

#[derive(Deserialize)]
struct ExchangeInfoSymbol {
    symbol: String,
    status: String,
    #[serde(rename = "contractType")]
    contract_type: Option<String>,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<ExchangeInfoSymbol>,
}

#[derive(Deserialize)]
struct FundingRateRow {
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate", deserialize_with = "de_f64_str")]
    funding_rate: f64,
}

fn de_f64_str<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse::<f64>().map_err(serde::de::Error::custom)
}

#[async_trait]
impl MarketClient for RestMarketClient {
    async fn load_markets(&self) -> std::result::Result<Vec<MarketInfo>, ClientError> {
        let url = format!("{}/exchangeInfo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Other(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_err(status, body));
        }
        let info: ExchangeInfo = resp.json().await.map_err(|e| ClientError::Other(e.to_string()))?;
        Ok(info
            .symbols
            .into_iter()
            .map(|s| MarketInfo {
                active: s.status == "TRADING",
                market_type: s.contract_type.unwrap_or_else(|| "SPOT".to_string()),
                id: s.symbol,
            })
            .collect())
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        since_ms: i64,
        limit: usize,
    ) -> std::result::Result<Vec<Candle>, ClientError> {
        let url = format!(
            "{}/klines?symbol={}&interval={}&startTime={}&limit={}",
            self.base_url, symbol, timeframe, since_ms, limit
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Other(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_err(status, body));
        }
        let rows: Vec<Vec<serde_json::Value>> =
            resp.json().await.map_err(|e| ClientError::Other(e.to_string()))?;

        let parse_f64 = |v: &serde_json::Value| -> f64 {
            v.as_str()
                .and_then(|s| s.parse::<f64>().ok())
                .or_else(|| v.as_f64())
                .unwrap_or(0.0)
        };

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Some(Candle {
                    ts: row.first()?.as_i64()?,
                    open: parse_f64(row.get(1)?),
                    high: parse_f64(row.get(2)?),
                    low: parse_f64(row.get(3)?),
                    close: parse_f64(row.get(4)?),
                    volume: parse_f64(row.get(5)?),
                })
            })
            .collect())
    }

    async fn fetch_funding_rate_history(
        &self,
        symbol: &str,
        since_ms: i64,
    ) -> std::result::Result<Vec<FundingPoint>, ClientError> {
        let url = format!(
            "{}/fundingRate?symbol={}&startTime={}&limit=1000",
            self.base_url, symbol, since_ms
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClientError::Other(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_err(status, body));
        }
        let rows: Vec<FundingRateRow> =
            resp.json().await.map_err(|e| ClientError::Other(e.to_string()))?;
        Ok(rows
            .into_iter()
            .map(|r| FundingPoint {
                timestamp: r.funding_time,
                funding_rate: r.funding_rate,
            })
            .collect())
    }

    async fn milliseconds(&self) -> std::result::Result<i64, ClientError> {
        Ok(chrono::Utc::now().timestamp_millis())
    }

    fn parse_timeframe(&self, tf: &str) -> Result<i64> {
        let (num_str, unit) = tf.split_at(tf.len().saturating_sub(1));
        let num: i64 = num_str.parse().map_err(|_| LakeError::ParseError {
            field: "timeframe",
            value: tf.to_string(),
        })?;
        let seconds = match unit {
            "m" => num * 60,
            "h" => num * 3600,
            "d" => num * 86400,
            "w" => num * 604800,
            _ => {
                return Err(LakeError::ParseError {
                    field: "timeframe",
                    value: tf.to_string(),
                });
            }
        };
        Ok(seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeframe_covers_common_units() {
        let client = RestMarketClient::new("https://example.invalid").unwrap();
        assert_eq!(client.parse_timeframe("1m").unwrap(), 60);
        assert_eq!(client.parse_timeframe("15m").unwrap(), 900);
        assert_eq!(client.parse_timeframe("1h").unwrap(), 3600);
        assert_eq!(client.parse_timeframe("1d").unwrap(), 86400);
    }

    #[test]
    fn parse_timeframe_rejects_unknown_unit() {
        let client = RestMarketClient::new("https://example.invalid").unwrap();
        assert!(client.parse_timeframe("1x").is_err());
    }
}
