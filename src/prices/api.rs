//! Price API clients
//!
//! Tiers against the exchange REST API: a batch price snapshot, and the 24h
//! ticker used as the fallback, queryable for a symbol list or one symbol at
//! a time. A batch request fails as a whole when any listed symbol is
//! unknown to the exchange. Symbols cross this boundary in dashboard
//! form (`BTC/USDT`); conversion to exchange form happens here.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const BINANCE_API_URL: &str = "https://api.binance.com";
const BINANCE_FALLBACK_URL: &str = "https://api1.binance.com";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("price API returned status {0}")]
    Status(u16),
    #[error("malformed price payload: {0}")]
    Payload(String),
}

/// Row from the snapshot endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotQuote {
    pub symbol: String,
    pub price: f64,
}

/// Row from the 24h ticker endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct TickerQuote {
    pub symbol: String,
    pub last_price: f64,
    pub price_change_percent: f64,
    pub volume: f64,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceApi: Send + Sync {
    /// Latest price for every listed symbol in one request
    async fn fetch_snapshot(&self, symbols: &[String]) -> Result<Vec<SnapshotQuote>, FetchError>;

    /// 24h ticker statistics for every listed symbol
    async fn fetch_tickers(&self, symbols: &[String]) -> Result<Vec<TickerQuote>, FetchError>;

    /// 24h ticker statistics for a single symbol
    async fn fetch_ticker(&self, symbol: &str) -> Result<TickerQuote, FetchError>;
}

#[derive(Debug, Deserialize)]
struct BinancePrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceTicker24h {
    symbol: String,
    last_price: String,
    price_change_percent: String,
    volume: String,
}

/// `BTC/USDT` -> `BTCUSDT`
pub fn exchange_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

fn parse_number(field: &str, raw: &str) -> Result<f64, FetchError> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| FetchError::Payload(format!("{field} `{raw}` is not a number")))
}

/// REST client for Binance spot tickers
pub struct BinancePriceApi {
    client: Client,
    primary_url: String,
    fallback_url: String,
}

impl BinancePriceApi {
    pub fn new(primary_url: &str, fallback_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            primary_url: primary_url.trim_end_matches('/').to_string(),
            fallback_url: fallback_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn with_defaults() -> anyhow::Result<Self> {
        Self::new(BINANCE_API_URL, BINANCE_FALLBACK_URL, Duration::from_secs(5))
    }

    /// Exchange-form symbol list plus the way back to dashboard form
    fn symbol_query(symbols: &[String]) -> Result<(String, HashMap<String, String>), FetchError> {
        let back: HashMap<String, String> = symbols
            .iter()
            .map(|s| (exchange_symbol(s), s.clone()))
            .collect();
        let list: Vec<&String> = back.keys().collect();
        let query = serde_json::to_string(&list).map_err(|e| FetchError::Payload(e.to_string()))?;
        Ok((query, back))
    }

    fn ticker_quote(symbol: String, row: BinanceTicker24h) -> Result<TickerQuote, FetchError> {
        Ok(TickerQuote {
            symbol,
            last_price: parse_number("lastPrice", &row.last_price)?,
            price_change_percent: parse_number("priceChangePercent", &row.price_change_percent)?,
            volume: parse_number("volume", &row.volume)?,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, FetchError> {
        let response = self.client.get(url).query(query).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl PriceApi for BinancePriceApi {
    async fn fetch_snapshot(&self, symbols: &[String]) -> Result<Vec<SnapshotQuote>, FetchError> {
        let (query, back) = Self::symbol_query(symbols)?;
        let url = format!("{}/api/v3/ticker/price", self.primary_url);
        let rows: Vec<BinancePrice> = self.get(&url, &[("symbols", query.as_str())]).await?;
        debug!(rows = rows.len(), "Price snapshot fetched");

        rows.into_iter()
            .filter_map(|row| back.get(&row.symbol).map(|symbol| (symbol.clone(), row)))
            .map(|(symbol, row)| {
                Ok(SnapshotQuote {
                    symbol,
                    price: parse_number("price", &row.price)?,
                })
            })
            .collect()
    }

    async fn fetch_tickers(&self, symbols: &[String]) -> Result<Vec<TickerQuote>, FetchError> {
        let (query, back) = Self::symbol_query(symbols)?;
        let url = format!("{}/api/v3/ticker/24hr", self.fallback_url);
        let rows: Vec<BinanceTicker24h> = self.get(&url, &[("symbols", query.as_str())]).await?;
        debug!(rows = rows.len(), "24h tickers fetched");

        rows.into_iter()
            .filter_map(|row| back.get(&row.symbol).map(|symbol| (symbol.clone(), row)))
            .map(|(symbol, row)| Self::ticker_quote(symbol, row))
            .collect()
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<TickerQuote, FetchError> {
        let url = format!("{}/api/v3/ticker/24hr", self.fallback_url);
        let exchange = exchange_symbol(symbol);
        let row: BinanceTicker24h = self.get(&url, &[("symbol", exchange.as_str())]).await?;
        Self::ticker_quote(symbol.to_string(), row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_symbol() {
        assert_eq!(exchange_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(exchange_symbol("eth-usdt"), "ETHUSDT");
        assert_eq!(exchange_symbol("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn test_symbol_query_round_trips_names() {
        let symbols = vec!["BTC/USDT".to_string()];
        let (query, back) = BinancePriceApi::symbol_query(&symbols).unwrap();
        assert_eq!(query, r#"["BTCUSDT"]"#);
        assert_eq!(back.get("BTCUSDT").map(String::as_str), Some("BTC/USDT"));
    }

    #[test]
    fn test_ticker_payload_shape() {
        let rows: Vec<BinanceTicker24h> = serde_json::from_str(
            r#"[{"symbol":"BTCUSDT","lastPrice":"64000.10","priceChangePercent":"-1.25","volume":"1234.5","count":10}]"#,
        )
        .unwrap();
        assert_eq!(rows[0].last_price, "64000.10");
        assert_eq!(parse_number("volume", &rows[0].volume).unwrap(), 1234.5);
        assert!(parse_number("price", "NaN").is_err());
        assert!(parse_number("price", "abc").is_err());
    }

    #[test]
    fn test_single_ticker_keeps_dashboard_symbol() {
        let row: BinanceTicker24h = serde_json::from_str(
            r#"{"symbol":"ETHUSDT","lastPrice":"3100.5","priceChangePercent":"0.75","volume":"88"}"#,
        )
        .unwrap();
        let quote = BinancePriceApi::ticker_quote("ETH/USDT".to_string(), row).unwrap();
        assert_eq!(quote.symbol, "ETH/USDT");
        assert_eq!(quote.last_price, 3100.5);
        assert_eq!(quote.price_change_percent, 0.75);
    }
}
