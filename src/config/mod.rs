//! Configuration management for TradeFeed
//!
//! Loads from optional config files + environment variables via .env

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::prices::PriceFeedConfig;
use crate::signals::{IngestConfig, WsTransportConfig};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub ingest: IngestSettings,
    pub router: RouterSettings,
    pub price_feed: PriceFeedSettings,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    /// Broadcast WebSocket endpoint
    pub url: String,
    /// Topic carrying signal frames
    pub topic: String,
    /// Frames arriving within this window are delivered together
    pub batch_window_ms: u64,
    /// Reconnect delay is `base_delay_ms * attempt`
    pub base_delay_ms: u64,
    pub max_attempts: u32,
    /// Channel reported TIMED_OUT after this long without traffic
    pub silence_timeout_ms: u64,
    pub ping_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSettings {
    /// Capacity of the newest-first signal buffer
    pub max_signals: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceFeedSettings {
    /// Snapshot endpoint base URL
    pub primary_url: String,
    /// 24h ticker endpoint base URL
    pub fallback_url: String,
    pub poll_interval_ms: u64,
    pub min_fetch_gap_ms: u64,
    pub notify_throttle_ms: u64,
    pub request_timeout_ms: u64,
    /// Symbols watched from startup (dashboard form, e.g. BTC/USDT)
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; RUST_LOG wins when set
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            // Ingest defaults
            .set_default("ingest.url", "ws://127.0.0.1:4000/signals")?
            .set_default("ingest.topic", "trading_signals")?
            .set_default("ingest.batch_window_ms", 100)?
            .set_default("ingest.base_delay_ms", 1000)?
            .set_default("ingest.max_attempts", 5)?
            .set_default("ingest.silence_timeout_ms", 30_000)?
            .set_default("ingest.ping_interval_ms", 15_000)?
            // Router defaults
            .set_default("router.max_signals", 100)?
            // Price feed defaults
            .set_default("price_feed.primary_url", "https://api.binance.com")?
            .set_default("price_feed.fallback_url", "https://api1.binance.com")?
            .set_default("price_feed.poll_interval_ms", 3000)?
            .set_default("price_feed.min_fetch_gap_ms", 1000)?
            .set_default("price_feed.notify_throttle_ms", 200)?
            .set_default("price_feed.request_timeout_ms", 5000)?
            .set_default("price_feed.symbols", vec!["BTC/USDT", "ETH/USDT"])?
            // Logging defaults
            .set_default("logging.filter", "info")?
            .set_default("logging.json", false)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (TRADEFEED__*)
            .add_source(
                Environment::with_prefix("TRADEFEED")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("price_feed.symbols"),
            )
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;

        Ok(app_config)
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.ingest.topic.trim().is_empty() {
            bail!("ingest.topic must not be empty");
        }
        if self.ingest.max_attempts == 0 {
            bail!("ingest.max_attempts must be at least 1");
        }
        if self.router.max_signals == 0 {
            bail!("router.max_signals must be at least 1");
        }
        if self.price_feed.poll_interval_ms == 0 {
            bail!("price_feed.poll_interval_ms must be positive");
        }
        Ok(())
    }

    /// Generate a digest of the config for logging
    pub fn digest(&self) -> String {
        format!(
            "topic={} batch={}ms retries={}x{}ms buffer={} poll={}ms symbols={:?}",
            self.ingest.topic,
            self.ingest.batch_window_ms,
            self.ingest.max_attempts,
            self.ingest.base_delay_ms,
            self.router.max_signals,
            self.price_feed.poll_interval_ms,
            self.price_feed.symbols
        )
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            topic: self.ingest.topic.clone(),
            batch_window: Duration::from_millis(self.ingest.batch_window_ms),
            base_delay: Duration::from_millis(self.ingest.base_delay_ms),
            max_attempts: self.ingest.max_attempts,
        }
    }

    pub fn transport_config(&self) -> WsTransportConfig {
        WsTransportConfig {
            url: self.ingest.url.clone(),
            ping_interval: Duration::from_millis(self.ingest.ping_interval_ms),
            silence_timeout: Duration::from_millis(self.ingest.silence_timeout_ms),
        }
    }

    pub fn price_feed_config(&self) -> PriceFeedConfig {
        PriceFeedConfig {
            poll_interval: Duration::from_millis(self.price_feed.poll_interval_ms),
            min_fetch_gap: Duration::from_millis(self.price_feed.min_fetch_gap_ms),
            notify_throttle: Duration::from_millis(self.price_feed.notify_throttle_ms),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.price_feed.request_timeout_ms)
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_load() {
        let config = AppConfig::load().expect("defaults should load");
        assert_eq!(config.ingest.topic, "trading_signals");
        assert_eq!(config.router.max_signals, 100);

        let ingest = config.ingest_config();
        assert_eq!(ingest.batch_window, Duration::from_millis(100));
        assert_eq!(ingest.base_delay, Duration::from_secs(1));
        assert_eq!(ingest.max_attempts, 5);

        let feed = config.price_feed_config();
        assert_eq!(feed.poll_interval, Duration::from_secs(3));
        assert_eq!(feed.min_fetch_gap, Duration::from_secs(1));
        assert_eq!(feed.notify_throttle, Duration::from_millis(200));
        assert!(config.digest().contains("topic=trading_signals"));
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = AppConfig::load().expect("defaults should load");
        config.ingest.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
