//! Prices module - polled market prices
//!
//! [`PriceApi`] talks to the exchange; [`PriceFeedManager`] owns the cache,
//! the poll loop and the per-symbol subscribers.

pub mod api;
pub mod feed;

pub use api::{exchange_symbol, BinancePriceApi, FetchError, PriceApi, SnapshotQuote, TickerQuote};
pub use feed::{PriceCallback, PriceFeedConfig, PriceFeedManager, PriceFeedStatus};
