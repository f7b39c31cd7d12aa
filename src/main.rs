//! TradeFeed - real-time signal and price distribution
//!
//! Wires the live signal session and the price feed together and logs what
//! a dashboard would render, until Ctrl-C.

use anyhow::Result;
use std::sync::Arc;
use tracing::{info, warn};

use tradefeed::clock::{Clock, SystemClock};
use tradefeed::config::AppConfig;
use tradefeed::prices::{BinancePriceApi, PriceFeedManager};
use tradefeed::signals::{FilterCriteria, LiveSignals, SignalRouter, SignalUpdate, WsBroadcastTransport};
use tradefeed::telemetry;
use tradefeed::types::Strength;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    telemetry::init_tracing(&config.logging)?;

    info!("📡 TradeFeed v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Config: {}", config);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let router = Arc::new(SignalRouter::new(config.router.max_signals));
    let transport = Arc::new(WsBroadcastTransport::new(config.transport_config()));
    let live = LiveSignals::new(router.clone(), transport, config.ingest_config(), clock.clone());

    let live_handle = live.subscribe_to_live_signals(|signal| {
        info!(
            id = %signal.id,
            symbol = %signal.symbol,
            timeframe = %signal.timeframe,
            side = %signal.side,
            confidence = signal.confidence,
            strength = %signal.strength,
            "New signal"
        );
    });

    let strong_handle = router.subscribe(FilterCriteria::new(Strength::Strong), |update| {
        match update {
            SignalUpdate::Snapshot(signals) => {
                info!(count = signals.len(), "Strong signal view refreshed");
            }
            SignalUpdate::Signal(signal) => {
                info!(symbol = %signal.symbol, side = %signal.side, "🔥 Strong signal");
            }
        }
    });

    let api = BinancePriceApi::new(
        &config.price_feed.primary_url,
        &config.price_feed.fallback_url,
        config.request_timeout(),
    )?;
    let feed = PriceFeedManager::new(config.price_feed_config(), Arc::new(api), clock);

    let price_handles: Vec<_> = config
        .price_feed
        .symbols
        .iter()
        .map(|symbol| {
            feed.subscribe(symbol, |tick| {
                info!(
                    symbol = %tick.symbol,
                    price = tick.price,
                    change_24h = tick.change_24h,
                    "Price update"
                );
            })
        })
        .collect();

    let mut status_interval = tokio::time::interval(config.price_feed_config().poll_interval);
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed; shutting down");
                }
                break;
            }
            _ = status_interval.tick() => {
                let prices = feed.get_connection_status();
                info!(
                    signals = router.len(),
                    ingest = %live.connection_state(),
                    prices_connected = prices.is_connected,
                    prices = prices.prices_count,
                    price_failures = prices.failure_count,
                    "Status"
                );
            }
        }
    }

    info!("Shutting down...");
    if let Some(stats) = live.stats() {
        info!(?stats, "Final ingest stats");
    }
    router.unsubscribe(strong_handle);
    live.unsubscribe(live_handle);
    for handle in price_handles {
        feed.unsubscribe(handle);
    }
    live.shutdown().await;
    feed.shutdown();

    Ok(())
}
