//! Price feed manager
//!
//! Latest-price cache per symbol, refreshed by interval polling and fanned
//! out to per-symbol subscribers.
//!
//! - One poll loop for all symbols; it starts with the first subscriber and
//!   stops when no symbol has subscribers left.
//! - Each cycle tries the snapshot endpoint, then the batch 24h ticker, then
//!   the 24h ticker one symbol at a time so a single rejected symbol cannot
//!   starve the rest. A cycle where every tier fails bumps `failure_count`
//!   and clears `is_connected`; nothing else changes and the next tick
//!   retries.
//! - Fetches are at least `min_fetch_gap` apart no matter how often the loop
//!   is restarted.
//! - Each subscription sees notifications at least `notify_throttle` apart.
//!   A tick landing inside its window replaces any held one and is delivered
//!   when the window ends. The cached tick handed over on subscribe opens the
//!   window for that subscription only.

use futures_util::future::join_all;
use parking_lot::{Mutex, ReentrantMutex};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::{FetchError, PriceApi, TickerQuote};
use crate::clock::Clock;
use crate::types::{PriceTick, SubscriberHandle};

#[derive(Debug, Clone)]
pub struct PriceFeedConfig {
    pub poll_interval: Duration,
    pub min_fetch_gap: Duration,
    pub notify_throttle: Duration,
}

impl Default for PriceFeedConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            min_fetch_gap: Duration::from_secs(1),
            notify_throttle: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceFeedStatus {
    pub is_connected: bool,
    pub prices_count: usize,
    pub failure_count: u64,
    /// Symbols with at least one subscriber
    pub subscriptions_count: usize,
}

pub type PriceCallback = Arc<dyn Fn(&PriceTick) + Send + Sync>;

/// Throttle window of one subscription
#[derive(Default)]
struct Throttle {
    last_notified: Option<Instant>,
    /// Newest tick held back inside the window
    pending: Option<PriceTick>,
    flush_scheduled: bool,
}

impl Throttle {
    /// Time left in the open window, if any
    fn remaining(&self, now: Instant, window: Duration) -> Option<Duration> {
        self.last_notified
            .map(|last| (last + window).saturating_duration_since(now))
            .filter(|left| !left.is_zero())
    }
}

enum Offer {
    Deliver,
    /// Held; a flush must be scheduled after this delay
    Defer(Duration),
    /// Held; a flush is already scheduled
    Held,
}

enum Flush {
    Deliver(PriceTick),
    Retry(Duration),
    Idle,
}

struct PriceSubscriber {
    callback: PriceCallback,
    active: AtomicBool,
    throttle: Mutex<Throttle>,
}

impl PriceSubscriber {
    fn deliver(&self, tick: &PriceTick) {
        if self.active.load(Ordering::Acquire) {
            (self.callback)(tick);
        }
    }

    fn offer(&self, tick: &PriceTick, now: Instant, window: Duration) -> Offer {
        let mut throttle = self.throttle.lock();
        match throttle.remaining(now, window) {
            Some(left) => {
                throttle.pending = Some(tick.clone());
                if throttle.flush_scheduled {
                    Offer::Held
                } else {
                    throttle.flush_scheduled = true;
                    Offer::Defer(left)
                }
            }
            None => {
                throttle.last_notified = Some(now);
                throttle.pending = None;
                Offer::Deliver
            }
        }
    }

    fn take_due(&self, now: Instant, window: Duration) -> Flush {
        let mut throttle = self.throttle.lock();
        if throttle.pending.is_none() {
            throttle.flush_scheduled = false;
            return Flush::Idle;
        }
        if let Some(left) = throttle.remaining(now, window) {
            return Flush::Retry(left);
        }
        throttle.flush_scheduled = false;
        throttle.last_notified = Some(now);
        match throttle.pending.take() {
            Some(tick) => Flush::Deliver(tick),
            None => Flush::Idle,
        }
    }
}

type SymbolSubscribers = BTreeMap<SubscriberHandle, Arc<PriceSubscriber>>;

#[derive(Default)]
struct FeedState {
    prices: HashMap<String, PriceTick>,
    subscribers: BTreeMap<String, SymbolSubscribers>,
    handle_symbols: HashMap<SubscriberHandle, String>,
    is_connected: bool,
    failure_count: u64,
    last_fetch: Option<Instant>,
    poller: Option<JoinHandle<()>>,
}

impl FeedState {
    fn poller_running(&self) -> bool {
        self.poller.as_ref().map_or(false, |task| !task.is_finished())
    }
}

struct FeedInner {
    config: PriceFeedConfig,
    api: Arc<dyn PriceApi>,
    clock: Arc<dyn Clock>,
    state: Mutex<FeedState>,
    dispatch: ReentrantMutex<()>,
}

/// Shared price cache with polling fan-out. Cheap to clone.
#[derive(Clone)]
pub struct PriceFeedManager {
    inner: Arc<FeedInner>,
}

fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

impl PriceFeedManager {
    pub fn new(config: PriceFeedConfig, api: Arc<dyn PriceApi>, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                config,
                api,
                clock,
                state: Mutex::new(FeedState::default()),
                dispatch: ReentrantMutex::new(()),
            }),
        }
    }

    /// Register `callback` for `symbol`. A cached tick is delivered before
    /// this returns. The first subscriber starts the poll loop, which needs a
    /// tokio runtime.
    pub fn subscribe<F>(&self, symbol: &str, callback: F) -> SubscriberHandle
    where
        F: Fn(&PriceTick) + Send + Sync + 'static,
    {
        let symbol = normalize_symbol(symbol);
        let handle = SubscriberHandle::next();
        let subscriber = Arc::new(PriceSubscriber {
            callback: Arc::new(callback),
            active: AtomicBool::new(true),
            throttle: Mutex::new(Throttle::default()),
        });

        let _dispatch = self.inner.dispatch.lock();
        let (cached, start_poller) = {
            let mut state = self.inner.state.lock();
            state
                .subscribers
                .entry(symbol.clone())
                .or_default()
                .insert(handle, subscriber.clone());
            state.handle_symbols.insert(handle, symbol.clone());

            let cached = state.prices.get(&symbol).cloned();
            if cached.is_some() {
                subscriber.throttle.lock().last_notified = Some(self.inner.clock.now());
            }
            (cached, !state.poller_running())
        };
        debug!(%handle, symbol = %symbol, cached = cached.is_some(), "Price subscriber added");

        if let Some(tick) = cached {
            subscriber.deliver(&tick);
        }
        if start_poller {
            self.start_poller();
        }

        handle
    }

    /// Cancel a subscription. Idempotent; safe inside a callback. The loop
    /// stops once no symbol has subscribers.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let removed = {
            let mut state = self.inner.state.lock();
            let Some(symbol) = state.handle_symbols.remove(&handle) else {
                return false;
            };
            let removed = state
                .subscribers
                .get_mut(&symbol)
                .and_then(|subs| subs.remove(&handle));

            if state.subscribers.get(&symbol).map_or(false, |subs| subs.is_empty()) {
                state.subscribers.remove(&symbol);
                state.prices.remove(&symbol);
                debug!(symbol = %symbol, "No subscribers left for symbol");
            }
            if state.subscribers.is_empty() {
                if let Some(task) = state.poller.take() {
                    task.abort();
                    info!("No price subscriptions left; poll loop stopped");
                }
            }
            removed
        };

        if let Some(subscriber) = removed {
            subscriber.active.store(false, Ordering::Release);
            // wait out any delivery running on another thread
            drop(self.inner.dispatch.lock());
        }
        true
    }

    pub fn get_price(&self, symbol: &str) -> Option<PriceTick> {
        self.inner
            .state
            .lock()
            .prices
            .get(&normalize_symbol(symbol))
            .cloned()
    }

    pub fn get_all_prices(&self) -> HashMap<String, PriceTick> {
        self.inner.state.lock().prices.clone()
    }

    pub fn get_connection_status(&self) -> PriceFeedStatus {
        let state = self.inner.state.lock();
        PriceFeedStatus {
            is_connected: state.is_connected,
            prices_count: state.prices.len(),
            failure_count: state.failure_count,
            subscriptions_count: state.subscribers.len(),
        }
    }

    pub fn is_polling(&self) -> bool {
        self.inner.state.lock().poller_running()
    }

    /// Run one poll cycle now. Returns false when skipped by the minimum
    /// fetch gap or for lack of subscribers.
    pub async fn refresh(&self) -> bool {
        self.inner.poll_once().await
    }

    /// Stop polling and drop every subscriber.
    pub fn shutdown(&self) {
        let subscribers: Vec<Arc<PriceSubscriber>> = {
            let mut state = self.inner.state.lock();
            if let Some(task) = state.poller.take() {
                task.abort();
            }
            state.handle_symbols.clear();
            std::mem::take(&mut state.subscribers)
                .into_values()
                .flat_map(|subs| subs.into_values())
                .collect()
        };
        for subscriber in &subscribers {
            subscriber.active.store(false, Ordering::Release);
        }
        drop(self.inner.dispatch.lock());
        info!(dropped = subscribers.len(), "Price feed shut down");
    }

    fn start_poller(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; price poll loop not started");
            return;
        };

        let mut state = self.inner.state.lock();
        if state.poller_running() || state.subscribers.is_empty() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let every = self.inner.config.poll_interval.max(Duration::from_millis(1));
        info!(interval_ms = every.as_millis() as u64, "Starting price poll loop");
        state.poller = Some(runtime.spawn(poll_loop(weak, every)));
    }
}

async fn poll_loop(inner: Weak<FeedInner>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.state.lock().subscribers.is_empty() {
            debug!("Poll loop found no subscriptions; exiting");
            break;
        }
        inner.poll_once().await;
    }
}

impl FeedInner {
    async fn poll_once(self: &Arc<Self>) -> bool {
        let symbols: Vec<String> = {
            let mut state = self.state.lock();
            let now = self.clock.now();
            if let Some(last) = state.last_fetch {
                if now.saturating_duration_since(last) < self.config.min_fetch_gap {
                    debug!("Skipping price fetch inside minimum gap");
                    return false;
                }
            }
            if state.subscribers.is_empty() {
                return false;
            }
            state.last_fetch = Some(now);
            state.subscribers.keys().cloned().collect()
        };

        match self.fetch(&symbols).await {
            Ok(ticks) => self.apply(ticks),
            Err(e) => {
                let failures = {
                    let mut state = self.state.lock();
                    state.failure_count += 1;
                    state.is_connected = false;
                    state.failure_count
                };
                warn!(
                    error = %e,
                    failures,
                    symbols = symbols.len(),
                    "Price fetch failed on both endpoints; retrying next tick"
                );
            }
        }
        true
    }

    /// Snapshot first, 24h ticker as fallback
    async fn fetch(&self, symbols: &[String]) -> Result<Vec<PriceTick>, FetchError> {
        let fetched_at = self.clock.timestamp_millis();

        match self.api.fetch_snapshot(symbols).await {
            Ok(quotes) => {
                let state = self.state.lock();
                Ok(quotes
                    .into_iter()
                    .map(|quote| {
                        // snapshot rows carry no 24h stats; keep the last known ones
                        let previous = state.prices.get(&quote.symbol);
                        PriceTick {
                            change_24h: previous.map_or(0.0, |p| p.change_24h),
                            volume: previous.map_or(0.0, |p| p.volume),
                            symbol: quote.symbol,
                            price: quote.price,
                            last_updated: fetched_at,
                        }
                    })
                    .collect())
            }
            Err(primary) => {
                warn!(error = %primary, "Price snapshot failed; falling back to 24h ticker");
                let tickers = match self.api.fetch_tickers(symbols).await {
                    Ok(tickers) => tickers,
                    Err(batch) if symbols.len() > 1 => {
                        warn!(error = %batch, "Batch 24h ticker failed; querying symbols one by one");
                        self.fetch_each(symbols).await?
                    }
                    Err(e) => return Err(e),
                };
                Ok(tickers
                    .into_iter()
                    .map(|ticker| PriceTick {
                        symbol: ticker.symbol,
                        price: ticker.last_price,
                        change_24h: ticker.price_change_percent,
                        volume: ticker.volume,
                        last_updated: fetched_at,
                    })
                    .collect())
            }
        }
    }

    /// Per-symbol 24h tickers. Symbols the endpoint rejects are skipped; the
    /// tier fails only when every symbol does.
    async fn fetch_each(&self, symbols: &[String]) -> Result<Vec<TickerQuote>, FetchError> {
        let results = join_all(symbols.iter().map(|symbol| self.api.fetch_ticker(symbol))).await;

        let mut quotes = Vec::with_capacity(symbols.len());
        let mut last_error = None;
        for (symbol, result) in symbols.iter().zip(results) {
            match result {
                Ok(quote) => quotes.push(quote),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "Skipping symbol rejected by the ticker endpoint");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if quotes.is_empty() => Err(e),
            _ => Ok(quotes),
        }
    }

    fn apply(self: &Arc<Self>, ticks: Vec<PriceTick>) {
        let _dispatch = self.dispatch.lock();
        let now = self.clock.now();
        let window = self.config.notify_throttle;
        let mut deliveries = Vec::new();
        let mut deferred = Vec::new();

        {
            let mut state = self.state.lock();
            state.is_connected = true;

            for tick in ticks {
                // unsubscribed while the request was in flight
                let Some(subscribers) = state.subscribers.get(&tick.symbol) else {
                    continue;
                };
                for subscriber in subscribers.values() {
                    match subscriber.offer(&tick, now, window) {
                        Offer::Deliver => deliveries.push((subscriber.clone(), tick.clone())),
                        Offer::Defer(delay) => {
                            deferred.push((tick.symbol.clone(), subscriber.clone(), delay))
                        }
                        Offer::Held => {}
                    }
                }
                state.prices.insert(tick.symbol.clone(), tick);
            }
        }

        for (subscriber, tick) in deliveries {
            subscriber.deliver(&tick);
        }
        for (symbol, subscriber, delay) in deferred {
            debug!(symbol = %symbol, delay_ms = delay.as_millis() as u64, "Price notification throttled");
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let mut delay = delay;
                loop {
                    tokio::time::sleep(delay).await;
                    let Some(inner) = weak.upgrade() else {
                        break;
                    };
                    match inner.flush_pending(&subscriber) {
                        Some(retry) => delay = retry,
                        None => break,
                    }
                }
            });
        }
    }

    /// Hand a held tick to its subscriber once the window has closed.
    /// Returns how long to wait when the window is still open.
    fn flush_pending(&self, subscriber: &PriceSubscriber) -> Option<Duration> {
        let _dispatch = self.dispatch.lock();
        let now = self.clock.now();
        match subscriber.take_due(now, self.config.notify_throttle) {
            Flush::Deliver(tick) => {
                subscriber.deliver(&tick);
                None
            }
            Flush::Retry(left) => Some(left),
            Flush::Idle => None,
        }
    }
}
