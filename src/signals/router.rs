//! Signal router
//!
//! Keeps a bounded, newest-first buffer of parsed signals and fans each new
//! signal out to every subscriber whose filter matches.
//!
//! Delivery runs under a router-wide reentrant dispatch lock:
//! - notification passes are serialized, so every subscriber sees frames in
//!   arrival order;
//! - callbacks may call back into the router (unsubscribe, update_filter,
//!   get_signals) on the same thread without deadlocking;
//! - `unsubscribe` takes the dispatch lock before returning, so once it returns
//!   no pass can still be about to call the cancelled callback.
//!
//! The state mutex is never held while a callback runs.

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::types::{ParsedSignal, Side, Strength, SubscriberHandle};

pub const DEFAULT_MAX_SIGNALS: usize = 100;

/// Per-subscriber view criteria. `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub min_strength: Strength,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    pub side: Option<Side>,
}

impl FilterCriteria {
    pub fn new(min_strength: Strength) -> Self {
        Self {
            min_strength,
            ..Default::default()
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.timeframe = Some(timeframe.into());
        self
    }

    pub fn with_side(mut self, side: Side) -> Self {
        self.side = Some(side);
        self
    }

    pub fn matches(&self, signal: &ParsedSignal) -> bool {
        signal.strength >= self.min_strength
            && self.symbol.as_ref().map_or(true, |s| *s == signal.symbol)
            && self.timeframe.as_ref().map_or(true, |t| *t == signal.timeframe)
            && self.side.map_or(true, |side| side == signal.side)
    }
}

/// What a router subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum SignalUpdate {
    /// Full filtered view, newest first. Sent on subscribe, on filter change
    /// and (empty) on clear.
    Snapshot(Vec<ParsedSignal>),
    /// One new signal matching the subscriber's filter
    Signal(ParsedSignal),
}

pub type SignalCallback = Arc<dyn Fn(&SignalUpdate) + Send + Sync>;

struct Subscriber {
    filter: Mutex<FilterCriteria>,
    callback: SignalCallback,
    active: AtomicBool,
}

impl Subscriber {
    fn deliver(&self, update: &SignalUpdate) {
        if self.active.load(Ordering::Acquire) {
            (self.callback)(update);
        }
    }
}

struct RouterState {
    /// Newest at the front
    buffer: VecDeque<ParsedSignal>,
    subscribers: BTreeMap<SubscriberHandle, Arc<Subscriber>>,
}

impl RouterState {
    fn filtered(&self, filter: &FilterCriteria) -> Vec<ParsedSignal> {
        self.buffer
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }
}

pub struct SignalRouter {
    max_signals: usize,
    state: Mutex<RouterState>,
    dispatch: ReentrantMutex<()>,
}

impl SignalRouter {
    pub fn new(max_signals: usize) -> Self {
        Self {
            max_signals: max_signals.max(1),
            state: Mutex::new(RouterState {
                buffer: VecDeque::with_capacity(max_signals.max(1)),
                subscribers: BTreeMap::new(),
            }),
            dispatch: ReentrantMutex::new(()),
        }
    }

    pub fn max_signals(&self) -> usize {
        self.max_signals
    }

    /// Register a subscriber and replay the current buffer through its filter.
    pub fn subscribe<F>(&self, filter: FilterCriteria, callback: F) -> SubscriberHandle
    where
        F: Fn(&SignalUpdate) + Send + Sync + 'static,
    {
        let handle = SubscriberHandle::next();
        let subscriber = Arc::new(Subscriber {
            filter: Mutex::new(filter),
            callback: Arc::new(callback),
            active: AtomicBool::new(true),
        });

        let _dispatch = self.dispatch.lock();
        let snapshot = {
            let mut state = self.state.lock();
            state.subscribers.insert(handle, subscriber.clone());
            let filter = subscriber.filter.lock().clone();
            state.filtered(&filter)
        };
        debug!(%handle, replay = snapshot.len(), "Router subscriber added");
        subscriber.deliver(&SignalUpdate::Snapshot(snapshot));

        handle
    }

    /// Cancel a subscription. Returns false if it was already cancelled.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let removed = self.state.lock().subscribers.remove(&handle);
        match removed {
            Some(subscriber) => {
                subscriber.active.store(false, Ordering::Release);
                // wait out any pass running on another thread
                drop(self.dispatch.lock());
                debug!(%handle, "Router subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Replace a subscriber's filter and send it the recomputed view.
    ///
    /// Purely a view over the buffer; nothing is fetched.
    pub fn update_filter(&self, handle: SubscriberHandle, filter: FilterCriteria) -> bool {
        let _dispatch = self.dispatch.lock();
        let (subscriber, snapshot) = {
            let state = self.state.lock();
            let Some(subscriber) = state.subscribers.get(&handle).cloned() else {
                return false;
            };
            let snapshot = state.filtered(&filter);
            *subscriber.filter.lock() = filter;
            (subscriber, snapshot)
        };
        subscriber.deliver(&SignalUpdate::Snapshot(snapshot));
        true
    }

    /// Buffer a signal and notify matching subscribers in one pass.
    pub fn on_frame(&self, signal: ParsedSignal) {
        let _dispatch = self.dispatch.lock();
        let targets: Vec<Arc<Subscriber>> = {
            let mut state = self.state.lock();
            state.buffer.push_front(signal.clone());
            state.buffer.truncate(self.max_signals);
            state.subscribers.values().cloned().collect()
        };

        let update = SignalUpdate::Signal(signal.clone());
        for subscriber in targets {
            let matches = subscriber.filter.lock().matches(&signal);
            if matches {
                subscriber.deliver(&update);
            }
        }
    }

    /// Route a batch in order.
    pub fn on_batch(&self, signals: Vec<ParsedSignal>) {
        let _dispatch = self.dispatch.lock();
        for signal in signals {
            self.on_frame(signal);
        }
    }

    /// Current buffer, newest first
    pub fn get_signals(&self) -> Vec<ParsedSignal> {
        self.state.lock().buffer.iter().cloned().collect()
    }

    /// Empty the buffer and send every subscriber an empty snapshot.
    pub fn clear(&self) {
        let _dispatch = self.dispatch.lock();
        let targets: Vec<Arc<Subscriber>> = {
            let mut state = self.state.lock();
            state.buffer.clear();
            state.subscribers.values().cloned().collect()
        };
        info!(subscribers = targets.len(), "Signal buffer cleared");

        let update = SignalUpdate::Snapshot(Vec::new());
        for subscriber in targets {
            subscriber.deliver(&update);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}

impl Default for SignalRouter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIGNALS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::parser::classify_strength;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn make_signal(id: &str, symbol: &str, confidence: f64) -> ParsedSignal {
        ParsedSignal {
            id: id.to_string(),
            symbol: symbol.to_string(),
            timeframe: "1h".to_string(),
            side: Side::Buy,
            confidence,
            component_scores: BTreeMap::new(),
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            strength: classify_strength(confidence),
            timestamp: Utc::now(),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<SignalUpdate>>>, impl Fn(&SignalUpdate) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |u: &SignalUpdate| sink.lock().push(u.clone()))
    }

    fn ids(updates: &[SignalUpdate]) -> Vec<String> {
        updates
            .iter()
            .filter_map(|u| match u {
                SignalUpdate::Signal(s) => Some(s.id.clone()),
                SignalUpdate::Snapshot(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_buffer_keeps_newest_max_signals() {
        let router = SignalRouter::new(3);
        for i in 0..5 {
            router.on_frame(make_signal(&format!("s{i}"), "BTC/USDT", 50.0));
            assert!(router.len() <= 3);
        }
        let buffered: Vec<String> = router.get_signals().into_iter().map(|s| s.id).collect();
        assert_eq!(buffered, vec!["s4", "s3", "s2"]);
    }

    #[test]
    fn test_subscribe_replays_filtered_buffer() {
        let router = SignalRouter::new(10);
        router.on_frame(make_signal("weak", "BTC/USDT", 40.0));
        router.on_frame(make_signal("strong", "BTC/USDT", 90.0));

        let (seen, cb) = recorder();
        router.subscribe(FilterCriteria::new(Strength::Moderate), cb);

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        match &seen[0] {
            SignalUpdate::Snapshot(signals) => {
                assert_eq!(signals.len(), 1);
                assert_eq!(signals[0].id, "strong");
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_strong_btc_filter_scenario() {
        let router = SignalRouter::new(10);
        let (seen, cb) = recorder();
        router.subscribe(
            FilterCriteria::new(Strength::Strong).with_symbol("BTC/USDT"),
            cb,
        );

        router.on_frame(make_signal("btc", "BTC/USDT", 80.0));
        router.on_frame(make_signal("eth", "ETH/USDT", 90.0));

        assert_eq!(ids(&seen.lock()), vec!["btc"]);
    }

    #[test]
    fn test_filter_fields_require_exact_match() {
        let mut signal = make_signal("x", "BTC/USDT", 70.0);
        signal.side = Side::Sell;

        assert!(FilterCriteria::default().matches(&signal));
        assert!(FilterCriteria::new(Strength::Moderate).matches(&signal));
        assert!(!FilterCriteria::new(Strength::Strong).matches(&signal));
        assert!(FilterCriteria::default().with_side(Side::Sell).matches(&signal));
        assert!(!FilterCriteria::default().with_side(Side::Buy).matches(&signal));
        assert!(!FilterCriteria::default().with_timeframe("4h").matches(&signal));
        assert!(!FilterCriteria::default().with_symbol("BTC/USD").matches(&signal));
    }

    #[test]
    fn test_update_filter_is_idempotent() {
        let router = SignalRouter::new(10);
        router.on_frame(make_signal("a", "BTC/USDT", 65.0));
        router.on_frame(make_signal("b", "ETH/USDT", 85.0));

        let (seen, cb) = recorder();
        let handle = router.subscribe(FilterCriteria::default(), cb);
        let filter = FilterCriteria::new(Strength::Strong);

        assert!(router.update_filter(handle, filter.clone()));
        let first = seen.lock().last().cloned();
        assert!(router.update_filter(handle, filter));
        let second = seen.lock().last().cloned();
        assert_eq!(first, second);

        router.on_frame(make_signal("c", "BTC/USDT", 61.0));
        router.on_frame(make_signal("d", "BTC/USDT", 99.0));
        assert_eq!(ids(&seen.lock()), vec!["d"]);
    }

    #[test]
    fn test_unsubscribe_twice_is_harmless() {
        let router = SignalRouter::new(10);
        let (seen, cb) = recorder();
        let handle = router.subscribe(FilterCriteria::default(), cb);

        assert!(router.unsubscribe(handle));
        assert!(!router.unsubscribe(handle));
        assert_eq!(router.subscriber_count(), 0);
        assert!(!router.update_filter(handle, FilterCriteria::default()));

        router.on_frame(make_signal("late", "BTC/USDT", 90.0));
        assert!(ids(&seen.lock()).is_empty());
    }

    #[test]
    fn test_unsubscribe_from_inside_callback() {
        let router = Arc::new(SignalRouter::new(10));
        let calls = Arc::new(Mutex::new(0usize));
        let handle_slot: Arc<Mutex<Option<SubscriberHandle>>> = Arc::new(Mutex::new(None));

        let cb_router = router.clone();
        let cb_calls = calls.clone();
        let cb_slot = handle_slot.clone();
        let handle = router.subscribe(FilterCriteria::default(), move |update| {
            if let SignalUpdate::Signal(_) = update {
                *cb_calls.lock() += 1;
                if let Some(handle) = *cb_slot.lock() {
                    cb_router.unsubscribe(handle);
                }
            }
        });
        *handle_slot.lock() = Some(handle);

        router.on_frame(make_signal("one", "BTC/USDT", 90.0));
        router.on_frame(make_signal("two", "BTC/USDT", 90.0));

        assert_eq!(*calls.lock(), 1);
        assert_eq!(router.subscriber_count(), 0);
    }

    #[test]
    fn test_clear_notifies_empty_snapshot() {
        let router = SignalRouter::new(10);
        router.on_frame(make_signal("a", "BTC/USDT", 90.0));
        let (seen, cb) = recorder();
        router.subscribe(FilterCriteria::default(), cb);

        router.clear();

        assert!(router.is_empty());
        assert_eq!(seen.lock().last(), Some(&SignalUpdate::Snapshot(Vec::new())));
    }

    #[test]
    fn test_delivery_order_matches_arrival() {
        let router = SignalRouter::new(100);
        let (first, cb_a) = recorder();
        let (second, cb_b) = recorder();
        router.subscribe(FilterCriteria::default(), cb_a);
        router.subscribe(FilterCriteria::default(), cb_b);

        let batch: Vec<ParsedSignal> = (0..20)
            .map(|i| make_signal(&format!("s{i}"), "BTC/USDT", 70.0))
            .collect();
        router.on_batch(batch);

        let expected: Vec<String> = (0..20).map(|i| format!("s{i}")).collect();
        assert_eq!(ids(&first.lock()), expected);
        assert_eq!(ids(&second.lock()), expected);
    }

    #[test]
    fn test_unsubscribe_from_other_thread_waits_for_running_delivery() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Barrier;
        use std::time::Duration;

        let router = Arc::new(SignalRouter::new(10));
        let entered = Arc::new(Barrier::new(2));
        let calls = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let cb_entered = entered.clone();
        let cb_calls = calls.clone();
        let cb_finished = finished.clone();
        let handle = router.subscribe(FilterCriteria::default(), move |update| {
            if let SignalUpdate::Signal(_) = update {
                if cb_calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    cb_entered.wait();
                    std::thread::sleep(Duration::from_millis(50));
                }
                cb_finished.store(true, Ordering::SeqCst);
            }
        });

        let worker_router = router.clone();
        let worker = std::thread::spawn(move || {
            worker_router.on_frame(make_signal("s1", "BTC/USDT", 80.0));
        });

        entered.wait();
        assert!(router.unsubscribe(handle));
        assert!(
            finished.load(Ordering::SeqCst),
            "unsubscribe returned while the callback was still running"
        );
        let after = calls.load(Ordering::SeqCst);

        worker.join().expect("delivery thread panicked");
        let late_router = router.clone();
        std::thread::spawn(move || late_router.on_frame(make_signal("s2", "BTC/USDT", 80.0)))
            .join()
            .expect("delivery thread panicked");
        router.on_frame(make_signal("s3", "BTC/USDT", 80.0));

        assert_eq!(after, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(router.len(), 3);
    }
}
