//! Signal ingest client
//!
//! Owns one logical subscription to a broadcast topic. Incoming frames are
//! collected for a fixed batch window, then parsed and handed to the router
//! in arrival order. Channel loss drives a bounded reconnection policy:
//! attempt `n` waits `base_delay * n`, and after `max_attempts` consecutive
//! failures the client parks in FAILED until someone calls `connect()` again.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::parser::{self, RawFrame};
use super::router::SignalRouter;
use super::transport::{BroadcastTransport, ChannelStatus, TransportEvent};
use crate::clock::Clock;

/// Lifecycle of the push connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Constructed, `connect()` not called yet
    Idle,
    Connecting,
    Open,
    Reconnecting,
    /// Retries exhausted; needs an explicit `connect()`
    Failed,
    /// Torn down on purpose; terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Open => write!(f, "OPEN"),
            ConnectionState::Reconnecting => write!(f, "RECONNECTING"),
            ConnectionState::Failed => write!(f, "FAILED"),
            ConnectionState::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub topic: String,
    pub batch_window: Duration,
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            topic: "trading_signals".to_string(),
            batch_window: Duration::from_millis(100),
            base_delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStats {
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub batches_flushed: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("ingest client for topic `{0}` was closed")]
    Closed(String),
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Shared {
    config: IngestConfig,
    transport: Arc<dyn BroadcastTransport>,
    router: Arc<SignalRouter>,
    clock: Arc<dyn Clock>,
    state_tx: watch::Sender<ConnectionState>,
    /// Set once by teardown; status events seen afterwards are ignored
    closed: AtomicBool,
    stats: Mutex<IngestStats>,
}

struct Session {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct SignalIngestClient {
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
}

impl SignalIngestClient {
    pub fn new(
        config: IngestConfig,
        transport: Arc<dyn BroadcastTransport>,
        router: Arc<SignalRouter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                router,
                clock,
                state_tx,
                closed: AtomicBool::new(false),
                stats: Mutex::new(IngestStats::default()),
            }),
            session: Mutex::new(None),
        }
    }

    pub fn topic(&self) -> &str {
        &self.shared.config.topic
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn stats(&self) -> IngestStats {
        *self.shared.stats.lock()
    }

    /// Start the subscription. A no-op while a session is live; after FAILED
    /// it starts over with a fresh retry budget. Must run inside a tokio
    /// runtime.
    pub fn connect(&self) -> Result<(), IngestError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(IngestError::Closed(self.shared.config.topic.clone()));
        }

        let mut session = self.session.lock();
        if let Some(current) = session.as_ref() {
            if !current.task.is_finished() {
                debug!(topic = %self.shared.config.topic, "Ingest session already running");
                return Ok(());
            }
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shared.set_state(ConnectionState::Connecting);
        let session_id = uuid::Uuid::new_v4();
        info!(topic = %self.shared.config.topic, %session_id, "Starting signal ingest session");
        let task = tokio::spawn(run_session(self.shared.clone(), shutdown_rx, session_id));
        *session = Some(Session {
            shutdown: shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Begin teardown without waiting: cancels any pending retry, and the
    /// session flushes its outstanding batch before exiting. Safe to call
    /// from a delivery callback. Idempotent.
    pub fn close(&self) -> Option<JoinHandle<()>> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        info!(topic = %self.shared.config.topic, "Tearing down signal ingest");

        match self.session.lock().take() {
            Some(session) => {
                let _ = session.shutdown.send(());
                Some(session.task)
            }
            None => {
                self.shared.set_state(ConnectionState::Closed);
                None
            }
        }
    }

    /// Tear down and wait until the outstanding batch has been delivered.
    pub async fn unsubscribe(&self) {
        if let Some(task) = self.close() {
            if let Err(e) = task.await {
                warn!(topic = %self.shared.config.topic, error = %e, "Ingest session ended abnormally");
            }
        }
        self.shared.set_state(ConnectionState::Closed);
    }
}

impl Drop for SignalIngestClient {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            self.shared.closed.store(true, Ordering::Release);
            let _ = session.shutdown.send(());
        }
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            info!(topic = %self.config.topic, from = %previous, to = %next, "Ingest state changed");
        }
    }

    fn received_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.clock.timestamp_millis()).unwrap_or_else(Utc::now)
    }

    /// Parse the queued frames and route the survivors in arrival order.
    fn flush(&self, batch: &mut Vec<RawFrame>) {
        if batch.is_empty() {
            return;
        }
        let frames = std::mem::take(batch);
        let mut parsed = Vec::with_capacity(frames.len());
        let mut dropped = 0u64;

        for frame in &frames {
            match parser::parse(frame) {
                Ok(signal) => parsed.push(signal),
                Err(e) => {
                    dropped += 1;
                    warn!(topic = %self.config.topic, error = %e, "Dropping malformed signal frame");
                }
            }
        }

        {
            let mut stats = self.stats.lock();
            stats.frames_dropped += dropped;
            stats.batches_flushed += 1;
        }
        debug!(
            topic = %self.config.topic,
            frames = frames.len(),
            delivered = parsed.len(),
            "Flushing signal batch"
        );
        self.router.on_batch(parsed);
    }

    fn enqueue(&self, batch: &mut Vec<RawFrame>, payload: serde_json::Value) {
        batch.push(RawFrame::new(payload, self.received_at()));
        self.stats.lock().frames_received += 1;
    }

    /// Drive one open channel until it is lost or shutdown is requested.
    async fn pump(
        &self,
        mut events: mpsc::Receiver<TransportEvent>,
        batch: &mut Vec<RawFrame>,
        shutdown: &mut oneshot::Receiver<()>,
        attempt: &mut u32,
    ) -> SessionEnd {
        let mut flush_at: Option<Instant> = None;

        loop {
            let deadline = flush_at;
            tokio::select! {
                _ = &mut *shutdown => {
                    // whatever the transport already delivered belongs to the outstanding batch
                    while let Ok(event) = events.try_recv() {
                        if let TransportEvent::Frame(payload) = event {
                            self.enqueue(batch, payload);
                        }
                    }
                    return SessionEnd::Shutdown;
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush(batch);
                    flush_at = None;
                }

                event = events.recv() => match event {
                    Some(TransportEvent::Frame(payload)) => {
                        self.enqueue(batch, payload);
                        if flush_at.is_none() {
                            flush_at = Some(Instant::now() + self.config.batch_window);
                        }
                    }
                    Some(TransportEvent::Status(status)) => {
                        if self.closed.load(Ordering::Acquire) {
                            debug!(topic = %self.config.topic, ?status, "Ignoring status after teardown");
                            continue;
                        }
                        match status {
                            ChannelStatus::Subscribed => {
                                *attempt = 0;
                                self.set_state(ConnectionState::Open);
                            }
                            ChannelStatus::ChannelError(reason) => {
                                return SessionEnd::Lost(format!("channel error: {reason}"));
                            }
                            ChannelStatus::TimedOut => {
                                return SessionEnd::Lost("timed out".to_string());
                            }
                            ChannelStatus::Closed => {
                                return SessionEnd::Lost("closed unexpectedly".to_string());
                            }
                        }
                    }
                    None => return SessionEnd::Lost("transport ended".to_string()),
                },
            }
        }
    }
}

async fn run_session(
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
    session_id: uuid::Uuid,
) {
    let topic = shared.config.topic.clone();
    let mut attempt: u32 = 0;
    let mut batch: Vec<RawFrame> = Vec::new();

    loop {
        let opened = tokio::select! {
            _ = &mut shutdown => break,
            opened = shared.transport.open(&topic) => opened,
        };

        let reason = match opened {
            Ok(events) => {
                match shared
                    .pump(events, &mut batch, &mut shutdown, &mut attempt)
                    .await
                {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(e) => format!("open failed: {e:#}"),
        };

        // frames that arrived before the loss are still delivered
        shared.flush(&mut batch);

        if shared.closed.load(Ordering::Acquire) {
            break;
        }

        if attempt >= shared.config.max_attempts {
            error!(
                topic = %topic,
                %session_id,
                attempts = attempt,
                reason = %reason,
                "Signal channel retries exhausted; giving up"
            );
            shared.set_state(ConnectionState::Failed);
            return;
        }

        attempt += 1;
        shared.stats.lock().reconnect_attempts += 1;
        let delay = shared.config.base_delay * attempt;
        shared.set_state(ConnectionState::Reconnecting);
        warn!(
            topic = %topic,
            %session_id,
            transport = shared.transport.name(),
            reason = %reason,
            attempt,
            max_attempts = shared.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "🔄 Signal channel lost; reconnecting"
        );

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.flush(&mut batch);
    shared.set_state(ConnectionState::Closed);
    debug!(topic = %topic, %session_id, "Signal ingest session ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::signals::router::{FilterCriteria, SignalUpdate};
    use crate::signals::transport::LocalTransport;
    use crate::types::ParsedSignal;
    use serde_json::json;

    const TOPIC: &str = "trading_signals";

    fn signal_frame(id: &str, confidence: f64) -> serde_json::Value {
        json!({
            "signal": {
                "id": id,
                "symbol": "BTC/USDT",
                "timeframe": "1h",
                "side": "BUY",
                "confidence": confidence
            }
        })
    }

    fn setup(config: IngestConfig) -> (Arc<LocalTransport>, Arc<SignalRouter>, SignalIngestClient) {
        let transport = Arc::new(LocalTransport::new());
        let router = Arc::new(SignalRouter::new(50));
        let client = SignalIngestClient::new(
            config,
            transport.clone(),
            router.clone(),
            Arc::new(SystemClock),
        );
        (transport, router, client)
    }

    fn collect(router: &SignalRouter) -> Arc<Mutex<Vec<ParsedSignal>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        router.subscribe(FilterCriteria::default(), move |update| {
            if let SignalUpdate::Signal(signal) = update {
                sink.lock().push(signal.clone());
            }
        });
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_batched_for_the_window() {
        let (transport, router, client) = setup(IngestConfig::default());
        let seen = collect(&router);

        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(client.state(), ConnectionState::Open);

        for i in 0..3 {
            transport.publish(TOPIC, signal_frame(&format!("s{i}"), 70.0));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().is_empty(), "batch flushed before the window closed");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let ids: Vec<String> = seen.lock().iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2"]);
        assert_eq!(client.stats().batches_flushed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frames_are_dropped_in_isolation() {
        let (transport, router, client) = setup(IngestConfig::default());
        let seen = collect(&router);

        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        transport.publish(TOPIC, json!({"signal": {"symbol": "BTC/USDT"}}));
        transport.publish(TOPIC, signal_frame("good", 80.0));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(seen.lock().len(), 1);
        let stats = client.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retries_with_linear_backoff() {
        let base = Duration::from_millis(1000);
        let (transport, _router, client) = setup(IngestConfig {
            base_delay: base,
            ..IngestConfig::default()
        });
        transport.set_open_status(ChannelStatus::ChannelError("boom".to_string()));

        client.connect().unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(client.state(), ConnectionState::Failed);
        // initial open plus five reconnects
        let opens = transport.open_times();
        assert_eq!(opens.len(), 6);
        let gaps: Vec<Duration> = opens.windows(2).map(|w| w[1] - w[0]).collect();
        for (i, gap) in gaps.iter().enumerate() {
            let expected = base * (i as u32 + 1);
            assert!(*gap >= expected, "gap {i} was {gap:?}");
            assert!(*gap < expected + Duration::from_millis(10), "gap {i} was {gap:?}");
        }
        assert!(gaps.windows(2).all(|w| w[1] > w[0]));
        assert_eq!(client.stats().reconnect_attempts, 5);

        // no further automatic attempts
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.open_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_after_failure_starts_fresh() {
        let (transport, _router, client) = setup(IngestConfig {
            max_attempts: 1,
            ..IngestConfig::default()
        });
        transport.set_open_status(ChannelStatus::TimedOut);
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(client.state(), ConnectionState::Failed);
        assert_eq!(transport.open_count(), 2);

        transport.set_open_status(ChannelStatus::Subscribed);
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(client.state(), ConnectionState::Open);
        assert_eq!(transport.open_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_reconnect_resets_attempts() {
        let (transport, _router, client) = setup(IngestConfig {
            max_attempts: 2,
            ..IngestConfig::default()
        });
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // three separate losses, each followed by a successful resubscribe
        for _ in 0..3 {
            transport.emit_status(TOPIC, ChannelStatus::Closed);
            tokio::time::sleep(Duration::from_secs(2)).await;
            assert_eq!(client.state(), ConnectionState::Open);
        }
        assert_eq!(transport.open_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_connect_opens_one_transport() {
        let (transport, _router, client) = setup(IngestConfig::default());
        client.connect().unwrap();
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.open_count(), 1);
        assert_eq!(transport.live_channels(TOPIC), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_flushes_and_never_reconnects() {
        let (transport, router, client) = setup(IngestConfig::default());
        let seen = collect(&router);
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        transport.publish(TOPIC, signal_frame("pending", 90.0));
        client.unsubscribe().await;

        assert_eq!(seen.lock().len(), 1, "outstanding batch not flushed");
        assert_eq!(client.state(), ConnectionState::Closed);

        // late status from the torn-down channel must not revive anything
        transport.emit_status(TOPIC, ChannelStatus::Closed);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);

        client.unsubscribe().await;
        assert!(matches!(client.connect(), Err(IngestError::Closed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_cancels_pending_retry() {
        let (transport, _router, client) = setup(IngestConfig::default());
        transport.set_open_status(ChannelStatus::ChannelError("down".to_string()));
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), ConnectionState::Reconnecting);

        client.unsubscribe().await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
