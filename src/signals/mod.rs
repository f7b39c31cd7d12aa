//! Signals module - push-delivered trading signals
//!
//! Wire frame -> [`SignalIngestClient`] (batch) -> [`parser`] (normalize)
//! -> [`SignalRouter`] (filter + buffer) -> subscriber callbacks.

pub mod ingest;
pub mod parser;
pub mod router;
pub mod transport;
pub mod ws;

pub use ingest::{ConnectionState, IngestConfig, IngestError, IngestStats, SignalIngestClient};
pub use parser::{classify_strength, parse, ParseError, RawFrame};
pub use router::{FilterCriteria, SignalRouter, SignalUpdate};
pub use transport::{BroadcastTransport, ChannelStatus, LocalTransport, TransportEvent};
pub use ws::{WsBroadcastTransport, WsTransportConfig};

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::types::{ParsedSignal, SubscriberHandle};

#[derive(Default)]
struct LiveState {
    client: Option<Arc<SignalIngestClient>>,
    handles: HashSet<SubscriberHandle>,
}

/// Live signal stream shared by all consumers
///
/// The first live subscriber opens an ingest session; the last one to leave
/// tears it down. A torn-down client is terminal, so the next subscriber
/// gets a fresh session.
pub struct LiveSignals {
    router: Arc<SignalRouter>,
    transport: Arc<dyn BroadcastTransport>,
    config: IngestConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LiveState>,
}

impl LiveSignals {
    pub fn new(
        router: Arc<SignalRouter>,
        transport: Arc<dyn BroadcastTransport>,
        config: IngestConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            router,
            transport,
            config,
            clock,
            state: Mutex::new(LiveState::default()),
        }
    }

    pub fn router(&self) -> &Arc<SignalRouter> {
        &self.router
    }

    /// Deliver every newly ingested signal to `callback`.
    ///
    /// Only signals arriving after the call are delivered; use
    /// [`SignalRouter::subscribe`] for a filtered view that includes the
    /// buffered history.
    pub fn subscribe_to_live_signals<F>(&self, callback: F) -> SubscriberHandle
    where
        F: Fn(&ParsedSignal) + Send + Sync + 'static,
    {
        let handle = self
            .router
            .subscribe(FilterCriteria::default(), move |update| {
                if let SignalUpdate::Signal(signal) = update {
                    callback(signal);
                }
            });

        let mut state = self.state.lock();
        state.handles.insert(handle);

        let needs_session = state
            .client
            .as_ref()
            .map_or(true, |client| client.state() == ConnectionState::Closed);
        if needs_session {
            let client = Arc::new(SignalIngestClient::new(
                self.config.clone(),
                self.transport.clone(),
                self.router.clone(),
                self.clock.clone(),
            ));
            info!(topic = %self.config.topic, "Opening live signal session");
            state.client = Some(client);
        }
        if let Some(client) = state.client.as_ref() {
            // restarts a FAILED session, no-op otherwise
            if let Err(e) = client.connect() {
                warn!(error = %e, "Live signal session could not connect");
            }
        }

        handle
    }

    /// Cancel a live subscription. Idempotent; safe inside a callback.
    pub fn unsubscribe(&self, handle: SubscriberHandle) -> bool {
        let removed = self.router.unsubscribe(handle);

        let idle_client = {
            let mut state = self.state.lock();
            if !state.handles.remove(&handle) || !state.handles.is_empty() {
                None
            } else {
                state.client.take()
            }
        };
        if let Some(client) = idle_client {
            info!(topic = %self.config.topic, "Last live subscriber left; closing session");
            client.close();
        }

        removed
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .lock()
            .client
            .as_ref()
            .map_or(ConnectionState::Idle, |client| client.state())
    }

    pub fn stats(&self) -> Option<IngestStats> {
        self.state.lock().client.as_ref().map(|client| client.stats())
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Drop every live subscriber and wait for the session to wind down.
    pub async fn shutdown(&self) {
        let (handles, client) = {
            let mut state = self.state.lock();
            (std::mem::take(&mut state.handles), state.client.take())
        };
        for handle in handles {
            self.router.unsubscribe(handle);
        }
        if let Some(client) = client {
            client.unsubscribe().await;
        }
    }
}
