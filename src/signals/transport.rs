//! Broadcast transport seam
//!
//! The ingest client only sees a stream of [`TransportEvent`]s per opened
//! channel. [`LocalTransport`] is an in-process source used when the core is
//! embedded next to the producer, and by the tests.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

const LOCAL_CHANNEL_CAPACITY: usize = 1024;

/// Status transitions reported by the broadcast source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Events from an open broadcast channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(ChannelStatus),
    /// Raw `{signal, timestamp?}` payload, not yet validated
    Frame(serde_json::Value),
}

/// Source of broadcast channels
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Get the transport name
    fn name(&self) -> &'static str;

    /// Open a channel on `topic`. Dropping the receiver tears the channel down.
    async fn open(&self, topic: &str) -> Result<mpsc::Receiver<TransportEvent>>;
}

/// In-process broadcast source
pub struct LocalTransport {
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<TransportEvent>>>>,
    /// Status announced right after a channel opens
    open_status: Mutex<ChannelStatus>,
    opens: Mutex<Vec<Instant>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            open_status: Mutex::new(ChannelStatus::Subscribed),
            opens: Mutex::new(Vec::new()),
        }
    }

    /// Status every subsequently opened channel reports first
    pub fn set_open_status(&self, status: ChannelStatus) {
        *self.open_status.lock() = status;
    }

    /// Publish a frame to every open channel on `topic`. Returns how many
    /// channels accepted it.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        self.send(topic, TransportEvent::Frame(payload))
    }

    /// Report a status transition on every open channel of `topic`
    pub fn emit_status(&self, topic: &str, status: ChannelStatus) -> usize {
        self.send(topic, TransportEvent::Status(status))
    }

    /// Times at which channels were opened, oldest first
    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opens.lock().len()
    }

    /// Open channels on `topic` whose receiver is still alive
    pub fn live_channels(&self, topic: &str) -> usize {
        let mut channels = self.channels.lock();
        match channels.get_mut(topic) {
            Some(senders) => {
                senders.retain(|tx| !tx.is_closed());
                senders.len()
            }
            None => 0,
        }
    }

    fn send(&self, topic: &str, event: TransportEvent) -> usize {
        let mut channels = self.channels.lock();
        let Some(senders) = channels.get_mut(topic) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.try_send(event.clone()).is_ok())
            .count()
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BroadcastTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn open(&self, topic: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        let (tx, rx) = mpsc::channel(LOCAL_CHANNEL_CAPACITY);
        let status = self.open_status.lock().clone();
        // capacity is fresh, so this cannot fail
        let _ = tx.try_send(TransportEvent::Status(status));

        self.opens.lock().push(Instant::now());
        self.channels
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        debug!(topic, "Local broadcast channel opened");
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn local_transport_delivers_status_then_frames() {
        let transport = LocalTransport::new();
        let mut rx = transport.open("signals").await.unwrap();

        assert_eq!(transport.publish("signals", json!({"signal": {}})), 1);
        assert_eq!(transport.publish("other", json!({})), 0);

        match rx.recv().await {
            Some(TransportEvent::Status(ChannelStatus::Subscribed)) => {}
            other => panic!("expected Subscribed, got {:?}", other),
        }
        assert!(matches!(rx.recv().await, Some(TransportEvent::Frame(_))));
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let transport = LocalTransport::new();
        let rx = transport.open("signals").await.unwrap();
        assert_eq!(transport.live_channels("signals"), 1);
        drop(rx);
        assert_eq!(transport.live_channels("signals"), 0);
        assert_eq!(transport.open_count(), 1);
    }
}
