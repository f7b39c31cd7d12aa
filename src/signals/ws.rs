//! WebSocket broadcast transport
//!
//! Joins a topic on a broadcast WebSocket endpoint and pumps its messages into
//! a [`TransportEvent`] channel. One connection per opened channel; the
//! reconnection policy lives in the ingest client, not here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::transport::{BroadcastTransport, ChannelStatus, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(100);

fn should_time_out(last_useful_message: Instant, silence: Duration) -> bool {
    last_useful_message.elapsed() >= silence
}

#[derive(Debug, Clone, Serialize)]
struct JoinRequest<'a> {
    action: &'static str,
    topic: &'a str,
}

/// What a text message from the endpoint turned out to be
#[derive(Debug, PartialEq)]
enum Inbound {
    Frame(serde_json::Value),
    Status(ChannelStatus),
    Ignored,
}

#[derive(Debug, Clone)]
pub struct WsTransportConfig {
    pub url: String,
    pub ping_interval: Duration,
    /// Report TIMED_OUT after this long without a useful message
    pub silence_timeout: Duration,
}

pub struct WsBroadcastTransport {
    config: WsTransportConfig,
}

impl WsBroadcastTransport {
    pub fn new(config: WsTransportConfig) -> Self {
        Self { config }
    }

    fn classify(text: &str) -> Result<Inbound> {
        let value: serde_json::Value = serde_json::from_str(text)?;

        if value.get("signal").is_some() {
            return Ok(Inbound::Frame(value));
        }

        // control messages: {"status": "SUBSCRIBED"} / {"status": "CHANNEL_ERROR", "message": ..}
        let Some(status) = value.get("status").and_then(|v| v.as_str()) else {
            return Ok(Inbound::Ignored);
        };
        let status = match status {
            "SUBSCRIBED" => ChannelStatus::Subscribed,
            "TIMED_OUT" => ChannelStatus::TimedOut,
            "CLOSED" => ChannelStatus::Closed,
            "CHANNEL_ERROR" => ChannelStatus::ChannelError(
                value
                    .get("message")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unspecified")
                    .to_string(),
            ),
            other => {
                debug!(status = other, "Unknown channel status");
                return Ok(Inbound::Ignored);
            }
        };
        Ok(Inbound::Status(status))
    }
}

#[async_trait]
impl BroadcastTransport for WsBroadcastTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn open(&self, topic: &str) -> Result<mpsc::Receiver<TransportEvent>> {
        info!(url = %self.config.url, topic, "Connecting to signal broadcast WebSocket...");

        let (ws_stream, _) = connect_async(self.config.url.as_str())
            .await
            .context("Failed to connect to signal broadcast WebSocket")?;
        let (mut write, mut read) = ws_stream.split();

        let join = serde_json::to_string(&JoinRequest {
            action: "subscribe",
            topic,
        })?;
        write
            .send(Message::Text(join))
            .await
            .context("Failed to send topic join request")?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let ping_every = self.config.ping_interval.max(MIN_TIMER_PERIOD);
        let silence = self.config.silence_timeout.max(MIN_TIMER_PERIOD);
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(ping_every);
            ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut watchdog = tokio::time::interval(silence.min(Duration::from_secs(5)));
            watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_useful_message = Instant::now();

            let final_status = loop {
                tokio::select! {
                    msg = read.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => match Self::classify(&text) {
                                Ok(Inbound::Frame(frame)) => {
                                    last_useful_message = Instant::now();
                                    if tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                        break None;
                                    }
                                }
                                Ok(Inbound::Status(status)) => {
                                    last_useful_message = Instant::now();
                                    if tx.send(TransportEvent::Status(status)).await.is_err() {
                                        break None;
                                    }
                                }
                                Ok(Inbound::Ignored) => {}
                                Err(e) => {
                                    // malformed JSON is a frame-level problem, not a channel one
                                    warn!(topic = %topic, error = %e, "Unparseable broadcast message");
                                }
                            },
                            Some(Ok(Message::Pong(_))) => {
                                last_useful_message = Instant::now();
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!(topic = %topic, "Broadcast WebSocket closed by server");
                                break Some(ChannelStatus::Closed);
                            }
                            Some(Err(e)) => {
                                error!(topic = %topic, error = %e, "Broadcast WebSocket error");
                                break Some(ChannelStatus::ChannelError(e.to_string()));
                            }
                            None => {
                                info!(topic = %topic, "Broadcast WebSocket stream ended");
                                break Some(ChannelStatus::Closed);
                            }
                            _ => {}
                        }
                    }

                    _ = ping_interval.tick() => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!(topic = %topic, error = %e, "Broadcast ping failed");
                            break Some(ChannelStatus::ChannelError(e.to_string()));
                        }
                    }

                    _ = watchdog.tick() => {
                        if should_time_out(last_useful_message, silence) {
                            warn!(
                                topic = %topic,
                                silence_ms = silence.as_millis() as u64,
                                "Broadcast watchdog timeout"
                            );
                            break Some(ChannelStatus::TimedOut);
                        }
                    }

                    _ = tx.closed() => {
                        debug!(topic = %topic, "Broadcast channel released by consumer");
                        break None;
                    }
                }
            };

            let _ = write.send(Message::Close(None)).await;
            if let Some(status) = final_status {
                let _ = tx.send(TransportEvent::Status(status)).await;
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_signal_frame() {
        let inbound = WsBroadcastTransport::classify(
            r#"{"signal":{"symbol":"BTC/USDT"},"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .expect("valid json");
        assert!(matches!(inbound, Inbound::Frame(_)));
    }

    #[test]
    fn classify_status_messages() {
        assert_eq!(
            WsBroadcastTransport::classify(r#"{"status":"SUBSCRIBED"}"#).unwrap(),
            Inbound::Status(ChannelStatus::Subscribed)
        );
        assert_eq!(
            WsBroadcastTransport::classify(r#"{"status":"CHANNEL_ERROR","message":"boom"}"#)
                .unwrap(),
            Inbound::Status(ChannelStatus::ChannelError("boom".to_string()))
        );
        assert_eq!(
            WsBroadcastTransport::classify(r#"{"event":"heartbeat"}"#).unwrap(),
            Inbound::Ignored
        );
        assert!(WsBroadcastTransport::classify("not json").is_err());
    }

    #[test]
    fn watchdog_helper_detects_silence() {
        let now = Instant::now();
        assert!(!should_time_out(now, Duration::from_secs(20)));
        let stale = now
            .checked_sub(Duration::from_secs(21))
            .expect("instant subtraction should succeed");
        assert!(should_time_out(stale, Duration::from_secs(20)));
    }
}
