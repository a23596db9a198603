//! Hyperliquid WebSocket client.
//!
//! Owns the connection lifecycle: connect, subscribe to every configured
//! (symbol, channel) pair, forward each well-formed message to the ingest
//! buffer, and reconnect after a fixed delay on any error or close. The
//! upstream is a push feed with no keepalive guarantee, so a connection that
//! stays silent past the staleness threshold is force-closed and routed
//! through the same reconnect path.

use crate::buffer::IngestBuffer;
use crate::clock::Clock;
use crate::errors::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Source tag stamped onto every feed record.
pub const FEED_SOURCE: &str = "hl_ws";

/// One inbound exchange message, as persisted in both sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRecord {
    pub ts: i64,
    pub source: String,
    pub message: serde_json::Value,
}

impl FeedRecord {
    pub fn new(ts: i64, message: serde_json::Value) -> Self {
        Self {
            ts,
            source: FEED_SOURCE.to_string(),
            message,
        }
    }
}

/// Subscribe request, one per (symbol, channel) pair.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub method: String,
    pub subscription: Subscription,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub channel: String,
    pub coin: String,
}

impl SubscribeRequest {
    pub fn new(channel: &str, coin: &str) -> Self {
        Self {
            method: "subscribe".to_string(),
            subscription: Subscription {
                channel: channel.to_string(),
                coin: coin.to_string(),
            },
        }
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transition events consumed by the collector to drive heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
}

/// Connection status shared with the heartbeat publisher.
pub struct ConnectionStatus {
    state: RwLock<ConnectionState>,
    last_message_at_ms: AtomicI64,
}

impl ConnectionStatus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_message_at_ms: AtomicI64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn last_message_at_ms(&self) -> i64 {
        self.last_message_at_ms.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn touch(&self, now_ms: i64) {
        self.last_message_at_ms.store(now_ms, Ordering::SeqCst);
    }
}

pub struct StreamClient {
    url: String,
    symbols: Vec<String>,
    sub_types: Vec<String>,
    reconnect_delay: Duration,
    status: Arc<ConnectionStatus>,
    buffer: Arc<IngestBuffer>,
    clock: Arc<dyn Clock>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    shutdown: AtomicBool,
    close_signal: Notify,
}

impl StreamClient {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        url: String,
        symbols: Vec<String>,
        sub_types: Vec<String>,
        reconnect_delay: Duration,
        status: Arc<ConnectionStatus>,
        buffer: Arc<IngestBuffer>,
        clock: Arc<dyn Clock>,
        events_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            url,
            symbols,
            sub_types,
            reconnect_delay,
            status,
            buffer,
            clock,
            events_tx,
            shutdown: AtomicBool::new(false),
            close_signal: Notify::new(),
        })
    }

    pub fn status(&self) -> Arc<ConnectionStatus> {
        Arc::clone(&self.status)
    }

    /// Stop reconnecting and break out of the current read loop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // notify_one stores a permit, so a signal sent between awaits in
        // the read loop is not lost
        self.close_signal.notify_one();
    }

    /// Force-close the current connection without stopping the client.
    ///
    /// The staleness watchdog uses this to treat "connected but silent" as
    /// equivalent to "disconnected": the read loop ends and the normal
    /// reconnect path takes over.
    pub fn force_close(&self) {
        self.close_signal.notify_one();
    }

    /// Run the connect/reconnect loop until shutdown.
    pub async fn run(&self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            self.status.set_state(ConnectionState::Connecting);
            match self.connect_and_stream().await {
                Ok(()) => info!("stream closed"),
                Err(e) => error!("stream error: {}", e),
            }
            self.status.set_state(ConnectionState::Disconnected);
            let _ = self.events_tx.send(ConnectionEvent::Disconnected).await;

            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            debug!("reconnecting in {:?}", self.reconnect_delay);
            tokio::time::sleep(self.reconnect_delay).await;
        }
        info!("stream client stopped");
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!("connecting to {}", self.url);
        let (ws_stream, response) = connect_async(&self.url).await?;
        info!("connected, status: {}", response.status());

        self.status.set_state(ConnectionState::Connected);
        // reset the message clock so a silent-from-birth connection still
        // trips the staleness watchdog one period later
        self.status.touch(self.clock.now_ms());
        let _ = self.events_tx.send(ConnectionEvent::Connected).await;

        let (mut write, mut read) = ws_stream.split();

        for coin in &self.symbols {
            for channel in &self.sub_types {
                let request = SubscribeRequest::new(channel, coin);
                let json = serde_json::to_string(&request)?;
                write.send(Message::Text(json)).await?;
            }
        }

        loop {
            tokio::select! {
                _ = self.close_signal.notified() => {
                    warn!("connection force-closed");
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.status.touch(self.clock.now_ms());
                        self.handle_message(&text);
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // control frames carry no feed data
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("close frame received: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }

        Ok(())
    }

    /// Parse one inbound frame; malformed payloads are dropped silently.
    fn handle_message(&self, text: &str) {
        match serde_json::from_str::<serde_json::Value>(text) {
            Ok(message) => {
                let now_ms = self.clock.now_ms();
                let record = FeedRecord::new(now_ms, message);
                match serde_json::to_string(&record) {
                    Ok(line) => self.buffer.enqueue(line, now_ms),
                    Err(e) => warn!("failed to serialize feed record: {}", e),
                }
            }
            Err(_) => {
                // upstream malformed payload is not a protocol error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_shape() {
        let request = SubscribeRequest::new("l2Book", "BTC");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "method": "subscribe",
                "subscription": { "type": "l2Book", "coin": "BTC" }
            })
        );
    }

    #[test]
    fn test_feed_record_line_shape() {
        let record = FeedRecord::new(
            1_700_000_000_000,
            serde_json::json!({"channel": "trades", "data": []}),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["ts"], 1_700_000_000_000i64);
        assert_eq!(json["source"], "hl_ws");
        assert_eq!(json["message"]["channel"], "trades");
    }

    #[test]
    fn test_connection_status_transitions() {
        let status = ConnectionStatus::new();
        assert!(!status.is_connected());
        status.set_state(ConnectionState::Connected);
        assert!(status.is_connected());
        status.touch(42);
        assert_eq!(status.last_message_at_ms(), 42);
        status.set_state(ConnectionState::Disconnected);
        assert!(!status.is_connected());
    }
}
