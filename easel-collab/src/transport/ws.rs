//! WebSocket channel with automatic reconnection.
//!
//! ```text
//!            send()                      ┌──────────────┐
//! caller ──────────► outgoing mpsc ────► │  supervisor  │ ◄──► ws://host/room
//!                                        │   (task)     │
//! session ◄───────── ChannelEvent mpsc ◄─┴──────────────┘
//! ```
//!
//! The supervisor owns the socket. It connects, reports `Connected`, pumps
//! frames in both directions until the socket drops, reports `Disconnected`
//! and retries with exponential backoff until [`WsChannel::close`].

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{Channel, ChannelError};
use crate::protocol::{ChannelEvent, ClientMessage, ServerMessage};

/// WebSocket channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Room to join; appended to the URL path
    pub room_id: String,
    /// First reconnect delay. Default: 500ms.
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling. Default: 10s.
    pub reconnect_max: Duration,
    /// Frames buffered for the writer. Default: 256.
    pub outgoing_capacity: usize,
    /// Events buffered for the session. Default: 256.
    pub event_capacity: usize,
}

impl ChannelConfig {
    pub fn new(url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room_id: room_id.into(),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(10),
            outgoing_capacity: 256,
            event_capacity: 256,
        }
    }

    /// Config for testing (fast reconnects).
    pub fn for_testing(url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            ..Self::new(url, room_id)
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}/{}", self.url.trim_end_matches('/'), self.room_id)
    }
}

pub struct WsChannel {
    connected: Arc<AtomicBool>,
    outgoing: mpsc::Sender<Vec<u8>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl WsChannel {
    /// Start connecting in the background.
    ///
    /// Returns the channel handle and the event stream for the session.
    pub fn open(config: ChannelConfig) -> (Arc<Self>, mpsc::Receiver<ChannelEvent>) {
        let (out_tx, out_rx) = mpsc::channel(config.outgoing_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let connected = Arc::new(AtomicBool::new(false));

        let handle = tokio::spawn(supervise(config, out_rx, event_tx, connected.clone()));

        let channel = Arc::new(Self {
            connected,
            outgoing: out_tx,
            supervisor: Mutex::new(Some(handle)),
        });
        (channel, event_rx)
    }

    /// Stop reconnecting and drop the socket.
    pub fn close(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl Channel for WsChannel {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        let frame = message.encode()?;
        self.outgoing.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ChannelError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Connection loop: connect, pump, back off, repeat.
async fn supervise(
    config: ChannelConfig,
    mut outgoing: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ChannelEvent>,
    connected: Arc<AtomicBool>,
) {
    let endpoint = config.endpoint();
    let mut backoff = config.reconnect_initial;

    loop {
        match tokio_tungstenite::connect_async(endpoint.as_str()).await {
            Ok((ws_stream, _)) => {
                backoff = config.reconnect_initial;

                let stale = discard_stale(&mut outgoing);
                if stale > 0 {
                    log::warn!("Dropped {stale} frames queued before reconnecting to {endpoint}");
                }

                connected.store(true, Ordering::SeqCst);
                log::info!("Channel connected to {endpoint}");
                if events.send(ChannelEvent::Connected).await.is_err() {
                    return;
                }

                let keep_running = pump(ws_stream, &mut outgoing, &events).await;

                connected.store(false, Ordering::SeqCst);
                log::info!("Channel to {endpoint} lost");
                if events.send(ChannelEvent::Disconnected).await.is_err() || !keep_running {
                    return;
                }
            }
            Err(e) => {
                log::debug!("Connect to {endpoint} failed: {e}");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.reconnect_max);
    }
}

/// Move frames until the socket drops. Returns `false` once the owning
/// channel is gone and the supervisor should exit.
async fn pump<S>(
    ws_stream: tokio_tungstenite::WebSocketStream<S>,
    outgoing: &mut mpsc::Receiver<Vec<u8>>,
    events: &mpsc::Sender<ChannelEvent>,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(bytes) => {
                    if let Err(e) = writer.send(Message::Binary(bytes.into())).await {
                        log::warn!("Channel write failed: {e}");
                        return true;
                    }
                }
                None => {
                    let _ = writer.close().await;
                    return false;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Binary(data))) => match ServerMessage::decode(&data) {
                    Ok(msg) => {
                        if events.send(ChannelEvent::Message(msg)).await.is_err() {
                            return false;
                        }
                    }
                    Err(e) => log::warn!("Skipping undecodable frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => return true,
                Some(Err(e)) => {
                    log::warn!("Channel read failed: {e}");
                    return true;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Frames queued while down belong to the previous session.
fn discard_stale(outgoing: &mut mpsc::Receiver<Vec<u8>>) -> usize {
    let mut dropped = 0;
    while outgoing.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}
