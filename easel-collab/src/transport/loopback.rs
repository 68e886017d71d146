//! In-memory channel.
//!
//! Records every sent frame, lets the owner flip connectivity and inject
//! inbound notifications or send failures. Used by the test suites and by
//! embedders that bridge the sync layer onto their own transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use super::{Channel, ChannelError};
use crate::protocol::{ChannelEvent, ClientMessage, Request, ServerMessage};

pub struct LoopbackChannel {
    connected: AtomicBool,
    /// Answer probes immediately with a matching reply
    echo_probes: AtomicBool,
    /// Number of upcoming sends that should fail
    failing_sends: AtomicUsize,
    sent: Mutex<VecDeque<ClientMessage>>,
    events: mpsc::Sender<ChannelEvent>,
}

impl LoopbackChannel {
    /// Create a disconnected channel and the event stream it feeds.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<ChannelEvent>) {
        let (events, rx) = mpsc::channel(capacity);
        let channel = Arc::new(Self {
            connected: AtomicBool::new(false),
            echo_probes: AtomicBool::new(false),
            failing_sends: AtomicUsize::new(0),
            sent: Mutex::new(VecDeque::new()),
            events,
        });
        (channel, rx)
    }

    pub fn connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ChannelEvent::Connected);
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.emit(ChannelEvent::Disconnected);
    }

    /// Inject an inbound notification.
    pub fn deliver(&self, message: ServerMessage) {
        self.emit(ChannelEvent::Message(message));
    }

    pub fn set_echo_probes(&self, echo: bool) {
        self.echo_probes.store(echo, Ordering::SeqCst);
    }

    /// Make the next `count` sends fail with `ChannelError::SendFailed`.
    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    /// Frames sent so far, oldest first.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent_log().iter().cloned().collect()
    }

    /// Drain the sent-frame log.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        self.sent_log().drain(..).collect()
    }

    /// Sent requests excluding liveness probes.
    pub fn sent_requests(&self) -> Vec<ClientMessage> {
        self.sent_log()
            .iter()
            .filter(|m| !matches!(m.request, Request::Probe { .. }))
            .cloned()
            .collect()
    }

    fn sent_log(&self) -> std::sync::MutexGuard<'_, VecDeque<ClientMessage>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ChannelEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Loopback event dropped: {e}");
        }
    }
}

impl Channel for LoopbackChannel {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        let failing = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(ChannelError::SendFailed("injected failure".into()));
        }

        if let Request::Probe { probe_id, sent_at } = message.request {
            if self.echo_probes.load(Ordering::SeqCst) {
                self.deliver(ServerMessage::ProbeReply { probe_id, sent_at });
            }
        }
        self.sent_log().push_back(message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
