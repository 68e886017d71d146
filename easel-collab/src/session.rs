//! One participant's collaboration session in one room.
//!
//! ```text
//!  ChannelEvent ──► dispatch ──┬─ Connected ──► monitor.on_channel_open ──► reconnect:
//!                              │                                             outbox.drain
//!                              │                                             locks.revalidate
//!                              ├─ Disconnected ► monitor.on_channel_close
//!                              ├─ ProbeReply ──► monitor
//!                              ├─ lock traffic ► locks ──► LockEvent ─┐
//!                              └─ Mutation ────────────────────────────┴──► SessionEvent
//! ```
//!
//! `stop` cancels the dispatch loop, probe timers and any reconnect work
//! before the lock coordinator releases what it still holds.

use easel_core::Element;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::codec::CodecConfig;
use crate::lock::{LockConfig, LockCoordinator, LockEvent};
use crate::monitor::{Connectivity, ConnectionHealth, HealthSnapshot, MonitorConfig, NetworkMonitor};
use crate::outbox::{Delivery, DrainReport, Outbox, OutboxConfig, OutboxError};
use crate::protocol::{ChannelEvent, Participant, Request, ServerMessage};
use crate::save::{SaveEndpoint, SaveError, SaveRequest};
use crate::storage::QueueStore;
use crate::transport::Channel;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_id: String,
    pub participant: Participant,
    pub lock: LockConfig,
    pub monitor: MonitorConfig,
    pub outbox: OutboxConfig,
    pub codec: CodecConfig,
}

impl SessionConfig {
    pub fn new(room_id: impl Into<String>, participant: Participant) -> Self {
        Self {
            room_id: room_id.into(),
            participant,
            lock: LockConfig::default(),
            monitor: MonitorConfig::default(),
            outbox: OutboxConfig::default(),
            codec: CodecConfig::default(),
        }
    }

    /// Config for testing (short timers).
    pub fn for_testing(room_id: impl Into<String>, participant: Participant) -> Self {
        Self {
            lock: LockConfig::for_testing(),
            monitor: MonitorConfig::for_testing(),
            outbox: OutboxConfig::for_testing(),
            ..Self::new(room_id, participant)
        }
    }
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Lock(LockEvent),
    /// Mutation broadcast by another participant
    RemoteMutation {
        event: String,
        payload: Vec<u8>,
        user_id: String,
    },
    /// A reconnect drain finished
    Drained(DrainReport),
}

pub struct Session {
    config: SessionConfig,
    monitor: Arc<NetworkMonitor>,
    outbox: Outbox,
    locks: LockCoordinator,
    save_endpoint: Option<Arc<dyn SaveEndpoint>>,
    version: AtomicU64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    lock_events: Option<mpsc::UnboundedReceiver<LockEvent>>,
    dispatch: Option<JoinHandle<()>>,
    reconnect: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        channel: Arc<dyn Channel>,
        store: Arc<dyn QueueStore>,
        connectivity: &dyn Connectivity,
    ) -> Self {
        let monitor = Arc::new(NetworkMonitor::new(
            config.room_id.clone(),
            config.monitor.clone(),
            channel.clone(),
            connectivity,
        ));
        let outbox = Outbox::new(
            config.room_id.clone(),
            config.outbox.clone(),
            channel,
            store,
            monitor.subscribe(),
        );
        let (locks, lock_events) =
            LockCoordinator::new(config.participant.clone(), config.lock.clone(), outbox.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            config,
            monitor,
            outbox,
            locks,
            save_endpoint: None,
            version: AtomicU64::new(0),
            events_tx,
            events_rx: Some(events_rx),
            lock_events: Some(lock_events),
            dispatch: None,
            reconnect: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_save_endpoint(mut self, endpoint: Arc<dyn SaveEndpoint>) -> Self {
        self.save_endpoint = Some(endpoint);
        self
    }

    pub fn room_id(&self) -> &str {
        &self.config.room_id
    }

    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    pub fn monitor(&self) -> &NetworkMonitor {
        &self.monitor
    }

    /// Take the receiver of [`SessionEvent`]s. Only the first call gets it.
    pub fn take_event_rx(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx.take()
    }

    /// Begin consuming channel events.
    pub async fn start(&mut self, events: mpsc::Receiver<ChannelEvent>) {
        if self.dispatch.is_some() {
            log::warn!("Session for room {} already started", self.config.room_id);
            return;
        }
        let Some(lock_events) = self.lock_events.take() else {
            log::warn!("Session for room {} cannot be restarted", self.config.room_id);
            return;
        };

        let restored = self.outbox.restore_persisted().await;
        if restored > 0 {
            log::info!("{restored} actions waiting from a previous run");
        }

        let outbox = self.outbox.clone();
        let locks = self.locks.clone();
        let tx = self.events_tx.clone();
        let slot = self.reconnect.clone();
        self.monitor.set_on_reconnect(move || {
            let outbox = outbox.clone();
            let locks = locks.clone();
            let tx = tx.clone();
            let handle = tokio::spawn(async move {
                let report = outbox.drain().await;
                if report.ran {
                    let _ = tx.send(SessionEvent::Drained(report));
                }
                locks.revalidate().await;
            });
            let previous = slot.lock().unwrap_or_else(|e| e.into_inner()).replace(handle);
            // An earlier drain keeps running; the new one no-ops until it ends.
            if previous.is_some_and(|h| !h.is_finished()) {
                log::debug!("Previous reconnect work still running");
            }
        });

        self.dispatch = Some(tokio::spawn(dispatch(
            events,
            lock_events,
            self.monitor.clone(),
            self.locks.clone(),
            self.events_tx.clone(),
        )));
        log::info!(
            "Session started for {} in room {}",
            self.config.participant.username,
            self.config.room_id
        );
    }

    /// Tear the session down. Returns the number of locks released.
    pub async fn stop(&mut self) -> usize {
        if let Some(handle) = self.dispatch.take() {
            handle.abort();
        }
        self.monitor.stop();
        let reconnect = self.reconnect.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = reconnect {
            handle.abort();
        }

        let released = self.locks.teardown().await;
        log::info!(
            "Session for room {} stopped ({released} locks released)",
            self.config.room_id
        );
        released
    }

    pub async fn request_lock(&self, element_id: &str) -> Result<Delivery, OutboxError> {
        self.locks.request_lock(element_id).await
    }

    pub async fn release_lock(&self, element_id: &str) -> Result<bool, OutboxError> {
        self.locks.release_lock(element_id, false).await
    }

    /// Emit an application mutation, live or through the outbox.
    pub async fn send_mutation(
        &self,
        event: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Delivery, OutboxError> {
        let request = Request::Mutation {
            event: event.into(),
            payload,
        };
        self.outbox.send_or_enqueue(request).await
    }

    /// Persist a batch through the save endpoint.
    pub async fn save(&self, elements: Vec<Element>) -> Result<SaveRequest, SaveError> {
        let endpoint = self.save_endpoint.as_ref().ok_or(SaveError::NotConfigured)?;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let request = SaveRequest::new(self.config.room_id.clone(), elements, version, &self.config.codec);
        endpoint.save(&request).await?;
        Ok(request)
    }

    /// Device presence changed.
    pub fn set_online(&self, online: bool) {
        self.monitor.set_online(online);
    }

    pub async fn health(&self) -> ConnectionHealth {
        ConnectionHealth::new(self.monitor.snapshot(), self.outbox.len().await)
    }

    pub fn subscribe_health(&self) -> watch::Receiver<HealthSnapshot> {
        self.monitor.subscribe()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatch.take() {
            handle.abort();
        }
        self.monitor.stop();
    }
}

async fn dispatch(
    mut events: mpsc::Receiver<ChannelEvent>,
    mut lock_events: mpsc::UnboundedReceiver<LockEvent>,
    monitor: Arc<NetworkMonitor>,
    locks: LockCoordinator,
    tx: mpsc::UnboundedSender<SessionEvent>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ChannelEvent::Connected) => monitor.on_channel_open(),
                Some(ChannelEvent::Disconnected) => monitor.on_channel_close(),
                Some(ChannelEvent::Message(ServerMessage::ProbeReply { probe_id, .. })) => {
                    monitor.handle_probe_reply(probe_id);
                }
                Some(ChannelEvent::Message(ServerMessage::Mutation { event, payload, user_id })) => {
                    let _ = tx.send(SessionEvent::RemoteMutation { event, payload, user_id });
                }
                Some(ChannelEvent::Message(message)) => {
                    locks.handle_message(&message);
                }
                None => {
                    log::info!("Channel event stream ended");
                    monitor.on_channel_close();
                    break;
                }
            },
            Some(event) = lock_events.recv() => {
                let _ = tx.send(SessionEvent::Lock(event));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::AssumeOnline;
    use crate::storage::MemoryQueueStore;
    use crate::transport::LoopbackChannel;

    fn session() -> (Session, Arc<LoopbackChannel>, mpsc::Receiver<ChannelEvent>) {
        let (channel, events) = LoopbackChannel::new(64);
        let me = Participant::new("u1", "Ann", "#112233");
        let session = Session::new(
            SessionConfig::for_testing("room-1", me),
            channel.clone(),
            Arc::new(MemoryQueueStore::new()),
            &AssumeOnline,
        );
        (session, channel, events)
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::new("r", Participant::new("u", "U", "#000000"));
        assert_eq!(config.lock.lease_timeout, std::time::Duration::from_secs(30));
        assert_eq!(config.monitor.latency_window, 10);
        assert_eq!(config.codec.compress_threshold_bytes, 10 * 1024);
    }

    #[tokio::test]
    async fn test_health_before_connect() {
        let (session, _channel, _events) = session();
        let health = session.health().await;
        assert!(health.is_online);
        assert!(!health.is_channel_open);
        assert_eq!(health.queued_count, 0);
    }

    #[tokio::test]
    async fn test_mutation_while_offline_is_queued() {
        let (session, _channel, _events) = session();
        let delivery = session.send_mutation("element-update", vec![1, 2]).await.unwrap();
        assert!(matches!(delivery, Delivery::Queued(_)));
        assert_eq!(session.health().await.queued_count, 1);
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn test_brief_offline_period_resumes_live_sends() {
        let (mut session, channel, events) = session();
        session.start(events).await;
        channel.connect();
        assert!(eventually(|| session.monitor().snapshot().is_channel_open).await);

        session.set_online(false);
        let queued = session.send_mutation("element-update", vec![1]).await.unwrap();
        assert!(matches!(queued, Delivery::Queued(_)));

        session.set_online(true);
        assert!(session.monitor().snapshot().is_channel_open);
        assert!(eventually(|| channel.sent_requests().len() == 1).await);
        assert!(channel.sent_requests()[0].is_replay);
        assert!(eventually(|| !session.outbox().is_draining()).await);
        assert_eq!(session.outbox().len().await, 0);

        let live = session.send_mutation("element-delete", vec![2]).await.unwrap();
        assert_eq!(live, Delivery::Sent);
        let sent = channel.sent_requests();
        assert_eq!(sent.len(), 2);
        assert!(!sent[1].is_replay);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_save_without_endpoint() {
        let (session, _channel, _events) = session();
        assert!(matches!(session.save(Vec::new()).await, Err(SaveError::NotConfigured)));
    }

    #[tokio::test]
    async fn test_event_rx_taken_once() {
        let (mut session, _channel, _events) = session();
        assert!(session.take_event_rx().is_some());
        assert!(session.take_event_rx().is_none());
    }
}
