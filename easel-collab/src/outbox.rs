//! Offline outbox: durable FIFO of intents issued while the channel is down.
//!
//! ```text
//!  send_or_enqueue(request)
//!        │ channel open, no backlog          │ otherwise
//!        ▼                                   ▼
//!   Channel::send (live)            queue.push_back + QueueStore::save
//!                                            │
//!                      reconnect ──► drain() │ replay oldest first,
//!                                            ▼ is_replay + original timestamp
//!                                     Channel::send ... (spaced)
//! ```
//!
//! While a backlog exists or a drain runs, new intents are queued behind it
//! so live traffic never overtakes older intents. Replay is best effort:
//! a send that fails is logged and skipped, not re-queued.

use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::monitor::HealthSnapshot;
use crate::protocol::{unix_millis, ActionType, ClientMessage, Request};
use crate::storage::QueueStore;
use crate::transport::{Channel, ChannelError};

/// One pending intent, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
    /// Time-ordered (UUIDv7)
    pub id: Uuid,
    pub action_type: ActionType,
    pub data: Request,
    /// When the user issued the intent (ms since epoch)
    pub timestamp: u64,
}

impl QueuedAction {
    pub fn new(request: Request, timestamp: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            action_type: request.action_type(),
            data: request,
            timestamp,
        }
    }
}

/// Outbox configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Pause between replayed actions. Default: 100ms.
    pub replay_spacing: Duration,
    /// Queue length tolerated while persistence is failing. Default: 10,000.
    pub max_in_memory: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            replay_spacing: Duration::from_millis(100),
            max_in_memory: 10_000,
        }
    }
}

impl OutboxConfig {
    pub fn for_testing() -> Self {
        Self {
            replay_spacing: Duration::from_millis(5),
            max_in_memory: 100,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OutboxError {
    /// Persistence is unavailable and the in-memory queue is at capacity.
    #[error("outbox full ({capacity} actions) and durable storage unavailable")]
    QueueFull { capacity: usize },
}

/// How a request left the outbox gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    Queued(Uuid),
}

/// Queue summary for indicators and tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutboxStatus {
    pub len: usize,
    pub oldest: Option<u64>,
    pub newest: Option<u64>,
    pub draining: bool,
    /// Saves are failing; queueing continues in memory only
    pub persistence_degraded: bool,
    pub last_error: Option<String>,
}

/// Outcome of one `drain` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// `false` when the drain was not started (channel closed or already draining)
    pub ran: bool,
    pub replayed: usize,
    pub failed: usize,
    /// Actions left queued (channel dropped mid-drain)
    pub remaining: usize,
}

struct OutboxState {
    queue: VecDeque<QueuedAction>,
    degraded: bool,
    last_error: Option<String>,
    /// Durable queue already merged into memory
    restored: bool,
    /// Bumped by `clear` so a running drain stops replaying discarded actions
    generation: u64,
}

struct Inner {
    room_id: String,
    config: OutboxConfig,
    channel: Arc<dyn Channel>,
    store: Arc<dyn QueueStore>,
    link: watch::Receiver<HealthSnapshot>,
    state: Mutex<OutboxState>,
    draining: AtomicBool,
}

/// Resets the drain flag even if the drain task is aborted.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The outbox. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Outbox {
    inner: Arc<Inner>,
}

impl Outbox {
    pub fn new(
        room_id: impl Into<String>,
        config: OutboxConfig,
        channel: Arc<dyn Channel>,
        store: Arc<dyn QueueStore>,
        link: watch::Receiver<HealthSnapshot>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                room_id: room_id.into(),
                config,
                channel,
                store,
                link,
                state: Mutex::new(OutboxState {
                    queue: VecDeque::new(),
                    degraded: false,
                    last_error: None,
                    restored: false,
                    generation: 0,
                }),
                draining: AtomicBool::new(false),
            }),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    fn link_open(&self) -> bool {
        self.inner.link.borrow().is_channel_open && self.inner.channel.is_connected()
    }

    /// Send `request` live when possible, otherwise queue it.
    pub async fn send_or_enqueue(&self, request: Request) -> Result<Delivery, OutboxError> {
        let mut st = self.inner.state.lock().await;
        self.restore(&mut st);
        let draining = self.inner.draining.load(Ordering::SeqCst);

        if self.link_open() && st.queue.is_empty() && !draining {
            let msg = ClientMessage::live(self.inner.room_id.clone(), request.clone());
            match self.inner.channel.send(msg) {
                Ok(()) => return Ok(Delivery::Sent),
                Err(e) => log::warn!("Live {} failed, queueing: {e}", request.action_type()),
            }
        }

        let id = self.push(&mut st, request)?;
        drop(st);

        if self.link_open() && !draining {
            // Backlog with an open channel and nobody draining it.
            let outbox = self.clone();
            tokio::spawn(async move {
                outbox.drain().await;
            });
        }
        Ok(Delivery::Queued(id))
    }

    /// Append an action to the queue and its durable mirror.
    pub async fn enqueue(&self, request: Request) -> Result<Uuid, OutboxError> {
        let mut st = self.inner.state.lock().await;
        self.push(&mut st, request)
    }

    fn push(&self, st: &mut OutboxState, request: Request) -> Result<Uuid, OutboxError> {
        // The durable list is overwritten below; merge it first.
        self.restore(st);
        let capacity = self.inner.config.max_in_memory;
        if st.degraded && st.queue.len() >= capacity {
            return Err(OutboxError::QueueFull { capacity });
        }

        let action = QueuedAction::new(request, unix_millis());
        let id = action.id;
        log::debug!("Queued {} ({id})", action.action_type);
        st.queue.push_back(action);
        self.persist(st);
        Ok(id)
    }

    fn persist(&self, st: &mut OutboxState) {
        match self.inner.store.save(st.queue.make_contiguous()) {
            Ok(()) => {
                if st.degraded {
                    log::info!("Outbox persistence recovered");
                }
                st.degraded = false;
            }
            Err(e) => {
                log::warn!("Outbox persistence failed, continuing in memory: {e}");
                st.degraded = true;
                st.last_error = Some(e.to_string());
            }
        }
    }

    /// Merge the durable queue into memory once per process lifetime.
    fn restore(&self, st: &mut OutboxState) {
        if st.restored {
            return;
        }
        st.restored = true;
        if !st.queue.is_empty() {
            return;
        }
        match self.inner.store.load() {
            Ok(actions) => {
                if !actions.is_empty() {
                    log::info!("Restored {} queued actions from storage", actions.len());
                }
                st.queue = actions.into();
            }
            Err(e) => {
                log::warn!("Could not load persisted outbox: {e}");
                st.degraded = true;
                st.last_error = Some(e.to_string());
            }
        }
    }

    /// Load the persisted queue (after a restart) so it shows in `status`.
    pub async fn restore_persisted(&self) -> usize {
        let mut st = self.inner.state.lock().await;
        self.restore(&mut st);
        st.queue.len()
    }

    /// Replay queued actions in enqueue order.
    ///
    /// No-op when the channel is closed or another drain is running.
    pub async fn drain(&self) -> DrainReport {
        if !self.link_open() {
            return DrainReport::default();
        }
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return DrainReport::default();
        }
        let _guard = DrainGuard(&self.inner.draining);

        let mut report = DrainReport {
            ran: true,
            ..DrainReport::default()
        };
        let mut first = true;

        loop {
            let (batch, generation) = {
                let mut st = self.inner.state.lock().await;
                self.restore(&mut st);
                if st.queue.is_empty() || !self.link_open() {
                    // Flag drops while the queue is locked, so an intent
                    // queued behind this drain is never stranded.
                    self.inner.draining.store(false, Ordering::SeqCst);
                    report.remaining = st.queue.len();
                    break;
                }
                (st.queue.iter().cloned().collect::<Vec<_>>(), st.generation)
            };

            log::info!("Replaying {} queued actions", batch.len());
            let mut attempted = HashSet::with_capacity(batch.len());
            for action in &batch {
                if !first {
                    tokio::time::sleep(self.inner.config.replay_spacing).await;
                }
                first = false;

                if self.inner.state.lock().await.generation != generation {
                    log::info!("Outbox cleared during drain");
                    break;
                }

                let msg = ClientMessage::replay(
                    self.inner.room_id.clone(),
                    action.data.clone(),
                    action.timestamp,
                );
                match self.inner.channel.send(msg) {
                    Ok(()) => report.replayed += 1,
                    Err(ChannelError::NotConnected | ChannelError::Closed) => {
                        log::info!("Channel closed during drain, keeping remaining actions");
                        break;
                    }
                    Err(e) => {
                        log::warn!("Replay of {} {} failed, skipping: {e}", action.action_type, action.id);
                        report.failed += 1;
                    }
                }
                attempted.insert(action.id);
            }

            let mut st = self.inner.state.lock().await;
            if st.generation == generation {
                st.queue.retain(|a| !attempted.contains(&a.id));
                self.persist(&mut st);
            }
        }

        log::info!(
            "Drain finished: {} replayed, {} failed, {} remaining",
            report.replayed,
            report.failed,
            report.remaining
        );
        report
    }

    /// Discard all queued actions without replaying them.
    pub async fn clear(&self) {
        let mut st = self.inner.state.lock().await;
        let dropped = st.queue.len();
        st.queue.clear();
        st.generation += 1;
        st.restored = true;
        self.persist(&mut st);
        log::info!("Outbox cleared ({dropped} actions discarded)");
    }

    pub async fn status(&self) -> OutboxStatus {
        let st = self.inner.state.lock().await;
        OutboxStatus {
            len: st.queue.len(),
            oldest: st.queue.front().map(|a| a.timestamp),
            newest: st.queue.back().map(|a| a.timestamp),
            draining: self.inner.draining.load(Ordering::SeqCst),
            persistence_degraded: st.degraded,
            last_error: st.last_error.clone(),
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Queued actions, oldest first.
    pub async fn pending(&self) -> Vec<QueuedAction> {
        self.inner.state.lock().await.queue.iter().cloned().collect()
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::SeqCst)
    }
}
