//! Per-element edit locks.
//!
//! The room authority arbitrates; this coordinator keeps the local view.
//!
//! ```text
//!                 grant(me)                      release / lease expiry / force
//!   Unlocked ───────────────► LockedByMe ──────────────────────────► Unlocked
//!      │  ▲                      │ grant(other)
//!      │  │ released(other)      ▼
//!      └──┴───────────────── LockedByOther ◄── grant(other)
//! ```
//!
//! Every grant to the local user (re)arms a lease timer; when it fires the
//! lock is released with `is_auto_release = true`. Foreign locks past their
//! lease deadline read as unlocked and are reaped lazily.
//!
//! Requests and releases leave through the [`Outbox`] gate: live when the
//! channel is open, queued otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::outbox::{Delivery, Outbox, OutboxError};
use crate::protocol::{unix_millis, Participant, Request, ServerMessage};

/// Lock configuration.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease granted with every lock. Default: 30s.
    pub lease_timeout: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    pub fn for_testing() -> Self {
        Self {
            lease_timeout: Duration::from_millis(300),
        }
    }
}

/// Exclusive edit rights on one element.
#[derive(Debug, Clone, PartialEq)]
pub struct Lock {
    pub element_id: String,
    pub holder_id: String,
    pub holder_name: String,
    pub holder_color: String,
    /// Grant time (ms since epoch)
    pub acquired_at: u64,
    pub lease_deadline: Instant,
}

impl Lock {
    fn granted(element_id: &str, holder_id: &str, holder_name: &str, holder_color: &str, lease: Duration) -> Self {
        Self {
            element_id: element_id.to_string(),
            holder_id: holder_id.to_string(),
            holder_name: holder_name.to_string(),
            holder_color: holder_color.to_string(),
            acquired_at: unix_millis(),
            lease_deadline: Instant::now() + lease,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.lease_deadline <= Instant::now()
    }

    /// Lease time left; zero once expired.
    pub fn remaining(&self) -> Duration {
        self.lease_deadline.saturating_duration_since(Instant::now())
    }
}

/// Local view of one element.
#[derive(Debug, Clone, PartialEq)]
pub enum LockState {
    Unlocked,
    /// `confirmed` is false between a reconnect re-validation and the authority's answer.
    LockedByMe { lock: Lock, confirmed: bool },
    LockedByOther { lock: Lock },
}

impl LockState {
    pub fn lock(&self) -> Option<&Lock> {
        match self {
            LockState::Unlocked => None,
            LockState::LockedByMe { lock, .. } | LockState::LockedByOther { lock } => Some(lock),
        }
    }

    pub fn is_mine(&self) -> bool {
        matches!(self, LockState::LockedByMe { .. })
    }
}

/// Outcomes surfaced to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum LockEvent {
    Granted { element_id: String, refreshed: bool },
    HeldByOther { lock: Lock },
    Released { element_id: String, holder_id: String, is_auto_release: bool },
    Denied { element_id: String, reason: String, holder: Option<String> },
    ForceUnlocked { element_id: String, was_mine: bool },
}

#[derive(Default)]
struct LockTable {
    /// Absent entry means `Unlocked`
    locks: HashMap<String, LockState>,
    /// Requests sent or queued, awaiting an answer
    pending: HashSet<String>,
    leases: HashMap<String, JoinHandle<()>>,
    torn_down: bool,
}

impl LockTable {
    fn cancel_lease(&mut self, element_id: &str) {
        if let Some(handle) = self.leases.remove(element_id) {
            handle.abort();
        }
    }
}

struct Inner {
    me: Participant,
    config: LockConfig,
    outbox: Outbox,
    table: Mutex<LockTable>,
    events: mpsc::UnboundedSender<LockEvent>,
}

/// Lock coordinator for one participant in one room. Cheap to clone.
#[derive(Clone)]
pub struct LockCoordinator {
    inner: Arc<Inner>,
}

impl LockCoordinator {
    pub fn new(
        me: Participant,
        config: LockConfig,
        outbox: Outbox,
    ) -> (Self, mpsc::UnboundedReceiver<LockEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            inner: Arc::new(Inner {
                me,
                config,
                outbox,
                table: Mutex::new(LockTable::default()),
                events,
            }),
        };
        (coordinator, rx)
    }

    pub fn participant(&self) -> &Participant {
        &self.inner.me
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.inner.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: LockEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.inner.events.send(event);
    }

    /// Ask the authority for `element_id`. Returns before the answer arrives.
    ///
    /// If the lock is already ours the lease is refreshed locally and the
    /// request is re-sent so the authority extends it too.
    pub async fn request_lock(&self, element_id: &str) -> Result<Delivery, OutboxError> {
        {
            let mut table = self.table();
            let lease = self.inner.config.lease_timeout;
            let refreshed = match table.locks.get_mut(element_id) {
                Some(LockState::LockedByMe { lock, .. }) => {
                    lock.lease_deadline = Instant::now() + lease;
                    Some(lock.lease_deadline)
                }
                _ => None,
            };
            match refreshed {
                Some(deadline) => {
                    self.arm_lease(&mut table, element_id, deadline);
                    log::debug!("Refreshing lease on {element_id}");
                }
                None => {
                    table.pending.insert(element_id.to_string());
                }
            }
        }

        self.inner
            .outbox
            .send_or_enqueue(Request::lock(element_id, &self.inner.me))
            .await
    }

    /// Release a lock held by the local user.
    ///
    /// Returns `Ok(false)` without sending anything if the lock is not ours.
    pub async fn release_lock(&self, element_id: &str, is_auto_release: bool) -> Result<bool, OutboxError> {
        {
            let mut table = self.table();
            if !table.locks.get(element_id).is_some_and(LockState::is_mine) {
                return Ok(false);
            }
            table.locks.remove(element_id);
            table.pending.remove(element_id);
            table.cancel_lease(element_id);
        }

        self.send_release(element_id, is_auto_release).await?;
        Ok(true)
    }

    async fn send_release(&self, element_id: &str, is_auto_release: bool) -> Result<(), OutboxError> {
        let request = Request::release(element_id, &self.inner.me, is_auto_release);
        self.inner.outbox.send_or_enqueue(request).await?;
        self.emit(LockEvent::Released {
            element_id: element_id.to_string(),
            holder_id: self.inner.me.user_id.clone(),
            is_auto_release,
        });
        Ok(())
    }

    /// Current state of `element_id`; expired leases read as `Unlocked`.
    pub fn state(&self, element_id: &str) -> LockState {
        let mut table = self.table();
        let (expired, foreign) = match table.locks.get(element_id) {
            None => return LockState::Unlocked,
            Some(state) => (
                state.lock().is_some_and(Lock::is_expired),
                !state.is_mine(),
            ),
        };
        if !expired {
            return table.locks.get(element_id).cloned().unwrap_or(LockState::Unlocked);
        }
        if foreign {
            table.locks.remove(element_id);
            log::debug!("Reaped expired lock on {element_id}");
        }
        LockState::Unlocked
    }

    pub fn is_locked(&self, element_id: &str) -> bool {
        !matches!(self.state(element_id), LockState::Unlocked)
    }

    pub fn is_locked_by_me(&self, element_id: &str) -> bool {
        self.state(element_id).is_mine()
    }

    pub fn get_lock_info(&self, element_id: &str) -> Option<Lock> {
        self.state(element_id).lock().cloned()
    }

    pub fn is_pending(&self, element_id: &str) -> bool {
        self.table().pending.contains(element_id)
    }

    /// Elements currently held by the local user.
    pub fn held_locks(&self) -> Vec<String> {
        let mut held: Vec<String> = self
            .table()
            .locks
            .iter()
            .filter(|(_, s)| s.is_mine() && !s.lock().is_some_and(Lock::is_expired))
            .map(|(id, _)| id.clone())
            .collect();
        held.sort();
        held
    }

    /// All live locks, for presence displays.
    pub fn locks(&self) -> Vec<Lock> {
        let table = self.table();
        let mut locks: Vec<Lock> = table
            .locks
            .values()
            .filter_map(LockState::lock)
            .filter(|l| !l.is_expired())
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.element_id.cmp(&b.element_id));
        locks
    }

    /// Apply an authority notification. Returns `false` for messages that
    /// are not lock traffic.
    pub fn handle_message(&self, message: &ServerMessage) -> bool {
        match message {
            ServerMessage::LockGranted { element_id, user_id, username, color } => {
                if *user_id == self.inner.me.user_id {
                    self.on_granted_to_me(element_id);
                } else {
                    self.on_granted_to_other(element_id, user_id, username, color);
                }
            }
            ServerMessage::LockReleased { element_id, user_id } => {
                self.on_released(element_id, user_id);
            }
            ServerMessage::LockDenied { element_id, reason, holder } => {
                self.on_denied(element_id, reason, holder.as_deref());
            }
            ServerMessage::ForceUnlock { element_id } => {
                self.on_force_unlock(element_id);
            }
            _ => return false,
        }
        true
    }

    fn on_granted_to_me(&self, element_id: &str) {
        let me = &self.inner.me;
        let lease = self.inner.config.lease_timeout;
        let mut table = self.table();

        let requested = table.pending.remove(element_id);
        let previous = table.locks.remove(element_id);
        let refreshed = matches!(previous, Some(LockState::LockedByMe { .. }));
        if !requested && !refreshed {
            log::warn!("Accepting unsolicited grant for {element_id}");
        }

        let mut lock = Lock::granted(element_id, &me.user_id, &me.username, &me.color, lease);
        if let Some(LockState::LockedByMe { lock: old, .. }) = previous {
            lock.acquired_at = old.acquired_at;
        }
        let deadline = lock.lease_deadline;
        table
            .locks
            .insert(element_id.to_string(), LockState::LockedByMe { lock, confirmed: true });
        self.arm_lease(&mut table, element_id, deadline);
        drop(table);

        log::info!("Lock on {element_id} granted");
        self.emit(LockEvent::Granted {
            element_id: element_id.to_string(),
            refreshed,
        });
    }

    fn on_granted_to_other(&self, element_id: &str, user_id: &str, username: &str, color: &str) {
        let lease = self.inner.config.lease_timeout;
        let mut table = self.table();

        let mut lock = Lock::granted(element_id, user_id, username, color, lease);
        match table.locks.get(element_id) {
            Some(LockState::LockedByMe { .. }) => {
                log::warn!("Lock on {element_id} moved to {username}");
                table.cancel_lease(element_id);
            }
            Some(LockState::LockedByOther { lock: old }) if old.holder_id == user_id => {
                lock.acquired_at = old.acquired_at;
            }
            _ => {}
        }
        table
            .locks
            .insert(element_id.to_string(), LockState::LockedByOther { lock: lock.clone() });
        drop(table);

        self.emit(LockEvent::HeldByOther { lock });
    }

    fn on_released(&self, element_id: &str, user_id: &str) {
        let mut table = self.table();
        let holder_matches = table
            .locks
            .get(element_id)
            .and_then(LockState::lock)
            .is_some_and(|l| l.holder_id == user_id);
        if !holder_matches {
            log::debug!("Ignoring release of {element_id} by non-holder {user_id}");
            return;
        }
        table.locks.remove(element_id);
        table.cancel_lease(element_id);
        drop(table);

        self.emit(LockEvent::Released {
            element_id: element_id.to_string(),
            holder_id: user_id.to_string(),
            is_auto_release: false,
        });
    }

    fn on_denied(&self, element_id: &str, reason: &str, holder: Option<&str>) {
        let mut table = self.table();
        table.pending.remove(element_id);
        // A denied re-validation means the lock lapsed while we were away.
        if matches!(
            table.locks.get(element_id),
            Some(LockState::LockedByMe { confirmed: false, .. })
        ) {
            table.locks.remove(element_id);
            table.cancel_lease(element_id);
        }
        drop(table);

        log::warn!(
            "Lock on {element_id} denied: {reason}{}",
            holder.map(|h| format!(" (held by {h})")).unwrap_or_default()
        );
        self.emit(LockEvent::Denied {
            element_id: element_id.to_string(),
            reason: reason.to_string(),
            holder: holder.map(str::to_string),
        });
    }

    fn on_force_unlock(&self, element_id: &str) {
        let mut table = self.table();
        let was_mine = table
            .locks
            .remove(element_id)
            .is_some_and(|s| s.is_mine());
        table.pending.remove(element_id);
        table.cancel_lease(element_id);
        drop(table);

        if was_mine {
            log::warn!("Lock on {element_id} forcibly released");
        }
        self.emit(LockEvent::ForceUnlocked {
            element_id: element_id.to_string(),
            was_mine,
        });
    }

    /// Re-send requests for every lock still believed held.
    ///
    /// Run after a reconnect: held locks become unconfirmed until the
    /// authority grants or denies them again.
    pub async fn revalidate(&self) -> usize {
        let held: Vec<String> = {
            let mut table = self.table();
            let mut held = Vec::new();
            for (id, state) in table.locks.iter_mut() {
                if let LockState::LockedByMe { confirmed, .. } = state {
                    *confirmed = false;
                    held.push(id.clone());
                }
            }
            for id in &held {
                table.pending.insert(id.clone());
            }
            held
        };

        for element_id in &held {
            if let Err(e) = self
                .inner
                .outbox
                .send_or_enqueue(Request::lock(element_id.as_str(), &self.inner.me))
                .await
            {
                log::warn!("Could not re-validate lock on {element_id}: {e}");
            }
        }
        if !held.is_empty() {
            log::info!("Re-validating {} held locks", held.len());
        }
        held.len()
    }

    /// Cancel every lease timer and release all locks held by the local user.
    pub async fn teardown(&self) -> usize {
        let held: Vec<String> = {
            let mut table = self.table();
            table.torn_down = true;
            for (_, handle) in table.leases.drain() {
                handle.abort();
            }
            table.pending.clear();
            let held = table
                .locks
                .iter()
                .filter(|(_, s)| s.is_mine())
                .map(|(id, _)| id.clone())
                .collect();
            table.locks.clear();
            held
        };

        for element_id in &held {
            if let Err(e) = self.send_release(element_id, false).await {
                log::warn!("Could not release {element_id} on teardown: {e}");
            }
        }
        held.len()
    }

    fn arm_lease(&self, table: &mut LockTable, element_id: &str, deadline: Instant) {
        table.cancel_lease(element_id);
        if table.torn_down {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = element_id.to_string();
        let handle = tokio::spawn(lease_timer(weak, id, deadline));
        table.leases.insert(element_id.to_string(), handle);
    }

    async fn expire_lease(&self, element_id: &str) {
        {
            let mut table = self.table();
            let due = matches!(
                table.locks.get(element_id),
                Some(LockState::LockedByMe { lock, .. }) if lock.is_expired()
            );
            if !due || table.torn_down {
                return;
            }
            table.locks.remove(element_id);
            table.pending.remove(element_id);
            // Our own handle; dropping it does not cancel this task.
            table.leases.remove(element_id);
        }

        log::info!("Lease on {element_id} expired, releasing");
        if let Err(e) = self.send_release(element_id, true).await {
            log::warn!("Auto-release of {element_id} failed: {e}");
        }
    }
}

async fn lease_timer(inner: Weak<Inner>, element_id: String, deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
    if let Some(inner) = inner.upgrade() {
        LockCoordinator { inner }.expire_lease(&element_id).await;
    }
}
