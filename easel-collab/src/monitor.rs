//! Connectivity and channel health.
//!
//! Two independent flags are tracked: device-level `is_online` and logical
//! `is_channel_open`. While the channel is open a probe task sends a
//! liveness probe every `probe_interval`; a reply inside `probe_timeout`
//! yields a round-trip sample, silence counts as a lost probe.
//!
//! Snapshots are published on a `watch` channel so the outbox gate and
//! presentation layers always see the latest state without polling.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use uuid::Uuid;

use crate::protocol::{unix_millis, ClientMessage, Request};
use crate::transport::Channel;

/// Device-level network presence provider.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Provider for hosts without a presence signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeOnline;

impl Connectivity for AssumeOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Probe cadence while the channel is open. Default: 5s.
    pub probe_interval: Duration,
    /// A probe unanswered for this long is lost. Default: 2s.
    pub probe_timeout: Duration,
    /// Latency samples averaged. Default: 10.
    pub latency_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            latency_window: 10,
        }
    }
}

impl MonitorConfig {
    pub fn for_testing() -> Self {
        Self {
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(40),
            latency_window: 10,
        }
    }
}

/// Point-in-time health as published by the monitor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthSnapshot {
    pub is_online: bool,
    pub is_channel_open: bool,
    /// Rounded window average; `None` until a probe is answered
    pub latency_ms: Option<u64>,
    /// Lost probes since the last channel open, 0..=100
    pub packet_loss_pct: f64,
}

impl HealthSnapshot {
    /// Neutral metrics with a closed channel.
    pub fn closed(is_online: bool) -> Self {
        Self {
            is_online,
            is_channel_open: false,
            latency_ms: None,
            packet_loss_pct: 0.0,
        }
    }

    /// Neutral metrics with an open channel.
    pub fn open() -> Self {
        Self {
            is_online: true,
            is_channel_open: true,
            latency_ms: None,
            packet_loss_pct: 0.0,
        }
    }
}

/// Health plus outbox length, as shown to the user.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHealth {
    pub is_online: bool,
    pub is_channel_open: bool,
    pub latency_ms: Option<u64>,
    pub packet_loss_pct: f64,
    pub queued_count: usize,
}

impl ConnectionHealth {
    pub fn new(snapshot: HealthSnapshot, queued_count: usize) -> Self {
        Self {
            is_online: snapshot.is_online,
            is_channel_open: snapshot.is_channel_open,
            latency_ms: snapshot.latency_ms,
            packet_loss_pct: snapshot.packet_loss_pct,
            queued_count,
        }
    }
}

/// Probe bookkeeping since the last channel open.
#[derive(Debug, Clone)]
pub struct ProbeStats {
    samples: VecDeque<f64>,
    window: usize,
    total: u64,
    failed: u64,
}

impl ProbeStats {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            total: 0,
            failed: 0,
        }
    }

    pub fn record_sent(&mut self) {
        self.total += 1;
    }

    pub fn record_reply(&mut self, rtt: Duration) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(rtt.as_secs_f64() * 1000.0);
    }

    pub fn record_lost(&mut self) {
        self.failed += 1;
    }

    pub fn latency_ms(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: f64 = self.samples.iter().sum();
        Some((sum / self.samples.len() as f64).round() as u64)
    }

    pub fn packet_loss_pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.failed as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.total = 0;
        self.failed = 0;
    }
}

struct MonitorState {
    online: bool,
    channel_open: bool,
    stopped: bool,
    stats: ProbeStats,
    /// Outstanding probes and when they were sent
    pending: HashMap<Uuid, Instant>,
}

struct Shared {
    room_id: String,
    config: MonitorConfig,
    channel: Arc<dyn Channel>,
    state: Mutex<MonitorState>,
    health: watch::Sender<HealthSnapshot>,
}

type ReconnectCallback = Arc<dyn Fn() + Send + Sync>;

pub struct NetworkMonitor {
    shared: Arc<Shared>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
    on_reconnect: Mutex<Option<ReconnectCallback>>,
}

impl NetworkMonitor {
    pub fn new(
        room_id: impl Into<String>,
        config: MonitorConfig,
        channel: Arc<dyn Channel>,
        connectivity: &dyn Connectivity,
    ) -> Self {
        let online = connectivity.is_online();
        let (health, _) = watch::channel(HealthSnapshot::closed(online));
        let stats = ProbeStats::new(config.latency_window);

        Self {
            shared: Arc::new(Shared {
                room_id: room_id.into(),
                config,
                channel,
                state: Mutex::new(MonitorState {
                    online,
                    channel_open: false,
                    stopped: false,
                    stats,
                    pending: HashMap::new(),
                }),
                health,
            }),
            probe_task: Mutex::new(None),
            on_reconnect: Mutex::new(None),
        }
    }

    /// Install the callback run once per channel-open event.
    pub fn set_on_reconnect(&self, callback: impl Fn() + Send + Sync + 'static) {
        *lock(&self.on_reconnect) = Some(Arc::new(callback));
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.shared.health.subscribe()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.shared.snapshot(&lock(&self.shared.state))
    }

    /// Device-level presence changed. Going offline closes the channel view;
    /// coming back while the transport is still connected reopens it.
    pub fn set_online(&self, online: bool) {
        let (was_open, stopped) = {
            let mut st = lock(&self.shared.state);
            st.online = online;
            (st.channel_open, st.stopped)
        };
        log::info!("Device is {}", if online { "online" } else { "offline" });

        if !online && was_open {
            self.on_channel_close();
        } else if online && !was_open && !stopped && self.shared.channel.is_connected() {
            self.on_channel_open();
        } else {
            self.shared.publish();
        }
    }

    /// Channel connected: reset metrics, start probing, run the reconnect callback.
    pub fn on_channel_open(&self) {
        {
            let mut st = lock(&self.shared.state);
            if st.stopped {
                return;
            }
            // A live connection proves device connectivity.
            st.online = true;
            st.channel_open = true;
            st.stats.reset();
            st.pending.clear();
        }
        self.shared.publish();
        self.restart_probing();
        log::info!("Channel open for room {}", self.shared.room_id);

        let callback = lock(&self.on_reconnect).clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Channel lost: stop probing and return metrics to neutral.
    pub fn on_channel_close(&self) {
        self.stop_probing();
        {
            let mut st = lock(&self.shared.state);
            st.channel_open = false;
            st.stats.reset();
            st.pending.clear();
        }
        self.shared.publish();
        log::info!("Channel closed for room {}", self.shared.room_id);
    }

    /// Match a probe reply against the outstanding probes.
    pub fn handle_probe_reply(&self, probe_id: Uuid) {
        let mut st = lock(&self.shared.state);
        let Some(sent) = st.pending.remove(&probe_id) else {
            log::debug!("Ignoring late or unknown probe reply {probe_id}");
            return;
        };
        st.stats.record_reply(sent.elapsed());
        drop(st);
        self.shared.publish();
    }

    /// Cancel the probe task and ignore any later lifecycle events.
    pub fn stop(&self) {
        lock(&self.shared.state).stopped = true;
        self.stop_probing();
        *lock(&self.on_reconnect) = None;
    }

    fn restart_probing(&self) {
        let handle = tokio::spawn(probe_loop(self.shared.clone()));
        if let Some(old) = lock(&self.probe_task).replace(handle) {
            old.abort();
        }
    }

    fn stop_probing(&self) {
        if let Some(handle) = lock(&self.probe_task).take() {
            handle.abort();
        }
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        self.stop_probing();
    }
}

impl Shared {
    fn snapshot(&self, st: &MonitorState) -> HealthSnapshot {
        if !st.channel_open {
            return HealthSnapshot::closed(st.online);
        }
        HealthSnapshot {
            is_online: st.online,
            is_channel_open: true,
            latency_ms: st.stats.latency_ms(),
            packet_loss_pct: st.stats.packet_loss_pct(),
        }
    }

    fn publish(&self) {
        let snapshot = self.snapshot(&lock(&self.state));
        self.health.send_replace(snapshot);
    }

    fn send_probe(&self) {
        let probe_id = Uuid::new_v4();
        {
            let mut st = lock(&self.state);
            st.stats.record_sent();
            st.pending.insert(probe_id, Instant::now());
        }

        let probe = Request::Probe { probe_id, sent_at: unix_millis() };
        if let Err(e) = self.channel.send(ClientMessage::live(self.room_id.clone(), probe)) {
            log::debug!("Probe {probe_id} not sent: {e}");
            let mut st = lock(&self.state);
            st.pending.remove(&probe_id);
            st.stats.record_lost();
            drop(st);
            self.publish();
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        let st = lock(&self.state);
        st.pending
            .values()
            .min()
            .map(|sent| *sent + self.config.probe_timeout)
    }

    fn expire_probes(&self) {
        let now = Instant::now();
        let timeout = self.config.probe_timeout;
        let mut st = lock(&self.state);

        let expired: Vec<Uuid> = st
            .pending
            .iter()
            .filter(|(_, sent)| **sent + timeout <= now)
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return;
        }
        for id in &expired {
            st.pending.remove(id);
            st.stats.record_lost();
            log::debug!("Probe {id} timed out");
        }
        drop(st);
        self.publish();
    }
}

async fn probe_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = shared.next_deadline();
        let wake = deadline.unwrap_or_else(|| Instant::now() + shared.config.probe_interval);

        tokio::select! {
            _ = ticker.tick() => shared.send_probe(),
            _ = tokio::time::sleep_until(wake), if deadline.is_some() => shared.expire_probes(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Offline;

    impl Connectivity for Offline {
        fn is_online(&self) -> bool {
            false
        }
    }

    fn monitor() -> (NetworkMonitor, Arc<LoopbackChannel>) {
        let (channel, _events) = LoopbackChannel::new(64);
        let monitor = NetworkMonitor::new("room", MonitorConfig::for_testing(), channel.clone(), &AssumeOnline);
        (monitor, channel)
    }

    fn probe_ids(channel: &LoopbackChannel) -> Vec<Uuid> {
        channel
            .sent()
            .into_iter()
            .filter_map(|m| match m.request {
                Request::Probe { probe_id, .. } => Some(probe_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_five_probes_two_lost_is_forty_percent() {
        let mut stats = ProbeStats::new(10);
        for _ in 0..5 {
            stats.record_sent();
        }
        for ms in [10, 20, 30] {
            stats.record_reply(Duration::from_millis(ms));
        }
        stats.record_lost();
        stats.record_lost();

        assert_eq!(stats.packet_loss_pct(), 40.0);
        assert_eq!(stats.latency_ms(), Some(20));
    }

    #[test]
    fn test_latency_window_is_bounded() {
        let mut stats = ProbeStats::new(3);
        for ms in [1000, 10, 20, 30] {
            stats.record_sent();
            stats.record_reply(Duration::from_millis(ms));
        }
        assert_eq!(stats.latency_ms(), Some(20));
    }

    #[test]
    fn test_latency_rounds_to_whole_ms() {
        let mut stats = ProbeStats::new(10);
        stats.record_reply(Duration::from_micros(10_400));
        stats.record_reply(Duration::from_micros(10_800));
        assert_eq!(stats.latency_ms(), Some(11));
    }

    #[test]
    fn test_no_probes_is_neutral() {
        let stats = ProbeStats::new(10);
        assert_eq!(stats.packet_loss_pct(), 0.0);
        assert_eq!(stats.latency_ms(), None);
    }

    #[test]
    fn test_initial_state_from_connectivity() {
        let (channel, _events) = LoopbackChannel::new(4);
        let m = NetworkMonitor::new("room", MonitorConfig::default(), channel, &Offline);
        assert_eq!(m.snapshot(), HealthSnapshot::closed(false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_measures_round_trip() {
        let (m, channel) = monitor();
        channel.connect();
        m.on_channel_open();

        tokio::time::sleep(Duration::from_millis(25)).await;
        let ids = probe_ids(&channel);
        assert_eq!(ids.len(), 1);
        m.handle_probe_reply(ids[0]);

        let snap = m.snapshot();
        assert!(snap.is_channel_open);
        assert_eq!(snap.latency_ms, Some(25));
        assert_eq!(snap.packet_loss_pct, 0.0);
        m.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_probe_counts_as_lost() {
        let (m, channel) = monitor();
        channel.connect();
        m.on_channel_open();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(m.snapshot().packet_loss_pct, 100.0);

        // Late reply does not resurrect the probe.
        m.handle_probe_reply(probe_ids(&channel)[0]);
        assert_eq!(m.snapshot().latency_ms, None);
        m.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_resets_on_fresh_open() {
        let (m, channel) = monitor();
        let mut health = m.subscribe();
        channel.connect();
        m.on_channel_open();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(m.snapshot().packet_loss_pct > 0.0);

        channel.disconnect();
        m.on_channel_close();
        assert_eq!(*health.borrow_and_update(), HealthSnapshot::closed(true));

        channel.connect();
        m.on_channel_open();
        let snap = m.snapshot();
        assert!(snap.is_channel_open);
        assert_eq!(snap.packet_loss_pct, 0.0);
        assert_eq!(snap.latency_ms, None);
        m.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_probes_follow_interval() {
        let (m, channel) = monitor();
        channel.connect();
        m.on_channel_open();

        tokio::time::sleep(Duration::from_millis(250)).await;
        // Ticks at 0, 100 and 200ms.
        assert_eq!(probe_ids(&channel).len(), 3);
        m.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_stops_probing() {
        let (m, channel) = monitor();
        channel.connect();
        m.on_channel_open();
        tokio::time::sleep(Duration::from_millis(10)).await;
        m.on_channel_close();

        let sent = probe_ids(&channel).len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(probe_ids(&channel).len(), sent);
    }

    #[tokio::test]
    async fn test_reconnect_callback_once_per_open() {
        let (m, channel) = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        m.set_on_reconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.connect();
        m.on_channel_open();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        m.on_channel_close();
        m.on_channel_open();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        m.stop();
    }

    #[tokio::test]
    async fn test_going_offline_closes_channel() {
        let (m, channel) = monitor();
        channel.connect();
        m.on_channel_open();
        assert!(m.snapshot().is_channel_open);

        m.set_online(false);
        assert_eq!(m.snapshot(), HealthSnapshot::closed(false));
    }

    #[tokio::test]
    async fn test_back_online_reopens_connected_channel() {
        let (m, channel) = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        m.set_on_reconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        channel.connect();
        m.on_channel_open();

        m.set_online(false);
        assert!(!m.snapshot().is_channel_open);

        m.set_online(true);
        let snapshot = m.snapshot();
        assert!(snapshot.is_online);
        assert!(snapshot.is_channel_open);
        assert_eq!(snapshot.packet_loss_pct, 0.0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        m.stop();
    }

    #[tokio::test]
    async fn test_back_online_without_transport_stays_closed() {
        let (m, channel) = monitor();
        channel.connect();
        m.on_channel_open();
        m.set_online(false);
        channel.disconnect();

        m.set_online(true);
        assert_eq!(m.snapshot(), HealthSnapshot::closed(true));
        m.stop();
    }

    #[tokio::test]
    async fn test_open_while_offline_marks_online() {
        let (channel, _events) = LoopbackChannel::new(4);
        let m = NetworkMonitor::new("room", MonitorConfig::for_testing(), channel.clone(), &Offline);
        channel.connect();
        m.on_channel_open();
        assert!(m.snapshot().is_online);
        m.stop();
    }

    #[tokio::test]
    async fn test_stopped_monitor_ignores_open() {
        let (m, channel) = monitor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        m.set_on_reconnect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        m.stop();

        channel.connect();
        m.on_channel_open();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!m.snapshot().is_channel_open);
    }
}
