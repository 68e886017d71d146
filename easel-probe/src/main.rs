//! Easel probe: joins a room as a headless participant and reports
//! connection health, queue depth and lock traffic.
//!
//! ```text
//! RUST_LOG=info easel-probe --url ws://127.0.0.1:9090 --room design-review --lock frame-1
//! ```
//!
//! Runs until Ctrl-C, then releases any held locks and closes the channel.

use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use easel_collab::{
    AssumeOnline, ChannelConfig, LockEvent, MemoryQueueStore, Participant, QueueStore,
    RocksQueueStore, Session, SessionConfig, SessionEvent, StoreConfig, WsChannel,
};

#[derive(Parser, Debug)]
#[command(name = "easel-probe", version, about = "Headless Easel room participant")]
struct Args {
    /// Room authority base URL
    #[arg(long, default_value = "ws://127.0.0.1:9090")]
    url: String,

    /// Room to join
    #[arg(long)]
    room: String,

    /// Participant id (random when omitted)
    #[arg(long)]
    user_id: Option<String>,

    /// Display name shown next to held locks
    #[arg(long, default_value = "probe")]
    name: String,

    /// Lock badge color
    #[arg(long, default_value = "#868e96")]
    color: String,

    /// Persist the offline queue in this RocksDB directory
    #[arg(long)]
    store: Option<PathBuf>,

    /// Elements to lock once joined
    #[arg(long = "lock")]
    locks: Vec<String>,

    /// Seconds between health reports
    #[arg(long, default_value_t = 5)]
    report_every: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let user_id = args
        .user_id
        .unwrap_or_else(|| format!("probe-{}", uuid::Uuid::new_v4()));
    let participant = Participant::new(user_id, args.name, args.color);

    let store: Arc<dyn QueueStore> = match &args.store {
        Some(path) => {
            let config = StoreConfig {
                namespace: format!("easel:offline-queue:{}", args.room),
                ..StoreConfig::new(path)
            };
            Arc::new(RocksQueueStore::open(config)?)
        }
        None => Arc::new(MemoryQueueStore::new()),
    };

    info!("Joining room {} at {} as {}", args.room, args.url, participant.user_id);
    let (channel, events) = WsChannel::open(ChannelConfig::new(&args.url, &args.room));
    let mut session = Session::new(
        SessionConfig::new(&args.room, participant),
        channel.clone(),
        store,
        &AssumeOnline,
    );
    let mut session_events = session
        .take_event_rx()
        .ok_or("session event stream already taken")?;
    session.start(events).await;

    for element_id in &args.locks {
        match session.request_lock(element_id).await {
            Ok(delivery) => info!("Lock request for {element_id}: {delivery:?}"),
            Err(e) => warn!("Lock request for {element_id} failed: {e}"),
        }
    }

    let mut report = tokio::time::interval(Duration::from_secs(args.report_every.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                let health = session.health().await;
                info!(
                    "online={} open={} latency={} loss={:.1}% queued={} held={:?}",
                    health.is_online,
                    health.is_channel_open,
                    health.latency_ms.map_or_else(|| "-".to_string(), |ms| format!("{ms}ms")),
                    health.packet_loss_pct,
                    health.queued_count,
                    session.locks().held_locks(),
                );
            }
            Some(event) = session_events.recv() => log_event(&event),
        }
    }

    let released = session.stop().await;
    channel.close();
    info!("Stopped, released {released} lock(s)");
    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Lock(LockEvent::Granted { element_id, refreshed }) => {
            info!("Granted {element_id} (refreshed: {refreshed})");
        }
        SessionEvent::Lock(LockEvent::HeldByOther { lock }) => {
            info!("{} is held by {} ({})", lock.element_id, lock.holder_name, lock.holder_id);
        }
        SessionEvent::Lock(LockEvent::Released { element_id, holder_id, is_auto_release }) => {
            info!("{holder_id} released {element_id} (auto: {is_auto_release})");
        }
        SessionEvent::Lock(LockEvent::Denied { element_id, reason, holder }) => {
            warn!("Denied {element_id}: {reason} (holder: {holder:?})");
        }
        SessionEvent::Lock(LockEvent::ForceUnlocked { element_id, was_mine }) => {
            warn!("{element_id} force-unlocked (was mine: {was_mine})");
        }
        SessionEvent::RemoteMutation { event, payload, user_id } => {
            info!("{user_id} sent {event} ({} bytes)", payload.len());
        }
        SessionEvent::Drained(report) => {
            info!(
                "Replayed {} queued action(s), {} failed, {} remaining",
                report.replayed, report.failed, report.remaining
            );
        }
    }
}
