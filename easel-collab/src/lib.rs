//! # easel-collab: client-side sync core for the Easel canvas
//!
//! Keeps a participant's edits consistent and resilient while the link to
//! the room authority is slow, lossy or gone.
//!
//! ## Architecture
//!
//! ```text
//!  user intent
//!      │
//!      ▼
//! ┌──────────────────┐  request / release   ┌──────────────┐   live    ┌─────────────┐
//! │ LockCoordinator  │ ───────────────────► │    Outbox    │ ────────► │   Channel   │ ◄──► authority
//! │ (lease timers)   │                      │ (gate+queue) │           │ ws|loopback │
//! └────────▲─────────┘                      └──────┬───────┘           └──────┬──────┘
//!          │ grants / denials                      │ QueueStore               │ events
//!          │                                       ▼                          ▼
//!          │                               ┌──────────────┐           ┌──────────────┐
//!          └────────────────────────────── │   Session    │ ◄──────── │NetworkMonitor│
//!                                          │  (dispatch)  │  probes   │ latency/loss │
//!                                          └──────────────┘           └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: Compact short-keyed element records, adaptive compression
//! - [`protocol`]: Binary wire protocol (bincode-encoded client/server messages)
//! - [`transport`]: `Channel` trait, WebSocket and loopback channels
//! - [`monitor`]: Connectivity flags, probe latency and packet loss
//! - [`outbox`]: Durable FIFO of offline intents with ordered replay
//! - [`lock`]: Per-element lock state machine with lease expiry
//! - [`storage`]: Outbox persistence (memory, RocksDB)
//! - [`save`]: HTTP save collaborator
//! - [`session`]: Wires everything over one channel
//!
//! ## Defaults
//!
//! | Setting | Value |
//! |---------|-------|
//! | Lock lease | 30s |
//! | Probe interval / timeout | 5s / 2s |
//! | Latency window | 10 samples |
//! | Replay spacing | 100ms |
//! | Compression threshold | 10 KB |

pub mod codec;
pub mod lock;
pub mod monitor;
pub mod outbox;
pub mod protocol;
pub mod save;
pub mod session;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use codec::{CodecConfig, CodecError, CompactElement, ElementBatch, PayloadCodec};
pub use lock::{Lock, LockConfig, LockCoordinator, LockEvent, LockState};
pub use monitor::{
    AssumeOnline, ConnectionHealth, Connectivity, HealthSnapshot, MonitorConfig, NetworkMonitor,
    ProbeStats,
};
pub use outbox::{
    Delivery, DrainReport, Outbox, OutboxConfig, OutboxError, OutboxStatus, QueuedAction,
};
pub use protocol::{
    ActionType, ChannelEvent, ClientMessage, Participant, ProtocolError, Request, ServerMessage,
};
pub use save::{HttpSaveEndpoint, SaveConfig, SaveEndpoint, SaveError, SaveRequest};
pub use session::{Session, SessionConfig, SessionEvent};
pub use storage::{MemoryQueueStore, QueueStore, RocksQueueStore, StoreConfig, StoreError};
pub use transport::{Channel, ChannelConfig, ChannelError, LoopbackChannel, WsChannel};
