//! Durable storage for the offline outbox.
//!
//! ```text
//! ┌─────────────┐   save(list)   ┌──────────────────┐
//! │   Outbox    │ ─────────────► │   QueueStore     │
//! │ (in-memory) │ ◄───────────── │ memory | RocksDB │
//! └─────────────┘   load()       └──────────────────┘
//! ```
//!
//! The store holds one ordered record list per namespace and always
//! replaces it wholesale.

pub mod memory;
pub mod rocks;

pub use memory::MemoryQueueStore;
pub use rocks::{RocksQueueStore, StoreConfig};

use crate::outbox::QueuedAction;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Durable mirror of the outbox queue.
pub trait QueueStore: Send + Sync {
    /// Load the persisted queue, oldest action first.
    fn load(&self) -> Result<Vec<QueuedAction>, StoreError>;

    /// Replace the persisted queue with `actions`.
    fn save(&self, actions: &[QueuedAction]) -> Result<(), StoreError>;
}
