//! Process-local queue store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{QueueStore, StoreError};
use crate::outbox::QueuedAction;

/// Keeps the queue in memory; survives outbox restarts within one process.
///
/// Can be switched into a failing mode to exercise degraded persistence.
#[derive(Default)]
pub struct MemoryQueueStore {
    actions: Mutex<Vec<QueuedAction>>,
    failing: AtomicBool,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed with a previously persisted queue.
    pub fn with_actions(actions: Vec<QueuedAction>) -> Self {
        Self {
            actions: Mutex::new(actions),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent load/save fail (e.g. quota exceeded).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Current persisted contents, bypassing failure injection.
    pub fn snapshot(&self) -> Vec<QueuedAction> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("quota exceeded".into()));
        }
        Ok(())
    }
}

impl QueueStore for MemoryQueueStore {
    fn load(&self) -> Result<Vec<QueuedAction>, StoreError> {
        self.check()?;
        Ok(self.snapshot())
    }

    fn save(&self, actions: &[QueuedAction]) -> Result<(), StoreError> {
        self.check()?;
        *self.actions.lock().unwrap_or_else(|e| e.into_inner()) = actions.to_vec();
        Ok(())
    }
}
