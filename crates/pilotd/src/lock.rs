//! Execution lock: at most one task body runs at a time.
//!
//! The loop and "run and wait" use [`ExecutionLock::acquire`]; "schedule"
//! uses [`ExecutionLock::try_acquire`] and reports busy instead of queueing.
//! Guards are owned so they can move into a spawned task.

use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Held for the whole of one task execution.
pub type ExecutionGuard = OwnedMutexGuard<()>;

#[derive(Debug, Clone, Default)]
pub struct ExecutionLock {
    inner: Arc<Mutex<()>>,
}

impl ExecutionLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other execution holds the lock.
    pub async fn acquire(&self) -> ExecutionGuard {
        Arc::clone(&self.inner).lock_owned().await
    }

    /// `None` when another execution is in progress.
    pub fn try_acquire(&self) -> Option<ExecutionGuard> {
        Arc::clone(&self.inner).try_lock_owned().ok()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
