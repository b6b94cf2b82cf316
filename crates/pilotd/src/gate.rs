//! Approval gate: a single-slot handshake between the executing task and
//! the operator.

use pilot_core::ApprovalDecision;
use std::sync::{Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct ApprovalGate {
    slot: Mutex<Option<oneshot::Sender<ApprovalDecision>>>,
}

/// Waiter returned by [`ApprovalGate::arm`].
#[derive(Debug)]
pub struct PendingApproval {
    rx: oneshot::Receiver<ApprovalDecision>,
}

impl ApprovalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the slot and return a fresh waiter. A previously armed waiter
    /// wakes with no decision.
    pub fn arm(&self) -> PendingApproval {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        PendingApproval { rx }
    }

    /// Deliver a decision. Returns `false` when nothing is armed.
    pub fn decide(&self, decision: ApprovalDecision) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Drop any armed waiter without a decision.
    pub fn release(&self) {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl PendingApproval {
    /// Suspend until a decision arrives. `None` means the gate was released
    /// or re-armed, or `cancel` fired.
    pub async fn wait(self, cancel: &CancellationToken) -> Option<ApprovalDecision> {
        tokio::select! {
            decision = self.rx => decision.ok(),
            () = cancel.cancelled() => None,
        }
    }
}
