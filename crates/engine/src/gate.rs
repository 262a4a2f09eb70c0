//! Confirmation gate between a staged update and its commit.
//!
//! When automatic installation is off, the pipeline parks here after the
//! snapshot has been staged and verified. The control surface resolves the
//! gate exactly once per cycle; the decision travels to the parked task
//! over a oneshot channel.

use std::sync::Mutex;

use sprout_errors::{Error, UpdateError};
use tokio::sync::oneshot;

/// Description of a staged update waiting for a decision.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub version: String,
    pub changelog: String,
    pub source: String,
    pub staged_snapshot: String,
}

#[derive(Default)]
struct GateInner {
    pending: Option<PendingUpdate>,
    decision_tx: Option<oneshot::Sender<bool>>,
    resolved: bool,
}

#[derive(Default)]
pub struct ConfirmationGate {
    inner: Mutex<GateInner>,
}

impl ConfirmationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending update, if the current cycle is parked here.
    pub fn pending(&self) -> Option<PendingUpdate> {
        self.inner.lock().unwrap().pending.clone()
    }

    /// Forget the previous cycle's resolution. Called when a new cycle is
    /// claimed, so stale `AlreadyResolved` answers do not leak across
    /// cycles.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending = None;
        inner.decision_tx = None;
        inner.resolved = false;
    }

    /// Park the current cycle on this update. The returned receiver yields
    /// the accept/reject decision.
    pub fn park(&self, pending: PendingUpdate) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.pending = Some(pending);
        inner.decision_tx = Some(tx);
        inner.resolved = false;
        rx
    }

    /// Deliver the decision for the parked cycle.
    ///
    /// The pending update is consumed in the same step, so a caller racing
    /// a second `resolve` gets [`UpdateError::AlreadyResolved`] and the
    /// winning decision stands.
    pub fn resolve(&self, accept: bool) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();
        match inner.decision_tx.take() {
            Some(tx) => {
                inner.pending = None;
                inner.resolved = true;
                tx.send(accept)
                    .map_err(|_| Error::internal("update task abandoned the confirmation gate"))
            }
            None if inner.resolved => Err(UpdateError::AlreadyResolved.into()),
            None => Err(UpdateError::NoPendingUpdate.into()),
        }
    }
}
