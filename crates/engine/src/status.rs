//! Status state machine shared between the update pipeline and the
//! control surface.
//!
//! A single [`StatusMachine`] owns the current [`StatusRecord`] and is the
//! only writer. Every mutation publishes the new record to the attached
//! [`StatusBus`] while the state lock is held, so subscribers observe
//! transitions in exactly the order they happened.

use std::sync::{Arc, Mutex};

use sprout_errors::{Error, UpdateError};
use sprout_events::{StatusBus, StatusRecord, UpdateStatus, PROGRESS_UNKNOWN};
use tracing::debug;

/// Owner of the daemon-wide update status.
pub struct StatusMachine {
    record: Mutex<StatusRecord>,
    bus: Arc<StatusBus>,
}

impl StatusMachine {
    pub fn new(bus: Arc<StatusBus>) -> Self {
        Self {
            record: Mutex::new(StatusRecord::idle()),
            bus,
        }
    }

    /// Current status snapshot. Reading never mutates state, so polling
    /// is always safe.
    pub fn current(&self) -> StatusRecord {
        self.record.lock().unwrap().clone()
    }

    /// Atomically claim the machine for a new update cycle.
    ///
    /// Succeeds only from a resting state (`Idle`, `Completed`, `Failed`)
    /// and transitions straight to `Downloading`. Any in-flight cycle,
    /// including one parked at the confirmation gate, makes this fail with
    /// [`UpdateError::AlreadyInProgress`] without touching the status.
    pub fn begin_cycle(&self, details: &str) -> Result<(), Error> {
        let mut guard = self.record.lock().unwrap();
        match guard.status {
            UpdateStatus::Idle | UpdateStatus::Completed | UpdateStatus::Failed => {
                let record = StatusRecord::new(UpdateStatus::Downloading, details, PROGRESS_UNKNOWN);
                debug!(status = %record.status, details, "update cycle started");
                *guard = record.clone();
                self.bus.publish(&record);
                Ok(())
            }
            _ => Err(UpdateError::AlreadyInProgress.into()),
        }
    }

    /// Replace the full status record and broadcast it.
    pub fn report(&self, status: UpdateStatus, details: impl Into<String>, progress: i32) {
        let record = StatusRecord::new(status, details, progress);
        let mut guard = self.record.lock().unwrap();
        debug!(status = %record.status, progress = record.progress, "status transition");
        *guard = record.clone();
        self.bus.publish(&record);
    }

    /// Update only the progress figure, keeping status and details.
    pub fn report_progress(&self, progress: i32) {
        let mut guard = self.record.lock().unwrap();
        guard.progress = progress.clamp(PROGRESS_UNKNOWN, 100);
        let record = guard.clone();
        self.bus.publish(&record);
    }
}
