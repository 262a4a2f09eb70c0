//! Update status and status record types

use serde::{Deserialize, Serialize};

/// Progress sentinel meaning "percentage not meaningful for this state"
pub const PROGRESS_UNKNOWN: i32 = -1;

/// Current state of the update orchestration engine
///
/// Exactly one value holds at any instant; the record is owned
/// exclusively by the engine's status state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    /// No update in progress
    Idle,
    /// Fetching payload bytes from the source
    Downloading,
    /// Streaming decompressed bytes into the snapshot sink, or finalizing
    Installing,
    /// Verified update staged, waiting for an accept/reject decision
    AwaitingConfirmation,
    /// Deleting a rejected or orphaned staged snapshot
    Clearing,
    /// Update cycle finished successfully
    Completed,
    /// Update cycle failed
    Failed,
}

impl UpdateStatus {
    /// Terminal states end a cycle; they are acknowledged (and replaced
    /// by `Idle`) when the next install request is accepted.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// String representation for transport layers and logs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Downloading => "Downloading",
            Self::Installing => "Installing",
            Self::AwaitingConfirmation => "AwaitingConfirmation",
            Self::Clearing => "Clearing",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of the engine state as seen by observers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: UpdateStatus,
    pub details: String,
    /// Percentage in `[0, 100]`, or [`PROGRESS_UNKNOWN`]
    pub progress: i32,
}

impl StatusRecord {
    #[must_use]
    pub fn new(status: UpdateStatus, details: impl Into<String>, progress: i32) -> Self {
        Self {
            status,
            details: details.into(),
            progress: progress.clamp(PROGRESS_UNKNOWN, 100),
        }
    }

    /// The initial record of a freshly started engine
    #[must_use]
    pub fn idle() -> Self {
        Self::new(UpdateStatus::Idle, "", PROGRESS_UNKNOWN)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

impl Default for StatusRecord {
    fn default() -> Self {
        Self::idle()
    }
}
