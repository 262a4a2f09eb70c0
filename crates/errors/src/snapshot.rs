//! Snapshot sink error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    #[error("snapshot receive failed: {message}")]
    ReceiveFailed { message: String },

    #[error("snapshot receive produced no subvolume name")]
    NoSubvolumeName,

    #[error("failed to finalize snapshot {name}: {message}")]
    FinalizeFailed { name: String, message: String },

    #[error("failed to delete snapshot {name}: {message}")]
    DeleteFailed { name: String, message: String },

    #[error("btrfs command failed: {message}")]
    CommandFailed { message: String },

    #[error("not a btrfs subvolume: {path}")]
    NotASubvolume { path: String },
}
