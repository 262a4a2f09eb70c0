//! Update orchestration error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum UpdateError {
    #[error("an update is already in progress")]
    AlreadyInProgress,

    #[error("no update is awaiting confirmation")]
    NoPendingUpdate,

    #[error("the pending update has already been resolved")]
    AlreadyResolved,

    #[error("update archive is missing required member: {name}")]
    MissingMember { name: String },

    #[error("update archive is corrupted: {message}")]
    CorruptArchive { message: String },

    #[error("decompression failed: {message}")]
    DecompressionFailed { message: String },
}
