//! Signature verification error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum SigningError {
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("public key file unreadable at {path}: {message}")]
    KeyFileUnreadable { path: String, message: String },

    #[error("signature verification failed: {0}")]
    VerificationFailed(String),

    #[error("signature verification undetermined: {0}")]
    Undetermined(String),
}
