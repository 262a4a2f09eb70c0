#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Error types for the sprout update engine
//!
//! This crate provides fine-grained error types organized by domain.
//! All error types implement Clone where possible for easier handling.

use thiserror::Error;

pub mod config;
pub mod network;
pub mod signing;
pub mod snapshot;
pub mod update;

// Re-export all error types at the root
pub use config::ConfigError;
pub use network::NetworkError;
pub use signing::SigningError;
pub use snapshot::SnapshotError;
pub use update::UpdateError;

/// Generic error type for cross-crate boundaries
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("signing error: {0}")]
    Signing(#[from] SigningError),

    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("update error: {0}")]
    Update(#[from] UpdateError),

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Create an internal error with a message
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Self::internal(format!("I/O error: {error}"))
    }
}
