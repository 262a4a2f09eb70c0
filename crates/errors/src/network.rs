//! Network-related error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection timeout to {url}")]
    Timeout { url: String },

    #[error("HTTP error {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("download failed: {0}")]
    DownloadFailed(String),

    #[error("source not found: {path}")]
    NotFound { path: String },

    #[error("permission denied opening {path}")]
    PermissionDenied { path: String },
}
