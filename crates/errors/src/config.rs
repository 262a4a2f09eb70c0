//! Configuration error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {path}")]
    NotFound { path: String },

    #[error("failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("missing or invalid rootfs directory: {path}")]
    InvalidRootfsDir { path: String },

    #[error("missing or invalid deployments directory: {path}")]
    InvalidDeploymentsDir { path: String },

    #[error("missing public key path in configuration")]
    MissingPublicKey,
}
