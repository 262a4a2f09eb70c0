#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Configuration for the sprout update engine
//!
//! Loaded once at process start from a TOML file
//! (`/etc/sprout/config.toml` by convention); every section has
//! defaults so a partial file is valid.

use serde::{Deserialize, Serialize};
use sprout_errors::{ConfigError, Error};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub updates: UpdatesConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub paths: PathConfig,

    #[serde(default)]
    pub network: NetworkConfig,
}

/// Update behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatesConfig {
    /// Commit verified updates immediately, bypassing the confirmation gate
    #[serde(default)]
    pub auto_install: bool,
    /// Delete orphaned staged subvolumes at startup. Staged updates are not
    /// persisted across a restart and can never be resumed.
    #[serde(default = "default_sweep_staged")]
    pub sweep_staged_on_startup: bool,
}

/// Security configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SecurityConfig {
    /// Minisign public key used to verify update payloads; loaded once,
    /// immutable for the process lifetime.
    pub public_key_path: Option<PathBuf>,
}

/// Filesystem layout configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PathConfig {
    /// Root of the btrfs filesystem holding the deployments
    pub rootfs_dir: Option<PathBuf>,
    /// Directory receiving deployment subvolumes; defaults to
    /// `<rootfs_dir>/deployments`
    pub deployments_dir: Option<PathBuf>,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64, // seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64, // seconds
}

impl Default for UpdatesConfig {
    fn default() -> Self {
        Self {
            auto_install: false,
            sweep_staged_on_startup: true,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout: 300, // large payloads over slow links
            connect_timeout: 30,
        }
    }
}

fn default_sweep_staged() -> bool {
    true
}

fn default_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

impl Config {
    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if the TOML is malformed.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        Ok(config)
    }

    /// Load configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the file does not exist, or a
    /// parse error for malformed content.
    pub fn load(path: &Path) -> Result<Self, Error> {
        if !path.exists() {
            return Err(ConfigError::NotFound {
                path: path.display().to_string(),
            }
            .into());
        }
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// The configured rootfs directory, validated to exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidRootfsDir`] if unset or not a directory.
    pub fn rootfs_dir(&self) -> Result<PathBuf, Error> {
        let path = self
            .paths
            .rootfs_dir
            .clone()
            .ok_or_else(|| ConfigError::InvalidRootfsDir {
                path: "(unset)".to_string(),
            })?;
        if path.is_dir() {
            Ok(path)
        } else {
            Err(ConfigError::InvalidRootfsDir {
                path: path.display().to_string(),
            }
            .into())
        }
    }

    /// The deployments directory, validated to exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidDeploymentsDir`] if the resolved path
    /// is not a directory.
    pub fn deployments_dir(&self) -> Result<PathBuf, Error> {
        let path = match self.paths.deployments_dir.clone() {
            Some(path) => path,
            None => self.rootfs_dir()?.join("deployments"),
        };
        if path.is_dir() {
            Ok(path)
        } else {
            Err(ConfigError::InvalidDeploymentsDir {
                path: path.display().to_string(),
            }
            .into())
        }
    }

    /// The configured public key path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingPublicKey`] if unset.
    pub fn public_key_path(&self) -> Result<&Path, Error> {
        self.security
            .public_key_path
            .as_deref()
            .ok_or_else(|| ConfigError::MissingPublicKey.into())
    }
}
