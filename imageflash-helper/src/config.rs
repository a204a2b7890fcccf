// SPDX-License-Identifier: GPL-3.0-only

//! Helper configuration
//!
//! Settings come from an optional TOML file; every field has a default so an
//! installation without a config file works as is.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use imageflash_contracts::DEFAULT_SOCKET_PATH;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "/Library/Application Support/imageflash/helper.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file {path} could not be read: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config file {path} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// Command line of the helper binary
#[derive(Debug, Parser)]
#[command(name = "imageflash-helper", version, about)]
pub struct Cli {
    /// Path of the TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the listening socket path
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HelperConfig {
    /// Unix socket the helper listens on
    pub socket_path: PathBuf,
    /// Prefix of the authorization right names
    pub identifier: String,
    pub diskutil: PathBuf,
    pub hdiutil: PathBuf,
    /// UEFI bootloader written to slice 1 of Windows installer media
    pub boot_image: PathBuf,
    pub arbitration_timeout_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            identifier: "org.imageflash.helper".to_string(),
            diskutil: PathBuf::from("/usr/sbin/diskutil"),
            hdiutil: PathBuf::from("/usr/bin/hdiutil"),
            boot_image: PathBuf::from("/Library/PrivilegedHelperTools/imageflash/uefi-ntfs.img"),
            arbitration_timeout_secs: 10,
        }
    }
}

impl HelperConfig {
    /// Load the config for this invocation.
    ///
    /// An explicit `--config` path must exist; the default path is optional.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_file(path)?
                } else {
                    tracing::debug!("No config at {DEFAULT_CONFIG_PATH}, using defaults");
                    Self::default()
                }
            }
        };

        if let Some(socket) = &cli.socket {
            config.socket_path = socket.clone();
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&raw, path)
    }

    fn parse(raw: &str, path: &Path) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            path: path.to_path_buf(),
            reason,
        };

        let config: Self = toml::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        if config.identifier.is_empty() {
            return Err(invalid("identifier must not be empty".to_string()));
        }
        if config.arbitration_timeout_secs == 0 {
            return Err(invalid(
                "arbitration_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn arbitration_timeout(&self) -> Duration {
        Duration::from_secs(self.arbitration_timeout_secs)
    }
}
