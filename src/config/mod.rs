//! Configuration management
//!
//! Loads and validates the TOML configuration of the file transfer engine:
//!
//! ```toml
//! [transfer]
//! uri_prefix = "file://"
//! uri_list_capacity = 8192
//! max_range_bytes = 16777216
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod types;

pub use types::{LogFormat, LoggingConfig, TransferConfig};

use crate::clipboard::pdu::FILE_LIST_MAX_ITEMS;

/// Directory name of the transfer mount under the runtime dir
const MOUNT_DIR_NAME: &str = "lamco-clipboard-fuse";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// File transfer configuration
    pub transfer: TransferConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.transfer.uri_list_capacity == 0 {
            anyhow::bail!("uri_list_capacity must be greater than 0");
        }

        if self.transfer.max_file_count > FILE_LIST_MAX_ITEMS {
            anyhow::bail!(
                "max_file_count ({}) cannot exceed {}",
                self.transfer.max_file_count,
                FILE_LIST_MAX_ITEMS
            );
        }

        if self.transfer.max_range_bytes == 0 {
            anyhow::bail!("max_range_bytes must be greater than 0");
        }

        if let Some(mount_point) = &self.transfer.mount_point {
            if !mount_point.is_absolute() {
                anyhow::bail!("mount_point must be absolute: {:?}", mount_point);
            }
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!("Invalid log level: {}", self.logging.level),
        }

        Ok(())
    }
}

impl TransferConfig {
    /// Configured mount point, or the per-user default
    pub fn resolved_mount_point(&self) -> PathBuf {
        self.mount_point.clone().unwrap_or_else(default_mount_point)
    }
}

/// Default transfer mount: `$XDG_RUNTIME_DIR/lamco-clipboard-fuse`
pub fn default_mount_point() -> PathBuf {
    // SAFETY: getuid has no preconditions and cannot fail
    let uid = unsafe { libc::getuid() };
    let runtime_dir =
        std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| format!("/run/user/{}", uid));

    PathBuf::from(runtime_dir).join(MOUNT_DIR_NAME)
}
