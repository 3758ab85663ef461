//! Configuration type definitions

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Clipboard file transfer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfer mount directory (None = `$XDG_RUNTIME_DIR/lamco-clipboard-fuse`)
    pub mount_point: Option<PathBuf>,

    /// Prefix of every URI in pasted and produced file lists
    pub uri_prefix: String,

    /// Capacity in bytes of the URI list built from a peer file list
    pub uri_list_capacity: usize,

    /// Largest file count accepted from a peer (at most 65536)
    pub max_file_count: u32,

    /// Upper bound on bytes served for a single range request
    pub max_range_bytes: u32,

    /// Clipboard static virtual channel id
    pub channel_id: u16,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            mount_point: None,
            uri_prefix: "file://".to_string(),
            uri_list_capacity: 8192,
            max_file_count: 64 * 1024,
            max_range_bytes: 16 * 1024 * 1024, // 16 MB
            channel_id: 0,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line human readable
    #[default]
    Pretty,
    /// Single line per event
    Compact,
    /// Structured JSON
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level ("trace", "debug", "info", "warn", "error")
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Also write logs to this file
    pub log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            log_file: None,
        }
    }
}
