//! Collaborator interfaces of the file transfer engine
//!
//! The engine never touches the RDP channel or the virtual filesystem
//! directly. It talks to them through two traits:
//!
//! - [`ChannelTransport`]: "send these bytes on the clipboard channel"
//! - [`TransferFs`]: the transfer mount exposing peer files locally
//!
//! [`ChannelData`] plus the [`ChannelTransport`] impl for
//! `mpsc::UnboundedSender<ChannelData>` let an async server loop own the
//! real channel while the engine stays synchronous.

use std::path::Path;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::clipboard::error::{ClipboardError, Result};

/// Outbound side of the clipboard static virtual channel
#[cfg_attr(test, mockall::automock)]
pub trait ChannelTransport: Send + Sync {
    /// Send one complete CLIPRDR message, returning the bytes accepted
    fn send_channel_data(&self, channel_id: u16, data: &[u8]) -> Result<usize>;
}

/// Virtual filesystem that exposes peer-announced files
///
/// Entries are keyed by the list index the peer announced them under.
/// Content requests for a key flow back into the engine; results come
/// out through the `deliver_*` methods, correlated by stream id.
#[cfg_attr(test, mockall::automock)]
pub trait TransferFs: Send + Sync {
    /// Whether `path` lies inside the transfer mount
    fn path_is_inside_transfer_mount(&self, path: &Path) -> bool;

    /// Drop every entry of the transfer directory
    fn clear_directory(&self);

    /// Add an entry announced by the peer under list index `key`
    fn add_directory_entry(&self, name: &str, is_dir: bool, size: u64, key: u32) -> Result<()>;

    /// Answer to a size request
    fn deliver_size_result(&self, stream_id: u32, size: u64);

    /// Answer to a range request; `data` may be shorter than requested
    fn deliver_range_result(&self, stream_id: u32, data: &[u8]);

    /// The peer answered the request for `stream_id` with a failure
    fn deliver_failure(&self, _stream_id: u32) {}
}

/// One outbound message queued for the channel owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Static channel id
    pub channel_id: u16,
    /// Complete CLIPRDR message
    pub data: Bytes,
}

impl ChannelTransport for mpsc::UnboundedSender<ChannelData> {
    fn send_channel_data(&self, channel_id: u16, data: &[u8]) -> Result<usize> {
        self.send(ChannelData {
            channel_id,
            data: Bytes::copy_from_slice(data),
        })
        .map_err(|_| ClipboardError::Transport("channel owner has gone away".to_string()))?;
        Ok(data.len())
    }
}
