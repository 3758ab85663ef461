//! # lamco-cliprdr-files
//!
//! MS-RDPECLIP clipboard file transfer for the lamco RDP server.
//!
//! This crate implements the file part of the clipboard virtual channel:
//! - [`clipboard::pdu`] - wire codec for file lists and file contents messages
//! - [`clipboard::registry`] - local files offered to the client
//! - [`clipboard::transfer`] - request/response correlation and serving file data
//! - [`clipboard::fuse`] - FUSE mount exposing client files to local applications
//!
//! # Architecture
//!
//! ```text
//! lamco-cliprdr-files
//!   ├─> FileTransferSession (one per clipboard channel)
//!   │     ├─> FileRegistry          (S2C: local paste -> file list, serve contents)
//!   │     ├─> DescriptorListBuilder (C2S: client file list -> transfer mount)
//!   │     └─> TransferStateMachine  (one outstanding FileContentsRequest)
//!   └─> FuseTransferMount (read() -> MountRequest -> session)
//! ```
//!
//! # Data Flow
//!
//! **S2C:** local paste → FormatDataResponse → client → FileContentsRequest → local file
//!
//! **C2S:** client FormatDataResponse → FUSE entries → read() → FileContentsRequest → client
//!
//! The engine is synchronous. The host owns the channel and the session and
//! feeds it every inbound clipboard PDU with
//! [`FileTransferSession::handle_channel_pdu`](clipboard::FileTransferSession::handle_channel_pdu).

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Clipboard file transfer engine
pub mod clipboard;

/// Engine configuration
pub mod config;

/// Logging setup
pub mod utils;

pub use clipboard::{ClipboardError, FileTransferSession, FuseTransferMount, Result};
pub use config::Config;
