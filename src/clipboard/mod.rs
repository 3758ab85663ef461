//! Clipboard File Transfer Module
//!
//! MS-RDPECLIP file transfer in both directions: announcing local files to
//! the peer and serving their contents (S2C), and exposing peer files on a
//! FUSE transfer mount whose reads are fetched on demand (C2S).
//!
//! # Architecture
//!
//! - [`filename`] - percent-decoding and UTF-16 filename field transcoding
//! - [`pdu`] - FormatDataResponse / FileContentsRequest / FileContentsResponse codec
//! - [`registry`] - local files offered to the peer, by list index
//! - [`descriptors`] - peer file list to transfer mount entries and URI list
//! - [`transfer`] - single-outstanding-request state machine and responder
//! - [`session`] - per-channel context and PDU dispatch
//! - [`fuse`] - FUSE implementation of the transfer mount
//!
//! # Data Flow
//!
//! ```text
//! Local paste (text/uri-list)
//!   └─> FileRegistry ──> FormatDataResponse(N x FILEDESCRIPTOR) ──> Peer
//! Peer FileContentsRequest(lindex) ──> registry lookup ──> FileContentsResponse
//!
//! Peer FormatDataResponse
//!   └─> DescriptorListBuilder ──> FuseTransferMount entries + URI list
//! Local read() ──> MountRequest ──> FileContentsRequest ──> Peer
//! Peer FileContentsResponse ──> TransferStateMachine ──> read() returns
//! ```

pub mod backend;
pub mod cursor;
pub mod descriptors;
pub mod error;
pub mod filename;
pub mod fuse;
pub mod pdu;
pub mod registry;
pub mod session;
pub mod transfer;

pub use backend::{ChannelData, ChannelTransport, TransferFs};
pub use descriptors::{DescriptorListBuilder, IngestSummary, RemoteFileIndex, UriListBuffer};
pub use error::{classify_error, ClipboardError, ErrorType, Result};
pub use fuse::{FuseTransferMount, MountRequest};
pub use registry::{FileEntry, FileRegistry};
pub use session::FileTransferSession;
pub use transfer::{TransferState, TransferStateMachine};
