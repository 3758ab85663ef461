//! File Contents Transfer State Machine
//!
//! Both directions of CLIPRDR_FILECONTENTS traffic:
//!
//! - Requester (C2S): at most one request to the peer is outstanding. The
//!   response carries no request kind, so the pending marker decides how
//!   it is decoded. The marker is cleared on every response, even a
//!   malformed one, so the engine never stays desynchronized. A response
//!   that cannot be delivered releases the pending stream with a failure.
//! - Responder (S2C): the peer asks for the size or a byte range of a
//!   local registry entry and is answered directly from the file.
//!
//! ```text
//!            request_size                 response (any)
//!   Idle ----------------> AwaitingSize ----------------> Idle
//!     |      request_range                response (any)
//!     +------------------> AwaitingRange ---------------> Idle
//! ```

use std::io::{Read, Seek, SeekFrom};

use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::clipboard::backend::{ChannelTransport, TransferFs};
use crate::clipboard::error::{ClipboardError, Result};
use crate::clipboard::pdu::{ClipboardHeader, FileContentsRequest, FileContentsResponse};
use crate::clipboard::registry::FileRegistry;
use crate::utils::AUDIT_TARGET;

/// Default cap on bytes served for one RANGE request
pub const DEFAULT_MAX_RANGE_BYTES: u32 = 16 * 1024 * 1024;

fn stream_mismatch(expected: u32, got: u32) -> ClipboardError {
    warn!("Response echoes stream {} while stream {} is pending", got, expected);
    ClipboardError::InvalidField {
        field: "streamId",
        reason: "does not match the pending request",
    }
}

/// Pending request marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransferState {
    /// Nothing outstanding
    #[default]
    Idle,
    /// A FILECONTENTS_SIZE request is outstanding
    AwaitingSize {
        /// Stream the answer must echo
        stream_id: u32,
    },
    /// A FILECONTENTS_RANGE request is outstanding
    AwaitingRange {
        /// Stream the answer must echo
        stream_id: u32,
    },
}

impl TransferState {
    /// Stream of the outstanding request, if any
    pub fn pending_stream_id(&self) -> Option<u32> {
        match self {
            Self::Idle => None,
            Self::AwaitingSize { stream_id } | Self::AwaitingRange { stream_id } => {
                Some(*stream_id)
            }
        }
    }
}

/// Single-outstanding-request state machine plus the responder
#[derive(Debug, Clone)]
pub struct TransferStateMachine {
    state: TransferState,
    channel_id: u16,
    max_range_bytes: u32,
}

impl TransferStateMachine {
    /// Create an idle state machine sending on `channel_id`
    pub fn new(channel_id: u16, max_range_bytes: u32) -> Self {
        Self {
            state: TransferState::Idle,
            channel_id,
            max_range_bytes: max_range_bytes.max(1),
        }
    }

    /// Current pending marker
    pub fn state(&self) -> TransferState {
        self.state
    }

    /// Channel the machine sends on
    pub fn channel_id(&self) -> u16 {
        self.channel_id
    }

    /// Back to idle, dropping any pending marker
    pub fn reset(&mut self) {
        self.state = TransferState::Idle;
    }

    fn send(&self, transport: &dyn ChannelTransport, data: &[u8]) -> Result<()> {
        let sent = transport.send_channel_data(self.channel_id, data)?;
        trace!("Sent {} byte(s) on channel {}", sent, self.channel_id);
        Ok(())
    }

    fn warn_if_pending(&self, next: &str) {
        if self.state != TransferState::Idle {
            warn!(
                "Issuing {} request while {:?}; overwriting pending marker",
                next, self.state
            );
        }
    }

    // =========================================================================
    // Requester
    // =========================================================================

    /// Ask the peer for the size of file `lindex`
    pub fn request_size(
        &mut self,
        transport: &dyn ChannelTransport,
        stream_id: u32,
        lindex: u32,
    ) -> Result<()> {
        self.warn_if_pending("size");
        debug!("Requesting size of peer file {} (stream {})", lindex, stream_id);

        self.send(transport, &FileContentsRequest::size(stream_id, lindex).encode())?;
        self.state = TransferState::AwaitingSize { stream_id };
        Ok(())
    }

    /// Ask the peer for `length` bytes of file `lindex` starting at `offset`
    pub fn request_range(
        &mut self,
        transport: &dyn ChannelTransport,
        stream_id: u32,
        lindex: u32,
        offset: u32,
        length: u32,
    ) -> Result<()> {
        self.warn_if_pending("range");
        debug!(
            "Requesting {} byte(s) at {} of peer file {} (stream {})",
            length, offset, lindex, stream_id
        );

        self.send(
            transport,
            &FileContentsRequest::range(stream_id, lindex, offset, length).encode(),
        )?;
        self.state = TransferState::AwaitingRange { stream_id };
        Ok(())
    }

    /// Handle a FileContentsResponse body
    ///
    /// `body` is the data following the header, bounded by the declared
    /// length. Unsolicited responses are logged and ignored. A malformed
    /// answer, or one echoing another stream, fails the pending stream so
    /// its reader is never left waiting.
    pub fn on_content_response(
        &mut self,
        header: &ClipboardHeader,
        body: &[u8],
        fs: &dyn TransferFs,
    ) -> Result<()> {
        let pending = std::mem::take(&mut self.state);
        let Some(expected) = pending.pending_stream_id() else {
            error!("Unsolicited file contents response ignored");
            return Ok(());
        };

        let delivered = if header.is_fail() {
            Self::deliver_peer_failure(expected, body, fs)
        } else {
            Self::deliver_answer(pending, expected, body, fs)
        };

        if let Err(e) = &delivered {
            warn!("Failing stream {} on bad file contents response: {}", expected, e);
            fs.deliver_failure(expected);
        }
        delivered
    }

    fn deliver_peer_failure(expected: u32, body: &[u8], fs: &dyn TransferFs) -> Result<()> {
        let stream_id = FileContentsResponse::decode_stream_id(body)?;
        if stream_id != expected {
            return Err(stream_mismatch(expected, stream_id));
        }
        warn!("Peer failed file contents request (stream {})", stream_id);
        fs.deliver_failure(stream_id);
        Ok(())
    }

    fn deliver_answer(
        pending: TransferState,
        expected: u32,
        body: &[u8],
        fs: &dyn TransferFs,
    ) -> Result<()> {
        match pending {
            TransferState::AwaitingSize { .. } => {
                let (stream_id, size) = FileContentsResponse::decode_size_body(body)?;
                if stream_id != expected {
                    return Err(stream_mismatch(expected, stream_id));
                }
                debug!("Peer file size {} (stream {})", size, stream_id);
                fs.deliver_size_result(stream_id, size);
            }
            TransferState::AwaitingRange { .. } => {
                let (stream_id, data) = FileContentsResponse::decode_range_body(body)?;
                if stream_id != expected {
                    return Err(stream_mismatch(expected, stream_id));
                }
                info!(
                    target: AUDIT_TARGET,
                    direction = "C2S",
                    stream_id,
                    bytes = data.len(),
                    "Received file data from peer"
                );
                fs.deliver_range_result(stream_id, data);
            }
            TransferState::Idle => {}
        }
        Ok(())
    }

    // =========================================================================
    // Responder
    // =========================================================================

    fn send_fail(&self, transport: &dyn ChannelTransport, stream_id: u32) -> Result<()> {
        self.send(transport, &FileContentsResponse::Fail { stream_id }.encode()?)
    }

    /// Tell the peer its request for `stream_id` could not be served
    pub fn reject(&self, transport: &dyn ChannelTransport, stream_id: u32) -> Result<()> {
        self.send_fail(transport, stream_id)
    }

    /// Answer a FILECONTENTS_SIZE request for local entry `lindex`
    ///
    /// A missing entry or a negative size is answered with a fail response
    /// and reported as an error.
    pub fn serve_file_size(
        &self,
        transport: &dyn ChannelTransport,
        registry: &FileRegistry,
        stream_id: u32,
        lindex: u32,
    ) -> Result<()> {
        let size = match registry.get(lindex) {
            Ok(entry) if entry.size >= 0 => entry.size as u64,
            Ok(entry) => {
                self.send_fail(transport, stream_id)?;
                return Err(ClipboardError::NegativeSize {
                    lindex,
                    size: entry.size,
                });
            }
            Err(e) => {
                warn!("Size request for unknown file {} (stream {})", lindex, stream_id);
                self.send_fail(transport, stream_id)?;
                return Err(e);
            }
        };

        debug!("Serving size {} of file {} (stream {})", size, lindex, stream_id);
        self.send(transport, &FileContentsResponse::Size { stream_id, size }.encode()?)
    }

    /// Answer a FILECONTENTS_RANGE request for local entry `lindex`
    ///
    /// Short reads at end of file are a success; an offset past the end
    /// yields an empty payload. Any open, seek or read failure is answered
    /// with a fail response. Every served read is written to the audit log.
    pub fn serve_file_range(
        &self,
        transport: &dyn ChannelTransport,
        registry: &FileRegistry,
        stream_id: u32,
        lindex: u32,
        offset: u64,
        length: u32,
    ) -> Result<()> {
        let entry = match registry.get(lindex) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Range request for unknown file {} (stream {})", lindex, stream_id);
                self.send_fail(transport, stream_id)?;
                return Err(e);
            }
        };

        let full_path = entry.full_path();
        let limit = length.min(self.max_range_bytes);
        if limit < length {
            debug!("Clamping range request of {} byte(s) to {}", length, limit);
        }

        let read = registry.open_read_only(entry).and_then(|mut file| {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| ClipboardError::file_io(&full_path, e))?;
            let mut data = Vec::with_capacity(limit as usize);
            file.take(u64::from(limit))
                .read_to_end(&mut data)
                .map_err(|e| ClipboardError::file_io(&full_path, e))?;
            Ok(data)
        });

        let data = match read {
            Ok(data) => data,
            Err(e) => {
                error!("Cannot serve range of {:?}: {}", full_path, e);
                self.send_fail(transport, stream_id)?;
                return Err(e);
            }
        };

        let bytes = data.len();
        self.send(
            transport,
            &FileContentsResponse::Range {
                stream_id,
                data: Bytes::from(data),
            }
            .encode()?,
        )?;

        // SAFETY: getuid has no preconditions and cannot fail
        let uid = unsafe { libc::getuid() };
        info!(
            target: AUDIT_TARGET,
            direction = "S2C",
            path = %full_path.display(),
            uid,
            stream_id,
            offset,
            bytes,
            "Transferred a file"
        );
        Ok(())
    }
}
