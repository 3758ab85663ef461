//! File transfer session context
//!
//! [`FileTransferSession`] owns all per-channel file transfer state: the
//! local registry, the remote key index, the pending request marker and
//! the URI list of the last peer file list. It lives as long as the
//! clipboard channel and every entry point takes `&mut self`, so a host
//! that shares it between threads wraps it in a single mutex.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clipboard::backend::{ChannelTransport, TransferFs};
use crate::clipboard::cursor::ReadCursor;
use crate::clipboard::descriptors::{
    DescriptorListBuilder, IngestSummary, RemoteFileIndex, UriListBuffer,
};
use crate::clipboard::error::{warrants_fail_response, ClipboardError, Result};
use crate::clipboard::fuse::MountRequest;
use crate::clipboard::pdu::{
    ClipboardHeader, FileContentsFlags, FileContentsRequest, FileContentsResponse,
    CB_FILECONTENTS_REQUEST, CB_FILECONTENTS_RESPONSE, CB_FORMAT_DATA_RESPONSE,
};
use crate::clipboard::registry::{Clock, FileProbe, FileRegistry, HostFileProbe, SystemClock};
use crate::clipboard::transfer::{TransferState, TransferStateMachine};
use crate::config::TransferConfig;

/// Per-channel file transfer state and PDU dispatch
pub struct FileTransferSession {
    transport: Arc<dyn ChannelTransport>,
    fs: Arc<dyn TransferFs>,
    registry: FileRegistry,
    remote_files: RemoteFileIndex,
    descriptors: DescriptorListBuilder,
    transfer: TransferStateMachine,
    uri_list: UriListBuffer,
}

impl std::fmt::Debug for FileTransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTransferSession")
            .field("registry", &self.registry)
            .field("remote_files", &self.remote_files)
            .field("transfer", &self.transfer)
            .finish_non_exhaustive()
    }
}

impl FileTransferSession {
    /// Session over the host filesystem and wall clock
    pub fn new(
        config: &TransferConfig,
        transport: Arc<dyn ChannelTransport>,
        fs: Arc<dyn TransferFs>,
    ) -> Self {
        Self::with_host(
            config,
            transport,
            fs,
            Arc::new(HostFileProbe),
            Arc::new(SystemClock),
        )
    }

    /// Session with explicit host collaborators
    pub fn with_host(
        config: &TransferConfig,
        transport: Arc<dyn ChannelTransport>,
        fs: Arc<dyn TransferFs>,
        probe: Arc<dyn FileProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mount_path = config.resolved_mount_point().display().to_string();
        Self {
            transport,
            fs,
            registry: FileRegistry::new(config.uri_prefix.clone(), probe, clock),
            remote_files: RemoteFileIndex::new(),
            descriptors: DescriptorListBuilder::new(
                config.uri_prefix.clone(),
                mount_path,
                config.max_file_count,
            ),
            transfer: TransferStateMachine::new(config.channel_id, config.max_range_bytes),
            uri_list: UriListBuffer::with_capacity(config.uri_list_capacity),
        }
    }

    /// Local files currently offered to the peer
    pub fn registry(&self) -> &FileRegistry {
        &self.registry
    }

    /// Keys of the last peer file list
    pub fn remote_files(&self) -> &RemoteFileIndex {
        &self.remote_files
    }

    /// URI list built from the last peer file list
    pub fn uri_list(&self) -> &str {
        self.uri_list.as_str()
    }

    /// Pending request marker
    pub fn state(&self) -> TransferState {
        self.transfer.state()
    }

    /// Handle a FileContentsRequest or FileContentsResponse from the peer
    ///
    /// Other message types are returned as
    /// [`ClipboardError::UnexpectedMessageType`] for the generic clipboard
    /// layer to handle.
    pub fn handle_channel_pdu(&mut self, pdu: &[u8]) -> Result<()> {
        let mut src = ReadCursor::new(pdu, "CLIPRDR_HEADER");
        let header = ClipboardHeader::decode(&mut src)?;

        let available = src.peek_remaining();
        let body = &available[..available.len().min(header.data_length())];

        match header.msg_type {
            CB_FILECONTENTS_REQUEST => self.on_file_contents_request(available),
            CB_FILECONTENTS_RESPONSE => {
                self.transfer
                    .on_content_response(&header, body, self.fs.as_ref())
            }
            other => Err(ClipboardError::UnexpectedMessageType(other)),
        }
    }

    fn on_file_contents_request(&self, body: &[u8]) -> Result<()> {
        let mut src = ReadCursor::new(body, "CLIPRDR_FILECONTENTS_REQUEST");
        let request = match FileContentsRequest::decode_body(&mut src) {
            Ok(request) => request,
            Err(e) => {
                error!("Dropping malformed file contents request: {}", e);
                if let Ok(stream_id) = FileContentsResponse::decode_stream_id(body) {
                    self.transfer.reject(self.transport.as_ref(), stream_id)?;
                }
                return Err(e);
            }
        };

        debug!(
            "File contents request: stream={} lindex={} flags={:?}",
            request.stream_id, request.lindex, request.flags
        );

        let kinds = FileContentsFlags::SIZE | FileContentsFlags::RANGE;
        if !request.flags.intersects(kinds) {
            self.transfer.reject(self.transport.as_ref(), request.stream_id)?;
            return Err(ClipboardError::InvalidField {
                field: "dwFlags",
                reason: "neither SIZE nor RANGE requested",
            });
        }

        let transport = self.transport.as_ref();
        let mut result = Ok(());
        if request.flags.contains(FileContentsFlags::SIZE) {
            result = self.transfer.serve_file_size(
                transport,
                &self.registry,
                request.stream_id,
                request.lindex,
            );
        }
        if request.flags.contains(FileContentsFlags::RANGE) {
            let offset =
                (u64::from(request.position_high) << 32) | u64::from(request.position_low);
            let served = self.transfer.serve_file_range(
                transport,
                &self.registry,
                request.stream_id,
                request.lindex,
                offset,
                request.requested_bytes,
            );
            result = result.and(served);
        }
        result
    }

    /// Offer the files of a local paste buffer to the peer
    ///
    /// The FormatDataResponse is always sent, with zero items when nothing
    /// usable was pasted, so the peer never waits. The rebuild error, if
    /// any, is returned afterwards.
    pub fn send_file_list(&mut self, paste: &[u8]) -> Result<usize> {
        let rebuilt = self.registry.rebuild_from_local_paste(paste, self.fs.as_ref());
        let pdu = self.registry.serialize_as_format_data_response()?;
        self.transport
            .send_channel_data(self.transfer.channel_id(), &pdu)?;
        rebuilt
    }

    /// Expose the files of a peer FormatDataResponse on the transfer mount
    ///
    /// `pdu` is the complete message, header included. On success
    /// [`uri_list`](Self::uri_list) holds the lines for the local clipboard.
    pub fn ingest_remote_file_list(&mut self, pdu: &[u8]) -> Result<IngestSummary> {
        let mut src = ReadCursor::new(pdu, "CLIPRDR_HEADER");
        let header = ClipboardHeader::decode(&mut src)?;
        if header.msg_type != CB_FORMAT_DATA_RESPONSE {
            return Err(ClipboardError::UnexpectedMessageType(header.msg_type));
        }
        if header.is_fail() {
            warn!("Peer failed the file list request");
            self.fs.clear_directory();
            self.remote_files.clear();
            self.uri_list.clear();
            return Ok(IngestSummary::default());
        }

        self.descriptors.ingest(
            &mut src,
            self.fs.as_ref(),
            &mut self.remote_files,
            &mut self.uri_list,
        )
    }

    /// Ask the peer for the size of the file announced under `key`
    pub fn request_size(&mut self, stream_id: u32, key: u32) -> Result<()> {
        self.check_remote_key(key)?;
        self.transfer.request_size(self.transport.as_ref(), stream_id, key)
    }

    /// Ask the peer for a byte range of the file announced under `key`
    pub fn request_range(
        &mut self,
        stream_id: u32,
        key: u32,
        offset: u32,
        length: u32,
    ) -> Result<()> {
        self.check_remote_key(key)?;
        self.transfer
            .request_range(self.transport.as_ref(), stream_id, key, offset, length)
    }

    /// Forward a transfer mount request to the peer
    ///
    /// If the request cannot be sent the waiting reader is released with a
    /// failure.
    pub fn handle_mount_request(&mut self, request: MountRequest) -> Result<()> {
        let sent = match request {
            MountRequest::Size { stream_id, key } => self.request_size(stream_id, key),
            MountRequest::Range {
                stream_id,
                key,
                offset,
                length,
            } => self.request_range(stream_id, key, offset, length),
        };
        if sent.is_err() {
            self.fs.deliver_failure(request.stream_id());
        }
        sent
    }

    fn check_remote_key(&self, key: u32) -> Result<()> {
        if self.remote_files.contains(key) {
            Ok(())
        } else {
            warn!("No peer file announced under key {}", key);
            Err(ClipboardError::NotFound(key))
        }
    }

    /// Drop all state at channel teardown
    pub fn reset(&mut self) {
        debug!("Resetting file transfer session");
        self.registry.clear();
        self.remote_files.clear();
        self.uri_list.clear();
        self.transfer.reset();
        self.fs.clear_directory();
    }
}

/// Log a failed PDU the way the channel handler reports it
///
/// Returns whether errors of this class are answered with a fail response.
pub fn log_pdu_error(error: &ClipboardError) -> bool {
    let answered = warrants_fail_response(error);
    match error {
        ClipboardError::UnexpectedMessageType(_) => debug!("{}", error),
        _ => warn!("File transfer PDU failed: {}", error),
    }
    answered
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::clipboard::backend::{MockChannelTransport, MockTransferFs};
    use crate::clipboard::pdu::{
        ClipboardPduFlags, FileAttributes, FileDescriptor, FileDescriptorFlags, FileListResponse,
    };

    fn capturing_transport() -> (Arc<MockChannelTransport>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&sent);
        let mut transport = MockChannelTransport::new();
        transport
            .expect_send_channel_data()
            .returning(move |_, data| {
                sink.lock().unwrap().push(data.to_vec());
                Ok(data.len())
            });
        (Arc::new(transport), sent)
    }

    fn permissive_fs() -> Arc<MockTransferFs> {
        let mut fs = MockTransferFs::new();
        fs.expect_path_is_inside_transfer_mount().return_const(false);
        fs.expect_clear_directory().return_const(());
        fs.expect_add_directory_entry().returning(|_, _, _, _| Ok(()));
        Arc::new(fs)
    }

    fn config() -> TransferConfig {
        TransferConfig {
            mount_point: Some("/run/user/1000/xfer".into()),
            channel_id: 1004,
            ..TransferConfig::default()
        }
    }

    fn peer_list(names: &[&str]) -> Vec<u8> {
        FileListResponse {
            descriptors: names
                .iter()
                .map(|name| FileDescriptor {
                    flags: FileDescriptorFlags::FILESIZE,
                    attributes: FileAttributes::ARCHIVE,
                    last_write_time: 0,
                    file_size: 10,
                    file_name: name.to_string(),
                })
                .collect(),
        }
        .encode()
        .unwrap()
        .to_vec()
    }

    #[test]
    fn test_request_for_unannounced_key_is_refused() {
        let (transport, sent) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());

        session
            .ingest_remote_file_list(&peer_list(&["a.txt", "dir\\b.txt"]))
            .unwrap();
        assert_eq!(session.uri_list(), "file:///run/user/1000/xfer/a.txt");

        assert!(matches!(
            session.request_size(1, 1),
            Err(ClipboardError::NotFound(1))
        ));
        assert!(sent.lock().unwrap().is_empty());

        session.request_range(2, 0, 0, 10).unwrap();
        assert_eq!(session.state(), TransferState::AwaitingRange { stream_id: 2 });
        assert_eq!(sent.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_unsendable_mount_request_releases_reader() {
        let (transport, _) = capturing_transport();
        let mut fs = MockTransferFs::new();
        fs.expect_clear_directory().return_const(());
        fs.expect_deliver_failure()
            .with(mockall::predicate::eq(12))
            .times(1)
            .return_const(());
        let mut session = FileTransferSession::new(&config(), transport, Arc::new(fs));

        let request = MountRequest::Size {
            stream_id: 12,
            key: 0,
        };
        assert!(session.handle_mount_request(request).is_err());
    }

    #[test]
    fn test_truncated_request_gets_fail_when_stream_id_readable() {
        let (transport, sent) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());

        let full = FileContentsRequest::size(0x77, 0).encode();
        let err = session.handle_channel_pdu(&full[..16]).unwrap_err();
        assert!(matches!(err, ClipboardError::NotEnoughBytes { .. }));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(&sent[0][..4], &[9, 0, 2, 0]);
        assert_eq!(&sent[0][8..12], &0x77u32.to_le_bytes());
    }

    #[test]
    fn test_header_only_is_dropped_silently() {
        let (transport, sent) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());

        assert!(session.handle_channel_pdu(&[8, 0, 0, 0]).is_err());
        assert!(session.handle_channel_pdu(&[8, 0, 0, 0, 28, 0, 0, 0, 1]).is_err());
        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_other_message_types_are_passed_back() {
        let (transport, _) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());
        let err = session
            .handle_channel_pdu(&[2, 0, 0, 0, 0, 0, 0, 0])
            .unwrap_err();
        assert!(matches!(err, ClipboardError::UnexpectedMessageType(2)));
        assert!(!log_pdu_error(&err));
    }

    #[test]
    fn test_request_without_kind_is_refused() {
        let (transport, sent) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());

        let mut request = FileContentsRequest::size(3, 0);
        request.flags = FileContentsFlags::empty();
        assert!(session.handle_channel_pdu(&request.encode()).is_err());
        let status = ClipboardPduFlags::RESPONSE_FAIL.bits().to_le_bytes();
        assert_eq!(&sent.lock().unwrap()[0][2..4], &status);
    }

    #[test]
    fn test_empty_paste_still_sends_list() {
        let (transport, sent) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());

        let err = session.send_file_list(b"/definitely/not/here").unwrap_err();
        assert!(matches!(err, ClipboardError::NoUsableFiles));

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 8 + 4 + 4);
        assert_eq!(&sent[0][8..12], &0u32.to_le_bytes());
    }

    #[test]
    fn test_failed_file_list_clears_remote_state() {
        let (transport, _) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());
        session.ingest_remote_file_list(&peer_list(&["a.txt"])).unwrap();
        assert!(session.remote_files().contains(0));

        let summary = session
            .ingest_remote_file_list(&[5, 0, 2, 0, 0, 0, 0, 0])
            .unwrap();
        assert_eq!(summary, IngestSummary::default());
        assert!(!session.remote_files().contains(0));
        assert_eq!(session.uri_list(), "");
    }

    #[test]
    fn test_reset_clears_everything() {
        let (transport, _) = capturing_transport();
        let mut session = FileTransferSession::new(&config(), transport, permissive_fs());
        session.ingest_remote_file_list(&peer_list(&["a.txt"])).unwrap();
        session.request_size(1, 0).unwrap();

        session.reset();
        assert_eq!(session.state(), TransferState::Idle);
        assert_eq!(session.remote_files().key_count(), 0);
        assert!(session.registry().is_empty());
        assert_eq!(session.uri_list(), "");
    }
}
