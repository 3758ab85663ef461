//! Clipboard File Transfer Error Types
//!
//! Error handling for the file-descriptor / file-contents engine, plus the
//! classification used to decide how a failure surfaces to the peer.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for clipboard file transfer operations
pub type Result<T> = std::result::Result<T, ClipboardError>;

/// Clipboard file transfer error types
#[derive(Error, Debug)]
pub enum ClipboardError {
    /// A read would run past the end of the received buffer
    #[error("{context}: not enough bytes (received {received}, expected {expected})")]
    NotEnoughBytes {
        /// Structure being decoded
        context: &'static str,
        /// Bytes remaining in the buffer
        received: usize,
        /// Bytes the field needed
        expected: usize,
    },

    /// A field carries a value that cannot be accepted
    #[error("invalid `{field}`: {reason}")]
    InvalidField {
        /// Wire field name
        field: &'static str,
        /// Why the value was rejected
        reason: &'static str,
    },

    /// Message type is not one handled by the file transfer engine
    #[error("unexpected CLIPRDR message type {0}")]
    UnexpectedMessageType(u16),

    /// Peer announced a negative or absurd number of file descriptors
    #[error("bad number of files in list ({count}, max {max})")]
    InvalidItemCount {
        /// Count as it appeared on the wire, reinterpreted as signed
        count: i64,
        /// Sanity bound in force
        max: u32,
    },

    /// Filename does not fit the 260-word CLIPRDR_FILEDESCRIPTOR field
    #[error("filename overflow ({0} UTF-16 words)")]
    FilenameOverflow(usize),

    /// CLIPRDR_FILEDESCRIPTOR filename has no terminator inside its field
    #[error("filename in CLIPRDR_FILEDESCRIPTOR is too long")]
    UnterminatedFilename,

    /// None of the pasted references resolved to a usable local file
    #[error("no usable files in paste buffer")]
    NoUsableFiles,

    /// No registry (or remote index) entry at this list index
    #[error("no file at list index {0}")]
    NotFound(u32),

    /// Registry entry has a negative size
    #[error("file at list index {lindex} has negative size {size}")]
    NegativeSize {
        /// List index of the entry
        lindex: u32,
        /// Recorded size
        size: i64,
    },

    /// Open/seek/read failure on a local file
    #[error("file I/O on {path:?} failed: {source}")]
    FileIo {
        /// File being accessed
        path: PathBuf,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// Channel transport refused the data
    #[error("clipboard channel send failed: {0}")]
    Transport(String),

    /// Transfer mount could not be set up or torn down
    #[error("transfer mount error: {0}")]
    Mount(String),

    /// Virtual filesystem refused a directory entry
    #[error("virtual filesystem rejected entry {name:?}: {reason}")]
    EntryRejected {
        /// Entry name
        name: String,
        /// Reason given by the filesystem
        reason: &'static str,
    },
}

impl ClipboardError {
    /// Build a [`ClipboardError::FileIo`] for `path`
    pub fn file_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileIo {
            path: path.into(),
            source,
        }
    }
}

/// Error classification, mirrors how each failure is surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    /// Truncated or oversized input; the message is dropped
    MalformedInput,
    /// Missing file, I/O failure; becomes a fail response or a rejection
    Resource,
    /// Request/response ordering anomaly; logged, state self-heals
    ProtocolOrdering,
    /// Item or name does not fit; dropped, processing continues
    CapacityOverflow,
    /// The channel itself failed
    Transport,
}

/// Classify error for handling strategy selection
pub fn classify_error(error: &ClipboardError) -> ErrorType {
    match error {
        ClipboardError::NotEnoughBytes { .. }
        | ClipboardError::InvalidField { .. }
        | ClipboardError::InvalidItemCount { .. }
        | ClipboardError::UnterminatedFilename => ErrorType::MalformedInput,

        ClipboardError::NoUsableFiles
        | ClipboardError::NotFound(_)
        | ClipboardError::NegativeSize { .. }
        | ClipboardError::FileIo { .. }
        | ClipboardError::EntryRejected { .. } => ErrorType::Resource,

        ClipboardError::UnexpectedMessageType(_) => ErrorType::ProtocolOrdering,

        ClipboardError::FilenameOverflow(_) => ErrorType::CapacityOverflow,

        ClipboardError::Transport(_) | ClipboardError::Mount(_) => ErrorType::Transport,
    }
}

/// Whether the peer should receive a FileContentsResponseFail for this error
///
/// Transport failures are excluded: the channel that would carry the
/// response is the thing that failed.
pub fn warrants_fail_response(error: &ClipboardError) -> bool {
    matches!(
        classify_error(error),
        ErrorType::MalformedInput | ErrorType::Resource | ErrorType::CapacityOverflow
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let error = ClipboardError::NotEnoughBytes {
            context: "CLIPRDR_FILEDESCRIPTOR",
            received: 10,
            expected: 592,
        };
        assert_eq!(classify_error(&error), ErrorType::MalformedInput);

        let error = ClipboardError::NotFound(5);
        assert_eq!(classify_error(&error), ErrorType::Resource);

        let error = ClipboardError::FilenameOverflow(300);
        assert_eq!(classify_error(&error), ErrorType::CapacityOverflow);

        let error = ClipboardError::UnexpectedMessageType(2);
        assert_eq!(classify_error(&error), ErrorType::ProtocolOrdering);

        let error = ClipboardError::Transport("closed".to_string());
        assert_eq!(classify_error(&error), ErrorType::Transport);
    }

    #[test]
    fn test_io_failures_always_name_the_file() {
        use std::error::Error as _;

        let error = ClipboardError::file_io(
            "/tmp/locked.txt",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert_eq!(classify_error(&error), ErrorType::Resource);
        assert!(matches!(
            &error,
            ClipboardError::FileIo { path, .. } if path.ends_with("locked.txt")
        ));
        assert!(error.source().is_some());
    }

    #[test]
    fn test_fail_response_policy() {
        assert!(warrants_fail_response(&ClipboardError::NotFound(1)));
        assert!(warrants_fail_response(&ClipboardError::file_io(
            "/tmp/x",
            std::io::Error::from(std::io::ErrorKind::PermissionDenied)
        )));
        assert!(!warrants_fail_response(&ClipboardError::Transport(
            "closed".to_string()
        )));
    }

    #[test]
    fn test_error_display_carries_context() {
        let error = ClipboardError::file_io(
            "/tmp/missing.txt",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let text = error.to_string();
        assert!(text.contains("/tmp/missing.txt"));

        let error = ClipboardError::InvalidItemCount {
            count: -1,
            max: 65536,
        };
        assert!(error.to_string().contains("-1"));
    }
}
