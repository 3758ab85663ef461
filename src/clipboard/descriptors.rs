//! Peer file list ingestion (C2S)
//!
//! Turns the CLIPRDR_FILELIST of a FormatDataResponse into entries on the
//! transfer mount plus a newline separated URI list for the local
//! clipboard:
//!
//! ```text
//! cItems + N x FILEDESCRIPTOR -> TransferFs::add_directory_entry(name, key = lindex)
//!                             -> "file:///run/user/1000/lamco-clipboard-fuse/name\n..."
//! ```
//!
//! Keys are the raw wire list index. Skipped descriptors leave a hole in
//! [`RemoteFileIndex`] so later content requests use the index the peer
//! announced, never a compacted position.

use tracing::{debug, info, warn};

use crate::clipboard::backend::TransferFs;
use crate::clipboard::cursor::ReadCursor;
use crate::clipboard::error::{ClipboardError, Result};
use crate::clipboard::pdu::{FileAttributes, FileDescriptor, FILE_LIST_MAX_ITEMS};

// =============================================================================
// URI list buffer
// =============================================================================

/// Fixed capacity text buffer receiving the URI list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriListBuffer {
    text: String,
    capacity: usize,
}

impl UriListBuffer {
    /// Empty buffer holding at most `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `line`, preceded by `\n` unless it is the first one
    ///
    /// Returns `false` and leaves the buffer untouched if the line does not
    /// fit.
    pub fn try_push_line(&mut self, line: &str) -> bool {
        let separator = usize::from(!self.text.is_empty());
        if self.text.len() + separator + line.len() > self.capacity {
            return false;
        }
        if separator == 1 {
            self.text.push('\n');
        }
        self.text.push_str(line);
        true
    }

    /// Buffer contents
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Bytes written so far
    pub fn len(&self) -> usize {
        self.text.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Maximum size in bytes
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Forget the contents, keeping the capacity
    pub fn clear(&mut self) {
        self.text.clear();
    }

    /// Take the text out
    pub fn into_string(self) -> String {
        self.text
    }
}

// =============================================================================
// Remote file index
// =============================================================================

/// A peer file accepted onto the transfer mount
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// File name as announced
    pub name: String,
    /// Announced size
    pub size: u64,
    /// FILE_ATTRIBUTE_* bits
    pub attributes: FileAttributes,
    /// Peer's lastWriteTime in FILETIME ticks
    pub last_write_time: u64,
}

/// Map from wire key (list index) to accepted file slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteFileIndex {
    slots: Vec<Option<usize>>,
    files: Vec<RemoteFile>,
}

impl RemoteFileIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    fn push_accepted(&mut self, file: RemoteFile) {
        self.slots.push(Some(self.files.len()));
        self.files.push(file);
    }

    fn push_hole(&mut self) {
        self.slots.push(None);
    }

    /// Slot of the file announced under `key`, `None` for skipped keys
    pub fn slot(&self, key: u32) -> Option<usize> {
        self.slots.get(key as usize).copied().flatten()
    }

    /// File announced under `key`
    pub fn get(&self, key: u32) -> Option<&RemoteFile> {
        self.slot(key).and_then(|slot| self.files.get(slot))
    }

    /// Whether `key` names an accepted file
    pub fn contains(&self, key: u32) -> bool {
        self.slot(key).is_some()
    }

    /// Number of wire keys seen, holes included
    pub fn key_count(&self) -> usize {
        self.slots.len()
    }

    /// Accepted files in wire order
    pub fn files(&self) -> &[RemoteFile] {
        &self.files
    }

    /// Forget every key
    pub fn clear(&mut self) {
        self.slots.clear();
        self.files.clear();
    }
}

// =============================================================================
// Descriptor list builder
// =============================================================================

/// Counters from one [`DescriptorListBuilder::ingest`] run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Item count announced by the peer
    pub announced: usize,
    /// Entries registered and listed
    pub listed: usize,
    /// Directories and nested names
    pub skipped: usize,
    /// Entries the transfer mount refused
    pub rejected: usize,
    /// Registered entries that did not fit the URI list
    pub dropped: usize,
}

/// Builds transfer mount entries and URI lines from a peer file list
#[derive(Debug, Clone)]
pub struct DescriptorListBuilder {
    uri_prefix: String,
    mount_path: String,
    max_items: u32,
}

impl DescriptorListBuilder {
    /// Builder producing `"<uri_prefix><mount_path>/<name>"` lines
    pub fn new(
        uri_prefix: impl Into<String>,
        mount_path: impl Into<String>,
        max_items: u32,
    ) -> Self {
        Self {
            uri_prefix: uri_prefix.into(),
            mount_path: mount_path.into(),
            max_items: max_items.min(FILE_LIST_MAX_ITEMS),
        }
    }

    /// URI line for a file named `name`
    pub fn uri_for(&self, name: &str) -> String {
        format!("{}{}/{}", self.uri_prefix, self.mount_path, name)
    }

    /// Ingest a CLIPRDR_FILELIST body (`cItems` then the records)
    ///
    /// Previous transfer directory state is cleared first. A malformed
    /// record aborts the whole list: offsets after it are unrecoverable.
    /// Entries registered before the abort stay registered.
    pub fn ingest(
        &self,
        src: &mut ReadCursor<'_>,
        fs: &dyn TransferFs,
        index: &mut RemoteFileIndex,
        out: &mut UriListBuffer,
    ) -> Result<IngestSummary> {
        fs.clear_directory();
        index.clear();
        out.clear();

        src.set_context("CLIPRDR_FILELIST");
        let count = src.read_u32()? as i32;
        if count < 0 || count as u32 > self.max_items {
            return Err(ClipboardError::InvalidItemCount {
                count: i64::from(count),
                max: self.max_items,
            });
        }

        let mut summary = IngestSummary {
            announced: count as usize,
            ..IngestSummary::default()
        };
        debug!("Peer file list announces {} item(s)", count);

        for lindex in 0..count as u32 {
            let descriptor = FileDescriptor::decode(src)?;

            if descriptor.has_path_separator() || descriptor.is_directory() {
                warn!(
                    "Skipping peer entry {} '{}': directories are not supported",
                    lindex, descriptor.file_name
                );
                index.push_hole();
                summary.skipped += 1;
                continue;
            }

            let size = u64::from(descriptor.file_size_low());
            if let Err(e) = fs.add_directory_entry(&descriptor.file_name, false, size, lindex) {
                warn!(
                    "Transfer mount refused peer entry {} '{}': {}",
                    lindex, descriptor.file_name, e
                );
                index.push_hole();
                summary.rejected += 1;
                continue;
            }

            index.push_accepted(RemoteFile {
                name: descriptor.file_name.clone(),
                size,
                attributes: descriptor.attributes,
                last_write_time: descriptor.last_write_time,
            });

            if out.try_push_line(&self.uri_for(&descriptor.file_name)) {
                summary.listed += 1;
            } else {
                summary.dropped += 1;
            }
        }

        if summary.dropped > 0 {
            warn!(
                "Dropped {} file(s) from the clip buffer due to insufficient space",
                summary.dropped
            );
        }
        info!(
            "Peer file list ingested: {} listed, {} skipped, {} rejected",
            summary.listed, summary.skipped, summary.rejected
        );
        Ok(summary)
    }
}
