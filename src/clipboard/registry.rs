//! Local file registry (S2C)
//!
//! When the local side pastes files for the peer, every usable path in the
//! paste buffer becomes a [`FileEntry`] at list index 0..N-1. The peer
//! later asks for size or contents by that index.
//!
//! The registry is rebuilt from scratch on every paste and is owned by a
//! single [`FileTransferSession`](crate::clipboard::FileTransferSession);
//! nothing else keeps references into it.

use std::fs::File;
use std::io::{self, Read, Seek};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::clipboard::backend::TransferFs;
use crate::clipboard::error::{ClipboardError, Result};
use crate::clipboard::filename::{decode_percent_encoded, split_local_path};
use crate::clipboard::pdu::{FileAttributes, FileDescriptor, FileDescriptorFlags, FileListResponse};

/// Seconds between 1601-01-01 and 1970-01-01
pub const FILETIME_EPOCH_DIFF: i64 = 11_644_473_600;

/// FILETIME ticks per second
const FILETIME_TICKS_PER_SECOND: u64 = 10_000_000;

/// Paste payload meaning "no files" (`x-special/gnome-copied-files` verb)
const SENTINELS: [&[u8]; 2] = [b"copy", b"cut"];

fn is_verb_line(line: &[u8]) -> bool {
    SENTINELS.iter().any(|sentinel| *sentinel == line)
}

/// Convert Unix seconds to FILETIME ticks; times before 1601 clamp to zero
pub fn unix_to_filetime(unix_seconds: i64) -> u64 {
    let since_1601 = unix_seconds.saturating_add(FILETIME_EPOCH_DIFF).max(0) as u64;
    since_1601.saturating_mul(FILETIME_TICKS_PER_SECOND)
}

// =============================================================================
// Host collaborators
// =============================================================================

/// Readable and seekable file handle
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// Host filesystem checks used while resolving pasted paths
pub trait FileProbe: Send + Sync {
    /// Whether anything exists at `path`
    fn exists(&self, path: &Path) -> bool;

    /// Whether `path` is a directory
    fn is_directory(&self, path: &Path) -> bool;

    /// Size in bytes of the file at `path`
    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// Open `path` for reading
    fn open_read_only(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;
}

/// [`FileProbe`] backed by `std::fs`
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFileProbe;

impl FileProbe for HostFileProbe {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn open_read_only(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(File::open(path)?))
    }
}

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn unix_seconds(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

// =============================================================================
// File Entry
// =============================================================================

/// A local file offered to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Directory, no trailing separator (`/` for the root)
    pub path: String,
    /// Base file name
    pub name: String,
    /// Size in bytes
    pub size: i64,
    /// FILE_ATTRIBUTE_* bits
    pub attributes: FileAttributes,
    /// FILETIME ticks
    pub modified_time: u64,
}

impl FileEntry {
    /// Directory and name joined back together
    pub fn full_path(&self) -> PathBuf {
        Path::new(&self.path).join(&self.name)
    }

    fn to_descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            flags: FileDescriptorFlags::ATTRIBUTES
                | FileDescriptorFlags::FILESIZE
                | FileDescriptorFlags::WRITESTIME
                | FileDescriptorFlags::SHOWPROGRESSUI,
            attributes: self.attributes,
            last_write_time: self.modified_time,
            file_size: u64::try_from(self.size).unwrap_or(0),
            file_name: self.name.clone(),
        }
    }
}

// =============================================================================
// File Registry
// =============================================================================

/// Ordered list of local files, indexed by list position
pub struct FileRegistry {
    entries: Vec<FileEntry>,
    uri_prefix: String,
    probe: Arc<dyn FileProbe>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for FileRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRegistry")
            .field("entries", &self.entries)
            .field("uri_prefix", &self.uri_prefix)
            .finish_non_exhaustive()
    }
}

impl FileRegistry {
    /// Create an empty registry over the given host collaborators
    pub fn new(
        uri_prefix: impl Into<String>,
        probe: Arc<dyn FileProbe>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries: Vec::new(),
            uri_prefix: uri_prefix.into(),
            probe,
            clock,
        }
    }

    /// Registry over the real filesystem and wall clock
    pub fn with_host(uri_prefix: impl Into<String>) -> Self {
        Self::new(uri_prefix, Arc::new(HostFileProbe), Arc::new(SystemClock))
    }

    /// Replace the registry with the files named in a local paste buffer
    ///
    /// References are separated by `\n` or `\r`; blank ones are ignored. A
    /// line that is exactly `copy` or `cut` is the verb line of
    /// `x-special/gnome-copied-files` and is skipped; a paste holding only
    /// verbs leaves the registry empty without error. Each rejected
    /// reference is logged; the rebuild only fails when nothing usable
    /// remains.
    pub fn rebuild_from_local_paste(
        &mut self,
        paste: &[u8],
        fs: &dyn TransferFs,
    ) -> Result<usize> {
        self.entries.clear();

        let mut references = 0;
        let mut verbs = 0;
        for reference in paste.split(|&b| b == b'\n' || b == b'\r') {
            if reference.is_empty() {
                continue;
            }
            if is_verb_line(reference) {
                verbs += 1;
                continue;
            }
            references += 1;
            if let Err(e) = self.add_reference(reference, fs) {
                warn!("Paste reference rejected: {}", e);
            }
        }

        if references == 0 && verbs > 0 {
            debug!("Paste buffer is a bare copy/cut verb, no files offered");
            return Ok(0);
        }

        if self.entries.is_empty() {
            error!("No usable files in paste buffer");
            return Err(ClipboardError::NoUsableFiles);
        }

        info!("Offering {} file(s) to peer", self.entries.len());
        Ok(self.entries.len())
    }

    fn add_reference(&mut self, reference: &[u8], fs: &dyn TransferFs) -> Result<()> {
        let encoded = match reference.strip_prefix(self.uri_prefix.as_bytes()) {
            Some(rest) if !rest.is_empty() => rest,
            _ => reference,
        };
        let decoded = decode_percent_encoded(encoded);
        let full_path = Path::new(std::ffi::OsStr::from_bytes(&decoded));

        // Probing a path on the transfer mount would re-enter its handlers
        if fs.path_is_inside_transfer_mount(full_path) {
            return Err(ClipboardError::EntryRejected {
                name: full_path.display().to_string(),
                reason: "file lives on the transfer mount",
            });
        }
        if self.probe.is_directory(full_path) {
            return Err(ClipboardError::EntryRejected {
                name: full_path.display().to_string(),
                reason: "directories are not supported",
            });
        }
        if !self.probe.exists(full_path) {
            return Err(ClipboardError::EntryRejected {
                name: full_path.display().to_string(),
                reason: "file does not exist",
            });
        }

        let Ok(full) = std::str::from_utf8(&decoded) else {
            return Err(ClipboardError::EntryRejected {
                name: full_path.display().to_string(),
                reason: "path is not valid UTF-8",
            });
        };

        let size = self
            .probe
            .file_size(full_path)
            .map_err(|e| ClipboardError::file_io(full_path, e))?;
        let size = i64::try_from(size).map_err(|_| ClipboardError::InvalidField {
            field: "fileSize",
            reason: "file too large",
        })?;

        let (path, name) = split_local_path(full);
        debug!("Registered '{}' in '{}' ({} bytes)", name, path, size);

        self.entries.push(FileEntry {
            path,
            name,
            size,
            attributes: FileAttributes::ARCHIVE,
            modified_time: unix_to_filetime(self.clock.unix_seconds()),
        });
        Ok(())
    }

    /// Entry at `lindex`
    pub fn get(&self, lindex: u32) -> Result<&FileEntry> {
        self.entries
            .get(lindex as usize)
            .ok_or(ClipboardError::NotFound(lindex))
    }

    /// Open the file behind `entry`
    pub fn open_read_only(&self, entry: &FileEntry) -> Result<Box<dyn ReadSeek>> {
        let path = entry.full_path();
        self.probe
            .open_read_only(&path)
            .map_err(|e| ClipboardError::file_io(path, e))
    }

    /// FormatDataResponse announcing every entry, in registry order
    pub fn serialize_as_format_data_response(&self) -> Result<Bytes> {
        FileListResponse {
            descriptors: self.entries.iter().map(FileEntry::to_descriptor).collect(),
        }
        .encode()
    }

    /// Entries in list order
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::clipboard::backend::MockTransferFs;

    struct FixedClock(i64);

    impl Clock for FixedClock {
        fn unix_seconds(&self) -> i64 {
            self.0
        }
    }

    fn registry() -> FileRegistry {
        FileRegistry::new("file://", Arc::new(HostFileProbe), Arc::new(FixedClock(0)))
    }

    fn outside_mount() -> MockTransferFs {
        let mut fs = MockTransferFs::new();
        fs.expect_path_is_inside_transfer_mount().return_const(false);
        fs
    }

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        path
    }

    #[test]
    fn test_filetime_conversion() {
        assert_eq!(unix_to_filetime(0), 116_444_736_000_000_000);
        assert_eq!(unix_to_filetime(1), 116_444_736_010_000_000);
        assert_eq!(unix_to_filetime(-FILETIME_EPOCH_DIFF - 5), 0);
    }

    #[test]
    fn test_copy_and_cut_are_empty_success() {
        let fs = MockTransferFs::new();
        let mut registry = registry();
        assert_eq!(registry.rebuild_from_local_paste(b"copy", &fs).unwrap(), 0);
        assert_eq!(registry.rebuild_from_local_paste(b"cut", &fs).unwrap(), 0);
        assert!(registry.is_empty());
    }

    /// [`FileProbe`] finding a 1-byte file at every path
    struct EverythingExists;

    impl FileProbe for EverythingExists {
        fn exists(&self, _path: &Path) -> bool {
            true
        }

        fn is_directory(&self, _path: &Path) -> bool {
            false
        }

        fn file_size(&self, _path: &Path) -> io::Result<u64> {
            Ok(1)
        }

        fn open_read_only(&self, _path: &Path) -> io::Result<Box<dyn ReadSeek>> {
            Ok(Box::new(io::Cursor::new(vec![0u8])))
        }
    }

    #[test]
    fn test_gnome_copied_files_verb_line_is_skipped() {
        let mut registry = FileRegistry::new(
            "file://",
            Arc::new(EverythingExists),
            Arc::new(FixedClock(0)),
        );
        for paste in ["copy\nfile:///tmp/a.txt", "cut\r\nfile:///tmp/a.txt"] {
            let count = registry
                .rebuild_from_local_paste(paste.as_bytes(), &outside_mount())
                .unwrap();
            assert_eq!(count, 1);
            assert_eq!(registry.get(0).unwrap().full_path(), PathBuf::from("/tmp/a.txt"));
        }

        // Only whole lines are verbs
        registry
            .rebuild_from_local_paste(b"/tmp/copy\nfile:///tmp/cut", &outside_mount())
            .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(0).unwrap().name, "copy");
    }

    #[test]
    fn test_verb_line_with_only_missing_files_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paste = format!("copy\nfile://{}/gone.txt", dir.path().display());
        let mut registry = registry();
        let err = registry
            .rebuild_from_local_paste(paste.as_bytes(), &outside_mount())
            .unwrap_err();
        assert!(matches!(err, ClipboardError::NoUsableFiles));
    }

    #[test]
    fn test_partial_paste_keeps_usable_files_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.txt", b"aaaa");
        let b = write_file(dir.path(), "b b.txt", b"bb");
        let paste = format!(
            "file://{}\r\n{}/missing.txt\n\n{}",
            a.display(),
            dir.path().display(),
            b.display().to_string().replace(' ', "%20")
        );

        let mut registry = registry();
        let count = registry
            .rebuild_from_local_paste(paste.as_bytes(), &outside_mount())
            .unwrap();
        assert_eq!(count, 2);

        let first = registry.get(0).unwrap();
        assert_eq!(first.name, "a.txt");
        assert_eq!(first.path, dir.path().display().to_string());
        assert_eq!(first.size, 4);
        assert_eq!(first.attributes, FileAttributes::ARCHIVE);
        assert_eq!(first.modified_time, unix_to_filetime(0));
        assert_eq!(first.full_path(), a);

        assert_eq!(registry.get(1).unwrap().name, "b b.txt");
        assert!(matches!(registry.get(2), Err(ClipboardError::NotFound(2))));
    }

    #[test]
    fn test_nothing_usable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let paste = format!("{0}/nope\n{0}", dir.path().display());
        let mut registry = registry();
        let err = registry
            .rebuild_from_local_paste(paste.as_bytes(), &outside_mount())
            .unwrap_err();
        assert!(matches!(err, ClipboardError::NoUsableFiles));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_transfer_mount_paths_are_never_probed() {
        let mut fs = MockTransferFs::new();
        fs.expect_path_is_inside_transfer_mount().return_const(true);
        let mut registry = registry();
        assert!(registry
            .rebuild_from_local_paste(b"/run/user/1000/lamco-clipboard-fuse/x.txt", &fs)
            .is_err());
    }

    #[test]
    fn test_rebuild_discards_previous_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.txt", b"a");
        let fs = outside_mount();
        let mut registry = registry();
        registry
            .rebuild_from_local_paste(a.display().to_string().as_bytes(), &fs)
            .unwrap();
        assert_eq!(registry.len(), 1);

        registry.rebuild_from_local_paste(b"copy", &fs).unwrap();
        assert!(registry.get(0).is_err());
    }

    #[test]
    fn test_format_data_response_covers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.txt", b"hello");
        let mut registry = registry();
        registry
            .rebuild_from_local_paste(a.display().to_string().as_bytes(), &outside_mount())
            .unwrap();

        let bytes = registry.serialize_as_format_data_response().unwrap();
        assert_eq!(bytes.len(), 8 + 4 + FileDescriptor::SIZE + 4);
        assert_eq!(&bytes[4..8], &(FileDescriptor::SIZE as u32 + 4).to_le_bytes());
        // size low word of the single record
        assert_eq!(&bytes[12 + 68..12 + 72], &5u32.to_le_bytes());
    }
}
