//! FUSE-based Transfer Mount
//!
//! Read-only virtual directory exposing the files of the last peer file
//! list. Entries appear when a peer FormatDataResponse is ingested; their
//! contents are fetched from the peer on demand.
//!
//! # Architecture
//!
//! ```text
//! Peer file list -> add_directory_entry(name, key) -> virtual file
//! Local read()   -> MountRequest::Range -> session -> FileContentsRequest -> peer
//! Peer response  -> deliver_range_result(stream_id) -> read() returns
//! ```
//!
//! # Sync/Async Bridge
//!
//! FUSE callbacks are synchronous and run on the FUSE background thread.
//! Each fetch allocates a fresh stream id, parks a oneshot sender under it
//! and blocks on the receiver until the session owner delivers the result
//! (or the directory is cleared, which drops every pending sender).

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry,
    ReplyOpen, Request,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

use crate::clipboard::backend::TransferFs;
use crate::clipboard::error::{ClipboardError, Result};
use crate::config::TransferConfig;

// =============================================================================
// Constants
// =============================================================================

/// Root directory inode (standard FUSE convention)
const ROOT_INODE: u64 = 1;

/// First available inode for files (after root)
const FIRST_FILE_INODE: u64 = 2;

/// Attribute TTL, entries are ephemeral
const TTL: Duration = Duration::from_secs(1);

/// Filesystem name shown in the mount table
const FS_NAME: &str = "lamco-clipboard";

/// Queue depth between FUSE callbacks and the session owner
const REQUEST_QUEUE_DEPTH: usize = 16;

// =============================================================================
// Requests to the session owner
// =============================================================================

/// Content the transfer mount needs from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountRequest {
    /// Size of the file announced under `key`
    Size {
        /// Stream id the answer must carry
        stream_id: u32,
        /// Wire list index
        key: u32,
    },
    /// Bytes of the file announced under `key`
    Range {
        /// Stream id the answer must carry
        stream_id: u32,
        /// Wire list index
        key: u32,
        /// Byte offset
        offset: u32,
        /// Bytes wanted
        length: u32,
    },
}

impl MountRequest {
    /// Stream id the answer must carry
    pub fn stream_id(&self) -> u32 {
        match self {
            Self::Size { stream_id, .. } | Self::Range { stream_id, .. } => *stream_id,
        }
    }
}

#[derive(Debug)]
enum MountReply {
    Size(u64),
    Data(Vec<u8>),
    Failed,
}

// =============================================================================
// Virtual File Entry
// =============================================================================

/// Entries are owned by the mounting user
fn owner() -> (u32, u32) {
    // SAFETY: getuid and getgid have no preconditions and cannot fail
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[derive(Debug, Clone)]
struct VirtualFile {
    inode: u64,
    name: String,
    size: u64,
    key: u32,
    created: SystemTime,
}

impl VirtualFile {
    fn to_attr(&self) -> FileAttr {
        let now = self.created;
        let (uid, gid) = owner();
        FileAttr {
            ino: self.inode,
            size: self.size,
            blocks: self.size.div_ceil(512),
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::RegularFile,
            perm: 0o444,
            nlink: 1,
            uid,
            gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

fn root_attr() -> FileAttr {
    let now = SystemTime::now();
    let (uid, gid) = owner();
    FileAttr {
        ino: ROOT_INODE,
        size: 0,
        blocks: 0,
        atime: now,
        mtime: now,
        ctime: now,
        crtime: now,
        kind: FileType::Directory,
        perm: 0o555,
        nlink: 2,
        uid,
        gid,
        rdev: 0,
        blksize: 512,
        flags: 0,
    }
}

// =============================================================================
// Shared state
// =============================================================================

/// State shared between the FUSE thread and the session side
struct MountState {
    files: RwLock<HashMap<u64, VirtualFile>>,
    name_to_inode: RwLock<HashMap<String, u64>>,
    next_inode: AtomicU64,
    next_stream_id: AtomicU32,
    pending: Mutex<HashMap<u32, oneshot::Sender<MountReply>>>,
    request_tx: mpsc::Sender<MountRequest>,
}

impl MountState {
    fn new(request_tx: mpsc::Sender<MountRequest>) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            name_to_inode: RwLock::new(HashMap::new()),
            next_inode: AtomicU64::new(FIRST_FILE_INODE),
            next_stream_id: AtomicU32::new(1),
            pending: Mutex::new(HashMap::new()),
            request_tx,
        }
    }

    fn file(&self, inode: u64) -> Option<VirtualFile> {
        self.files.read().get(&inode).cloned()
    }

    /// Queue a request and block until it is answered
    ///
    /// Must not be called from inside the tokio runtime.
    fn fetch(&self, build: impl FnOnce(u32) -> MountRequest) -> Option<MountReply> {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().insert(stream_id, reply_tx);

        if self.request_tx.blocking_send(build(stream_id)).is_err() {
            error!("Transfer mount request queue closed");
            self.pending.lock().remove(&stream_id);
            return None;
        }

        match reply_rx.blocking_recv() {
            Ok(reply) => Some(reply),
            Err(_) => {
                debug!("Stream {} abandoned", stream_id);
                None
            }
        }
    }

    fn complete(&self, stream_id: u32, reply: MountReply) {
        match self.pending.lock().remove(&stream_id) {
            Some(reply_tx) => {
                let _ = reply_tx.send(reply);
            }
            None => debug!("No reader waiting on stream {}", stream_id),
        }
    }

    fn clear(&self) {
        let mut files = self.files.write();
        let mut names = self.name_to_inode.write();
        files.clear();
        names.clear();
        self.next_inode.store(FIRST_FILE_INODE, Ordering::SeqCst);
        // Dropping the senders releases blocked readers with EIO
        self.pending.lock().clear();
    }
}

// =============================================================================
// FUSE Filesystem Implementation
// =============================================================================

struct TransferFsHandler {
    state: Arc<MountState>,
}

impl Filesystem for TransferFsHandler {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }

        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };

        let inode = self.state.name_to_inode.read().get(name).copied();
        match inode.and_then(|inode| self.state.file(inode)) {
            Some(file) => {
                trace!("lookup: found '{}' -> inode {}", name, file.inode);
                reply.entry(&TTL, &file.to_attr(), 0);
            }
            None => {
                trace!("lookup: '{}' not found", name);
                reply.error(libc::ENOENT);
            }
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INODE {
            reply.attr(&TTL, &root_attr());
            return;
        }

        match self.state.file(ino) {
            Some(file) => reply.attr(&TTL, &file.to_attr()),
            None => reply.error(libc::ENOENT),
        }
    }

    /// Entries announced without a size get it from the peer before reading
    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if flags & libc::O_WRONLY != 0 || flags & libc::O_RDWR != 0 {
            reply.error(libc::EACCES);
            return;
        }

        let Some(file) = self.state.file(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        if file.size == 0 {
            let key = file.key;
            match self.state.fetch(|stream_id| MountRequest::Size { stream_id, key }) {
                Some(MountReply::Size(size)) => {
                    debug!("Peer reports '{}' is {} bytes", file.name, size);
                    if let Some(entry) = self.state.files.write().get_mut(&ino) {
                        entry.size = size;
                    }
                }
                _ => {
                    warn!("Could not fetch size of '{}'", file.name);
                    reply.error(libc::EIO);
                    return;
                }
            }
        }

        reply.opened(ino, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(file) = self.state.file(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let offset = offset.max(0) as u64;
        if offset >= file.size {
            reply.data(&[]);
            return;
        }
        let Ok(wire_offset) = u32::try_from(offset) else {
            reply.error(libc::EFBIG);
            return;
        };

        let length = size.min((file.size - offset).min(u64::from(u32::MAX)) as u32);
        debug!(
            "FUSE read: file='{}' offset={} size={} (key={})",
            file.name, offset, length, file.key
        );

        let key = file.key;
        let fetched = self.state.fetch(|stream_id| MountRequest::Range {
            stream_id,
            key,
            offset: wire_offset,
            length,
        });
        match fetched {
            Some(MountReply::Data(data)) => {
                trace!("FUSE read: received {} bytes", data.len());
                reply.data(&data);
            }
            _ => {
                error!("FUSE read of '{}' failed", file.name);
                reply.error(libc::EIO);
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INODE {
            reply.error(libc::ENOTDIR);
            return;
        }

        let files = self.state.files.read();
        let mut listed: Vec<&VirtualFile> = files.values().collect();
        listed.sort_by_key(|file| file.inode);

        let entries = [
            (ROOT_INODE, FileType::Directory, "."),
            (ROOT_INODE, FileType::Directory, ".."),
        ]
        .into_iter()
        .chain(
            listed
                .iter()
                .map(|file| (file.inode, FileType::RegularFile, file.name.as_str())),
        );

        for (i, (inode, file_type, name)) in entries.enumerate().skip(offset.max(0) as usize) {
            // true means the reply buffer is full
            if reply.add(inode, (i + 1) as i64, file_type, name) {
                break;
            }
        }

        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if ino == ROOT_INODE {
            reply.opened(0, 0);
        } else {
            reply.error(libc::ENOTDIR);
        }
    }
}

// =============================================================================
// Transfer Mount
// =============================================================================

/// Wrapper for BackgroundSession that implements Send + Sync
///
/// fuser::BackgroundSession is a handle to the FUSE background thread but
/// does not implement Send + Sync because it holds raw pointers.
struct SendableSession(#[allow(dead_code)] fuser::BackgroundSession);

// SAFETY: the background thread owns all libfuse state. The handle only
// holds a JoinHandle and the unmount guard, both safe to move and share.
unsafe impl Send for SendableSession {}
unsafe impl Sync for SendableSession {}

/// FUSE implementation of [`TransferFs`]
pub struct FuseTransferMount {
    mount_point: PathBuf,
    session: Option<SendableSession>,
    state: Arc<MountState>,
}

impl std::fmt::Debug for FuseTransferMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseTransferMount")
            .field("mount_point", &self.mount_point)
            .field("mounted", &self.session.is_some())
            .finish()
    }
}

impl FuseTransferMount {
    /// Create an unmounted transfer mount at `mount_point`
    ///
    /// The receiver yields the peer requests FUSE readers are waiting on;
    /// the session owner drains it into
    /// [`FileTransferSession::handle_mount_request`](crate::clipboard::FileTransferSession::handle_mount_request).
    pub fn new(mount_point: PathBuf) -> (Self, mpsc::Receiver<MountRequest>) {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let mount = Self {
            mount_point,
            session: None,
            state: Arc::new(MountState::new(request_tx)),
        };
        (mount, request_rx)
    }

    /// Transfer mount at the configured (or default) mount point
    pub fn from_config(config: &TransferConfig) -> (Self, mpsc::Receiver<MountRequest>) {
        Self::new(config.resolved_mount_point())
    }

    /// Mount the FUSE filesystem
    ///
    /// Tries to mount with `allow_other` first (allows file managers to access),
    /// falls back to user-only mount if that fails (requires /etc/fuse.conf config).
    pub fn mount(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.mount_point)
            .map_err(|e| ClipboardError::file_io(&self.mount_point, e))?;

        info!("Mounting clipboard transfer filesystem at {:?}", self.mount_point);

        let handler = || TransferFsHandler {
            state: Arc::clone(&self.state),
        };

        let options_with_allow_other = [
            MountOption::RO,
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::AllowOther,
            MountOption::AutoUnmount,
        ];

        match fuser::spawn_mount2(handler(), &self.mount_point, &options_with_allow_other) {
            Ok(session) => {
                self.session = Some(SendableSession(session));
                info!("Transfer filesystem mounted (allow_other enabled)");
                return Ok(());
            }
            Err(e) => {
                debug!("FUSE mount with allow_other failed ({}), retrying without it", e);
            }
        }

        let options_user_only = [
            MountOption::RO,
            MountOption::FSName(FS_NAME.to_string()),
            MountOption::AutoUnmount,
        ];

        let session = fuser::spawn_mount2(handler(), &self.mount_point, &options_user_only)
            .map_err(|e| ClipboardError::Mount(format!("Failed to mount FUSE: {}", e)))?;

        self.session = Some(SendableSession(session));
        info!("Transfer filesystem mounted (user-only mode)");
        Ok(())
    }

    /// Unmount the FUSE filesystem
    pub fn unmount(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Unmounting clipboard transfer filesystem");
            drop(session); // BackgroundSession unmounts on drop
            // May fail if something else lives there
            let _ = std::fs::remove_dir(&self.mount_point);
        }
    }

    /// Whether the filesystem is mounted
    pub fn is_mounted(&self) -> bool {
        self.session.is_some()
    }

    /// Mount point path
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Number of entries in the transfer directory
    pub fn file_count(&self) -> usize {
        self.state.files.read().len()
    }
}

impl Drop for FuseTransferMount {
    fn drop(&mut self) {
        self.unmount();
    }
}

impl TransferFs for FuseTransferMount {
    fn path_is_inside_transfer_mount(&self, path: &Path) -> bool {
        path.starts_with(&self.mount_point)
    }

    fn clear_directory(&self) {
        self.state.clear();
        debug!("Cleared transfer directory");
    }

    fn add_directory_entry(&self, name: &str, is_dir: bool, size: u64, key: u32) -> Result<()> {
        let rejected = |reason| ClipboardError::EntryRejected {
            name: name.to_string(),
            reason,
        };

        if is_dir {
            return Err(rejected("directories are not supported"));
        }
        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(rejected("invalid file name"));
        }

        let mut files = self.state.files.write();
        let mut names = self.state.name_to_inode.write();
        if names.contains_key(name) {
            return Err(rejected("duplicate file name"));
        }

        let inode = self.state.next_inode.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Adding virtual file: '{}' size={} inode={} key={}",
            name, size, inode, key
        );
        files.insert(
            inode,
            VirtualFile {
                inode,
                name: name.to_string(),
                size,
                key,
                created: SystemTime::now(),
            },
        );
        names.insert(name.to_string(), inode);
        Ok(())
    }

    fn deliver_size_result(&self, stream_id: u32, size: u64) {
        self.state.complete(stream_id, MountReply::Size(size));
    }

    fn deliver_range_result(&self, stream_id: u32, data: &[u8]) {
        self.state.complete(stream_id, MountReply::Data(data.to_vec()));
    }

    fn deliver_failure(&self, stream_id: u32) {
        self.state.complete(stream_id, MountReply::Failed);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mount() -> (FuseTransferMount, mpsc::Receiver<MountRequest>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (mount, rx) = FuseTransferMount::new(dir.path().join("xfer"));
        (mount, rx, dir)
    }

    #[test]
    fn test_path_is_inside_mount() {
        let (mount, _rx, _dir) = mount();
        let inside = mount.mount_point().join("a.txt");
        assert!(mount.path_is_inside_transfer_mount(&inside));
        assert!(mount.path_is_inside_transfer_mount(mount.mount_point()));
        assert!(!mount.path_is_inside_transfer_mount(Path::new("/etc/passwd")));

        // Prefix match is per component
        let sibling = PathBuf::from(format!("{}-other/a.txt", mount.mount_point().display()));
        assert!(!mount.path_is_inside_transfer_mount(&sibling));
    }

    #[test]
    fn test_add_and_clear_entries() {
        let (mount, _rx, _dir) = mount();
        mount.add_directory_entry("a.txt", false, 10, 0).unwrap();
        mount.add_directory_entry("c.txt", false, 30, 3).unwrap();
        assert_eq!(mount.file_count(), 2);

        let inode = mount.state.name_to_inode.read()["c.txt"];
        let file = mount.state.file(inode).unwrap();
        assert_eq!(file.key, 3);
        assert_eq!(file.to_attr().size, 30);
        assert_eq!(file.to_attr().perm, 0o444);

        mount.clear_directory();
        assert_eq!(mount.file_count(), 0);
        assert_eq!(mount.state.next_inode.load(Ordering::SeqCst), FIRST_FILE_INODE);
    }

    #[test]
    fn test_rejected_entries() {
        let (mount, _rx, _dir) = mount();
        mount.add_directory_entry("a.txt", false, 1, 0).unwrap();

        for (name, is_dir) in [("a.txt", false), ("dir", true), ("", false), ("x/y", false)] {
            let err = mount.add_directory_entry(name, is_dir, 1, 1).unwrap_err();
            assert!(matches!(err, ClipboardError::EntryRejected { .. }));
        }
        assert_eq!(mount.file_count(), 1);
    }

    #[test]
    fn test_reader_released_by_range_result() {
        let (mount, mut rx, _dir) = mount();
        let state = Arc::clone(&mount.state);

        let reader = std::thread::spawn(move || {
            state.fetch(|stream_id| MountRequest::Range {
                stream_id,
                key: 4,
                offset: 0,
                length: 3,
            })
        });

        let request = rx.blocking_recv().unwrap();
        assert!(matches!(request, MountRequest::Range { key: 4, length: 3, .. }));
        mount.deliver_range_result(request.stream_id(), b"abc");

        match reader.join().unwrap() {
            Some(MountReply::Data(data)) => assert_eq!(data, b"abc"),
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_released_by_failure_and_clear() {
        let (mount, mut rx, _dir) = mount();

        let state = Arc::clone(&mount.state);
        let reader = std::thread::spawn(move || {
            state.fetch(|stream_id| MountRequest::Size { stream_id, key: 0 })
        });
        let request = rx.blocking_recv().unwrap();
        mount.deliver_failure(request.stream_id());
        assert!(matches!(reader.join().unwrap(), Some(MountReply::Failed)));

        let state = Arc::clone(&mount.state);
        let reader = std::thread::spawn(move || {
            state.fetch(|stream_id| MountRequest::Size { stream_id, key: 0 })
        });
        rx.blocking_recv().unwrap();
        mount.clear_directory();
        assert!(reader.join().unwrap().is_none());
    }

    #[test]
    fn test_entries_owned_by_mounting_user() {
        let (mount, _rx, _dir) = mount();
        mount.add_directory_entry("a.txt", false, 1, 0).unwrap();
        let inode = mount.state.name_to_inode.read()["a.txt"];
        let attr = mount.state.file(inode).unwrap().to_attr();
        assert_eq!((attr.uid, attr.gid), owner());
        assert_eq!((root_attr().uid, root_attr().gid), owner());
    }

    #[test]
    fn test_stray_delivery_is_ignored() {
        let (mount, _rx, _dir) = mount();
        mount.deliver_size_result(999, 10);
        assert!(mount.state.pending.lock().is_empty());
    }
}
