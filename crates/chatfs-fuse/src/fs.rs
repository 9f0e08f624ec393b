//! `fuser::Filesystem` binding: translates kernel callbacks into calls
//! against [`crate::engine::Engine`], resolving inodes to paths via
//! [`crate::inode::InodeTable`] and bridging sync-to-async through
//! [`crate::async_bridge`].
//!
//! Everything the kernel needs beyond a plain file-op result (attributes,
//! directory entries, open flags) is assembled here; `Engine` itself stays
//! ignorant of FUSE's vocabulary.

use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chatfs_core::{FileRecord, VirtualPath};
use chatfs_mount::AdapterError;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::async_bridge::{self, BridgeStats};
use crate::engine::{Engine, OpenMode};
use crate::inode::{InodeTable, ROOT_INODE};

const BLOCK_SIZE: u32 = 4096;
const DEFAULT_FILE_PERM: u16 = 0o644;
const DEFAULT_DIR_PERM: u16 = 0o755;
const ATTR_TTL: Duration = Duration::from_secs(1);
const BRIDGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Binds [`Engine`] to the kernel via `fuser`. One instance per mount.
pub struct ChatFilesystem {
    engine: Arc<Engine>,
    inodes: InodeTable,
    bridge_stats: Arc<BridgeStats>,
    uid: u32,
    gid: u32,
    // Runtime must outlive every in-flight bridged call; field order keeps
    // it alive until after `engine`/`inodes` are dropped.
    handle: Handle,
    _owned_runtime: Option<tokio::runtime::Runtime>,
}

impl ChatFilesystem {
    /// Mounts against an already-running Tokio runtime (e.g. the CLI's
    /// `#[tokio::main]` executor).
    #[must_use]
    pub fn new(engine: Arc<Engine>, handle: Handle, uid: u32, gid: u32) -> Self {
        Self {
            engine,
            inodes: InodeTable::new(),
            bridge_stats: BridgeStats::new(),
            uid,
            gid,
            handle,
            _owned_runtime: None,
        }
    }

    /// Spins up a dedicated multi-thread runtime for the engine's async
    /// calls; used by the standalone `chatfsmount` binary, which has no
    /// ambient async context of its own.
    pub fn with_owned_runtime(engine: Arc<Engine>, uid: u32, gid: u32) -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
        let handle = rt.handle().clone();
        Ok(Self { engine, inodes: InodeTable::new(), bridge_stats: BridgeStats::new(), uid, gid, handle, _owned_runtime: Some(rt) })
    }

    #[must_use]
    pub fn bridge_stats(&self) -> &BridgeStats {
        &self.bridge_stats
    }

    fn exec<F, T>(&self, future: F) -> Result<T, i32>
    where
        F: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        async_bridge::execute(&self.handle, BRIDGE_TIMEOUT, Some(&self.bridge_stats), future)
            .map_err(|e| e.to_errno())
    }

    fn path_for(&self, inode: u64) -> Result<VirtualPath, i32> {
        self.inodes.path_for(inode).ok_or(libc::ENOENT)
    }

    fn attr_for(&self, inode: u64, record: &FileRecord) -> FileAttr {
        let mtime = system_time_from(record.modified_at);
        if record.is_directory {
            self.make_dir_attr(inode, mtime)
        } else {
            self.make_file_attr(inode, record.size_bytes, mtime)
        }
    }

    fn make_dir_attr(&self, inode: u64, mtime: SystemTime) -> FileAttr {
        FileAttr {
            ino: inode,
            size: 0,
            blocks: 0,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::Directory,
            perm: DEFAULT_DIR_PERM,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn make_file_attr(&self, inode: u64, size: u64, mtime: SystemTime) -> FileAttr {
        FileAttr {
            ino: inode,
            size,
            blocks: size.div_ceil(u64::from(BLOCK_SIZE)),
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind: FileType::RegularFile,
            perm: DEFAULT_FILE_PERM,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }
}

fn system_time_from(at: chrono::DateTime<chrono::Utc>) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(u64::try_from(at.timestamp_millis()).unwrap_or(0))
}

impl Filesystem for ChatFilesystem {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), libc::c_int> {
        debug!("mounted");
        config.add_capabilities(fuser::consts::FUSE_ASYNC_READ).ok();
        if let Err(e) = config.set_max_background(32) {
            warn!(error = %e, "failed to raise max_background, continuing with the default");
        }
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("unmounted");
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Ok(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = parent_path.join(name);

        match self.engine.get_file_info(&path) {
            Ok(record) => {
                let inode = self.inodes.get_or_insert(&path);
                reply.entry(&ATTR_TTL, &self.attr_for(inode, &record), 0);
            }
            Err(AdapterError::NotFound) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Ok(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.get_file_info(&path) {
            Ok(record) => reply.attr(&ATTR_TTL, &self.attr_for(ino, &record)),
            Err(AdapterError::NotFound) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Attribute setters beyond truncate-to-zero are accepted as no-ops:
        // the chat-backed store has no notion of permissions, ownership, or
        // separate a/m/ctimes to persist. Truncation is handled by open()'s
        // Truncate disposition; a bare setattr(size) with no open fd is rare
        // enough (ftruncate after lseek) that reporting success without
        // effect is the pragmatic choice here.
        let Ok(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.get_file_info(&path) {
            Ok(record) => {
                let mut record = record;
                if let Some(size) = size {
                    record.size_bytes = size;
                }
                reply.attr(&ATTR_TTL, &self.attr_for(ino, &record));
            }
            Err(AdapterError::NotFound) => reply.error(libc::ENOENT),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn mkdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let Ok(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = parent_path.join(name);
        match self.engine.mkdir(&path) {
            Ok(()) => {
                let inode = self.inodes.get_or_insert(&path);
                let now = chrono::Utc::now();
                let attr = self.make_dir_attr(inode, system_time_from(now));
                reply.entry(&ATTR_TTL, &attr, 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = parent_path.join(name);
        match self.engine.delete_directory(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Ok(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = parent_path.join(name);
        match self.engine.delete_file(&path) {
            Ok(()) => {
                self.inodes.remove(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Ok(parent_path), Ok(newparent_path)) = (self.path_for(parent), self.path_for(newparent)) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(libc::EINVAL);
            return;
        };
        let from = parent_path.join(name);
        let to = newparent_path.join(newname);
        // RENAME_NOREPLACE (libc::RENAME_NOREPLACE) is the only rename flag
        // this store distinguishes; RENAME_EXCHANGE has no atomic equivalent
        // over the remote object store and is rejected.
        if flags & libc::RENAME_EXCHANGE as u32 != 0 {
            reply.error(libc::ENOTSUP);
            return;
        }
        let replace = flags & libc::RENAME_NOREPLACE as u32 == 0;
        match self.engine.move_path(&from, &to, replace) {
            Ok(()) => {
                self.inodes.rename(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Ok(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mode = if flags & libc::O_APPEND != 0 {
            OpenMode::Append
        } else if flags & libc::O_TRUNC != 0 {
            OpenMode::Truncate
        } else {
            OpenMode::Open
        };
        let engine = Arc::clone(&self.engine);
        let fut = async move { engine.open_or_create(&path, mode).await };
        match self.exec(fut) {
            Ok(Ok(_outcome)) => reply.opened(0, 0),
            Ok(Err(e)) => reply.error(e.to_errno()),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Ok(parent_path) = self.path_for(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let path = parent_path.join(name);
        let mode = if flags & libc::O_EXCL != 0 { OpenMode::CreateNew } else { OpenMode::Create };

        let engine = Arc::clone(&self.engine);
        let fut = { let path = path.clone(); async move { engine.open_or_create(&path, mode).await } };
        match self.exec(fut) {
            Ok(Ok(_outcome)) => {
                let inode = self.inodes.get_or_insert(&path);
                let now = chrono::Utc::now();
                let attr = self.make_file_attr(inode, 0, system_time_from(now));
                reply.created(&ATTR_TTL, &attr, 0, 0, 0);
            }
            Ok(Err(e)) => reply.error(e.to_errno()),
            Err(errno) => reply.error(errno),
        }
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
        let Ok(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let engine = Arc::clone(&self.engine);
        #[allow(clippy::cast_sign_loss)]
        let fut = async move { engine.read(&path, offset as u64, size as usize).await };
        match self.exec(fut) {
            Ok(Ok(bytes)) => reply.data(&bytes),
            Ok(Err(e)) => reply.error(e.to_errno()),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        match self.engine.write(&path, offset as u64, data) {
            Ok(written) => reply.written(written as u32),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Ok(path) = self.path_for(ino) {
            self.engine.cleanup(&path);
        }
        reply.ok();
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        // Nothing to flush ahead of release(): writes only leave memory on
        // close, and there is no file-handle-scoped dirty state to sync
        // early per the spec's close-time upload design.
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Ok(dir_path) = self.path_for(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let entries = match self.engine.list(&dir_path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let mut rows: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (self.inodes.inode_for(&dir_path.parent().unwrap_or_else(VirtualPath::root)).unwrap_or(ROOT_INODE), FileType::Directory, "..".to_string()),
        ];
        for record in &entries {
            let child_path = dir_path.join(&record.file_name);
            let child_inode = self.inodes.get_or_insert(&child_path);
            let kind = if record.is_directory { FileType::Directory } else { FileType::RegularFile };
            rows.push((child_inode, kind, record.file_name.clone()));
        }

        for (i, (inode, kind, name)) in rows.into_iter().enumerate().skip(offset.max(0) as usize) {
            let next_offset = i as i64 + 1;
            if reply.add(inode, next_offset, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let info = self.engine.volume_info();
        let bsize = BLOCK_SIZE;
        let blocks = info.total_bytes / u64::from(bsize);
        let bfree = info.free_bytes / u64::from(bsize);
        reply.statfs(blocks, bfree, bfree, 0, 0, bsize, 255, bsize);
    }

    // The remainder of the Dokan-shaped callback surface has no meaningful
    // semantics against a chat-backed store (symlinks, hard links, locking,
    // xattrs): each is rejected with the closest POSIX errno rather than
    // silently succeeding, so callers see a real failure instead of a
    // no-op masquerading as success.

    fn symlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, _link: &std::path::Path, reply: ReplyEntry) {
        reply.error(libc::ENOTSUP);
    }

    fn link(&mut self, _req: &Request<'_>, _ino: u64, _newparent: u64, _newname: &OsStr, reply: ReplyEntry) {
        // git and a few other tools try a hard link first and fall back to
        // copying; ENOSYS rather than ENOTSUP matches that expected flow.
        reply.error(libc::ENOSYS);
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyData) {
        reply.error(libc::EINVAL);
    }

    fn getxattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, _size: u32, reply: fuser::ReplyXattr) {
        reply.error(libc::ENOTSUP);
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOTSUP);
    }
}
