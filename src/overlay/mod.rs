mod convert;
pub mod handles;
mod inodes;
pub mod materialize;
pub mod mount;
pub mod ops;
pub mod paths;
pub mod readdir;
pub mod redirect;
pub mod tombstone;

pub use mount::{is_mounted_with_type, mount_overlay};
pub use ops::{OpResult, Overlay};
pub use redirect::{MaterializationState, Redirector};

use convert::metadata_to_fileattr;
use handles::READ_BUFFER;
use inodes::InodeTable;

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyIoctl, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite,
    ReplyXattr, Request, TimeOrNow,
};
use parking_lot::RwLock;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::LayerConfig;
use paths::child_logical;

/// Attribute, entry and negative lookups are never cached by the kernel, so a
/// copy-up is visible to the very next request.
const TTL: Duration = Duration::ZERO;

/// `fuser` front end: maps kernel inode numbers to logical paths and hands
/// every request to the [`Overlay`].
pub struct DebloatedFs {
    overlay: Overlay,
    inodes: RwLock<InodeTable>,
}

impl DebloatedFs {
    pub fn new(config: Arc<LayerConfig>) -> Self {
        DebloatedFs {
            overlay: Overlay::new(config),
            inodes: RwLock::new(InodeTable::new()),
        }
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf, libc::c_int> {
        self.inodes.read().path(ino).ok_or_else(|| {
            tracing::warn!("inode {} not found", ino);
            libc::ENOENT
        })
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf, libc::c_int> {
        Ok(child_logical(&self.path_of(parent)?, name))
    }

    /// Stat `logical` and register it with the kernel.
    fn entry(&self, logical: &Path, fh: Option<u64>) -> Result<FileAttr, libc::c_int> {
        let meta = self.overlay.getattr(logical, fh)?;
        let ino = self.inodes.write().lookup(logical);
        Ok(metadata_to_fileattr(&meta, ino))
    }

    fn attr(&self, ino: u64, fh: Option<u64>) -> Result<FileAttr, libc::c_int> {
        let path = self.path_of(ino)?;
        let meta = self.overlay.getattr(&path, fh)?;
        Ok(metadata_to_fileattr(&meta, ino))
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_setattr(
        &self,
        path: &Path,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> Result<(), libc::c_int> {
        if let Some(mode) = mode {
            self.overlay.chmod(path, mode, fh)?;
        }
        if uid.is_some() || gid.is_some() {
            self.overlay.chown(path, uid, gid, fh)?;
        }
        if let Some(size) = size {
            self.overlay.truncate(path, size, fh)?;
        }
        if atime.is_some() || mtime.is_some() {
            self.overlay.utimens(path, atime, mtime, fh)?;
        }
        Ok(())
    }
}

impl Filesystem for DebloatedFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        let config = self.overlay.redirector().config();
        tracing::info!(
            "debloated_fs initialized (origin={}, cache={}); attribute and entry caching disabled",
            config.origin_root.display(),
            config.cache_root.display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!(
            "debloated_fs destroyed after materializing {} objects",
            self.overlay.redirector().materialization_count()
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        match self
            .child_of(parent, name)
            .and_then(|path| self.entry(&path, None))
        {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request, ino: u64, nlookup: u64) {
        self.inodes.write().forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        match self.attr(ino, fh) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = self.path_of(ino).and_then(|path| {
            self.apply_setattr(&path, mode, uid, gid, size, atime, mtime, fh)?;
            self.attr(ino, fh)
        });
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.readlink(&path))
        {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(errno) => reply.error(errno),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.overlay
                .mknod(&path, mode & !(umask & 0o7777), rdev as u64)?;
            self.entry(&path, None)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.overlay.mkdir(&path, mode & !umask)?;
            self.entry(&path, None)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.overlay.unlink(&path)?;
            self.inodes.write().unlink(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_of(parent, name).and_then(|path| {
            self.overlay.rmdir(&path)?;
            self.inodes.write().unlink(&path);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, link_name).and_then(|path| {
            self.overlay.symlink(target, &path)?;
            self.entry(&path, None)
        });
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn rename(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<(), libc::c_int> {
            let from = self.child_of(parent, name)?;
            let to = self.child_of(newparent, newname)?;
            self.overlay.rename(&from, &to, flags)?;
            self.inodes.write().rename(&from, &to);
            Ok(())
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = (|| -> Result<FileAttr, libc::c_int> {
            let from = self.path_of(ino)?;
            let to = self.child_of(newparent, newname)?;
            self.overlay.link(&from, &to)?;
            self.entry(&to, None)
        })();
        match result {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.open(&path, flags))
        {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(errno) => return reply.error(errno),
        };
        READ_BUFFER.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.resize(size as usize, 0);
            match self
                .overlay
                .read(&path, Some(fh), &mut buf[..], offset.max(0) as u64)
            {
                Ok(n) => reply.data(&buf[..n]),
                Err(errno) => reply.error(errno),
            }
        });
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.path_of(ino).and_then(|path| {
            self.overlay
                .write(&path, Some(fh), data, offset.max(0) as u64)
        }) {
            Ok(n) => reply.written(n as u32),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.overlay.flush(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Err(errno) = self.overlay.release(fh) {
            tracing::debug!("release: handle {} not open (errno {})", fh, errno);
        }
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.overlay.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.path_of(ino).and_then(|path| self.overlay.opendir(&path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self
            .overlay
            .readdir(fh, offset.max(0) as usize, |entry, next| {
                reply.add(entry.ino, next as i64, entry.kind, &entry.name)
            });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        if let Err(errno) = self.overlay.releasedir(fh) {
            tracing::debug!("releasedir: handle {} not open (errno {})", fh, errno);
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        match self.path_of(ino).and_then(|path| self.overlay.statfs(&path)) {
            Ok(st) => reply.statfs(
                st.blocks() as u64,
                st.blocks_free() as u64,
                st.blocks_available() as u64,
                st.files() as u64,
                st.files_free() as u64,
                st.block_size() as u32,
                st.name_max() as u32,
                st.fragment_size() as u32,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.setxattr(&path, name, value))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn getxattr(&mut self, _req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.getxattr(&path, name))
        {
            Ok(value) if size == 0 => reply.size(value.len() as u32),
            Ok(value) if value.len() > size as usize => reply.error(libc::ERANGE),
            Ok(value) => reply.data(&value),
            Err(errno) => reply.error(errno),
        }
    }

    fn listxattr(&mut self, _req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.listxattr(&path))
        {
            Ok(names) if size == 0 => reply.size(names.len() as u32),
            Ok(names) if names.len() > size as usize => reply.error(libc::ERANGE),
            Ok(names) => reply.data(&names),
            Err(errno) => reply.error(errno),
        }
    }

    fn removexattr(&mut self, _req: &Request, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.removexattr(&path, name))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn access(&mut self, _req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.access(&path, mask))
        {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn create(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = self.child_of(parent, name).and_then(|path| {
            let fh = self.overlay.create(&path, mode & !umask, flags)?;
            match self.entry(&path, Some(fh)) {
                Ok(attr) => Ok((attr, fh)),
                Err(errno) => {
                    let _ = self.overlay.release(fh);
                    Err(errno)
                }
            }
        });
        match result {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn ioctl(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: u32,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
        reply: ReplyIoctl,
    ) {
        match self
            .path_of(ino)
            .and_then(|path| self.overlay.ioctl(&path, Some(fh), cmd, in_data, out_size))
        {
            Ok((ret, data)) => reply.ioctl(ret, &data),
            Err(errno) => reply.error(errno),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        match self.overlay.lseek(fh, offset, whence) {
            Ok(pos) => reply.offset(pos),
            Err(errno) => reply.error(errno),
        }
    }
}
