//! Path-based operation handlers.
//!
//! Every handler takes logical paths, runs them through the [`Redirector`],
//! performs the host call on the resulting physical path and forwards the host
//! errno unchanged. Handlers that accept a file handle use it in preference to
//! the path.

use fuser::TimeOrNow;
use nix::sys::stat::{utimensat, Mode, SFlag, UtimensatFlags};
use nix::sys::statvfs::Statvfs;
use nix::sys::time::TimeSpec;
use nix::unistd::AccessFlags;
use std::ffi::OsStr;
use std::fs::{self, DirBuilder, File, FileTimes, Metadata, OpenOptions, Permissions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

use crate::config::LayerConfig;
use crate::overlay::convert::io_error_to_libc;
use crate::overlay::handles::{DirHandle, FileHandle, HandleTable};
use crate::overlay::paths::{normalize_logical, path_exists};
use crate::overlay::readdir::{is_internal_name, is_logically_empty, DirEntry, DirStream};
use crate::overlay::redirect::Redirector;
use crate::overlay::tombstone::Tombstone;

/// Result of an operation handler: the value, or the errno to report.
pub type OpResult<T> = std::result::Result<T, libc::c_int>;

fn errno(e: io::Error) -> libc::c_int {
    io_error_to_libc(&e)
}

fn nix_errno(e: nix::Error) -> libc::c_int {
    e as libc::c_int
}

/// Translate open(2) flags into `OpenOptions`. Creation flags are handled by
/// the caller.
fn open_options(flags: i32) -> OpenOptions {
    let mut options = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            options.write(true);
        }
        libc::O_RDWR => {
            options.read(true).write(true);
        }
        _ => {
            options.read(true);
        }
    }
    options.custom_flags(flags & !(libc::O_ACCMODE | libc::O_CREAT | libc::O_EXCL));
    options
}

fn time_spec(time: Option<TimeOrNow>) -> TimeSpec {
    let raw = |nsec| {
        TimeSpec::from(libc::timespec {
            tv_sec: 0,
            tv_nsec: nsec,
        })
    };
    match time {
        None => raw(libc::UTIME_OMIT),
        Some(TimeOrNow::Now) => raw(libc::UTIME_NOW),
        Some(TimeOrNow::SpecificTime(t)) => {
            TimeSpec::from(t.duration_since(UNIX_EPOCH).unwrap_or_default())
        }
    }
}

fn system_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::Now => SystemTime::now(),
        TimeOrNow::SpecificTime(t) => t,
    }
}

/// The overlay engine: redirection plus every filesystem operation.
pub struct Overlay {
    redirector: Arc<Redirector>,
    files: HandleTable<FileHandle>,
    dirs: HandleTable<DirHandle>,
}

impl Overlay {
    pub fn new(config: Arc<LayerConfig>) -> Self {
        Overlay {
            redirector: Arc::new(Redirector::new(config)),
            files: HandleTable::new(),
            dirs: HandleTable::new(),
        }
    }

    pub fn redirector(&self) -> &Redirector {
        &self.redirector
    }

    /// Number of currently open file and directory handles.
    pub fn open_handles(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    /// Physical path for an existing-object operation. Bookkeeping names in
    /// the cache layer are not part of the namespace.
    fn physical(&self, logical: &Path) -> OpResult<PathBuf> {
        if logical.file_name().is_some_and(is_internal_name) {
            return Err(libc::ENOENT);
        }
        Ok(self.redirector.resolve(logical))
    }

    /// Physical path for a new object at `logical`. The parent chain is
    /// materialized first; a pending object at the name itself is
    /// materialized too, so exclusive creation sees it.
    fn creation_target(&self, logical: &Path) -> OpResult<PathBuf> {
        let logical = normalize_logical(logical);
        let Some(name) = logical.file_name() else {
            return Err(libc::EEXIST);
        };
        if is_internal_name(name) {
            return Err(libc::EINVAL);
        }
        if let Some(parent) = logical.parent() {
            self.redirector.resolve(parent);
        }
        Ok(self.redirector.resolve(&logical))
    }

    /// Drop the tombstone for a name that now holds a new object.
    fn revive(&self, physical: &Path) {
        if let (Some(parent), Some(name)) = (physical.parent(), physical.file_name()) {
            if let Err(e) = Tombstone::remove(parent, name) {
                tracing::warn!("failed to remove tombstone for {:?}: {}", physical, e);
            }
        }
    }

    /// Record that `logical` was removed from the namespace, if the origin
    /// still has it.
    fn bury(&self, logical: &Path, physical: &Path) -> OpResult<()> {
        if !path_exists(&self.redirector.origin_path(logical)) {
            return Ok(());
        }
        match (physical.parent(), physical.file_name()) {
            (Some(parent), Some(name)) => Tombstone::create(parent, name).map_err(|e| {
                // The cache object is already gone, so the origin copy shows again
                tracing::error!("failed to create tombstone for {:?}: {}", logical, e);
                errno(e)
            }),
            _ => Ok(()),
        }
    }

    fn file_handle(&self, fh: u64) -> OpResult<Arc<FileHandle>> {
        self.files.get(fh).ok_or(libc::EBADF)
    }

    /// Run `f`, which adds or removes an entry next to `logical`, while no
    /// copy-up into the same directory is in flight.
    fn in_parent<R>(&self, logical: &Path, f: impl FnOnce() -> R) -> R {
        let logical = normalize_logical(logical);
        let parent = logical.parent().unwrap_or(&logical);
        self.redirector.with_path_locks(&[parent], f)
    }

    pub fn getattr(&self, logical: &Path, fh: Option<u64>) -> OpResult<Metadata> {
        tracing::debug!("getattr({:?}, fh={:?})", logical, fh);
        if let Some(handle) = fh.and_then(|fh| self.files.get(fh)) {
            return handle.file.metadata().map_err(errno);
        }
        fs::symlink_metadata(self.physical(logical)?).map_err(errno)
    }

    pub fn access(&self, logical: &Path, mask: i32) -> OpResult<()> {
        tracing::debug!("access({:?}, mask={:#o})", logical, mask);
        let path = self.physical(logical)?;
        nix::unistd::access(&path, AccessFlags::from_bits_truncate(mask)).map_err(nix_errno)
    }

    pub fn readlink(&self, logical: &Path) -> OpResult<PathBuf> {
        tracing::debug!("readlink({:?})", logical);
        fs::read_link(self.physical(logical)?).map_err(errno)
    }

    pub fn opendir(&self, logical: &Path) -> OpResult<u64> {
        tracing::debug!("opendir({:?})", logical);
        self.physical(logical)?;
        let stream = DirStream::open(Arc::clone(&self.redirector), logical).map_err(errno)?;
        self.dirs.insert(DirHandle::new(stream))
    }

    /// Feed entries from `offset` on to `add`, which receives each entry and
    /// the offset of the next one and returns true once its buffer is full.
    pub fn readdir<F>(&self, fh: u64, offset: usize, add: F) -> OpResult<()>
    where
        F: FnMut(&DirEntry, usize) -> bool,
    {
        tracing::debug!("readdir(fh={}, offset={})", fh, offset);
        let handle = self.dirs.get(fh).ok_or(libc::EBADF)?;
        handle.visit_from(offset, add);
        Ok(())
    }

    pub fn releasedir(&self, fh: u64) -> OpResult<()> {
        tracing::debug!("releasedir(fh={})", fh);
        self.dirs.remove(fh).map(|_| ()).ok_or(libc::EBADF)
    }

    pub fn mknod(&self, logical: &Path, mode: u32, rdev: u64) -> OpResult<()> {
        tracing::debug!("mknod({:?}, mode={:#o}, rdev={})", logical, mode, rdev);
        let path = self.creation_target(logical)?;
        let kind = mode & libc::S_IFMT as u32;
        let perm = mode & 0o7777;

        self.in_parent(logical, || -> OpResult<()> {
            if kind == 0 || kind == libc::S_IFREG as u32 {
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(perm)
                    .open(&path)
                    .map_err(errno)?;
            } else if kind == libc::S_IFIFO as u32 {
                nix::unistd::mkfifo(&path, Mode::from_bits_truncate(perm as _))
                    .map_err(nix_errno)?;
            } else {
                nix::sys::stat::mknod(
                    &path,
                    SFlag::from_bits_truncate(kind as _),
                    Mode::from_bits_truncate(perm as _),
                    rdev as _,
                )
                .map_err(nix_errno)?;
            }
            self.revive(&path);
            Ok(())
        })
    }

    pub fn mkdir(&self, logical: &Path, mode: u32) -> OpResult<()> {
        tracing::debug!("mkdir({:?}, mode={:#o})", logical, mode);
        let path = self.creation_target(logical)?;
        self.in_parent(logical, || -> OpResult<()> {
            DirBuilder::new()
                .mode(mode & 0o7777)
                .create(&path)
                .map_err(errno)?;
            self.revive(&path);

            // Recreated over a deleted origin directory
            if path_exists(&self.redirector.origin_path(logical)) {
                Tombstone::mark_opaque(&path).map_err(errno)?;
            }
            Ok(())
        })
    }

    pub fn unlink(&self, logical: &Path) -> OpResult<()> {
        tracing::debug!("unlink({:?})", logical);
        let path = self.physical(logical)?;
        self.in_parent(logical, || -> OpResult<()> {
            fs::remove_file(&path).map_err(errno)?;
            self.bury(logical, &path)
        })
    }

    pub fn rmdir(&self, logical: &Path) -> OpResult<()> {
        tracing::debug!("rmdir({:?})", logical);
        let logical = normalize_logical(logical);
        if logical.parent().is_none() {
            return Err(libc::EBUSY);
        }
        let path = self.physical(&logical)?;
        let meta = fs::symlink_metadata(&path).map_err(errno)?;
        if !meta.is_dir() {
            return Err(libc::ENOTDIR);
        }
        if !is_logically_empty(&self.redirector, &logical).map_err(errno)? {
            return Err(libc::ENOTEMPTY);
        }
        self.in_parent(&logical, || -> OpResult<()> {
            Tombstone::clear_markers(&path).map_err(errno)?;
            fs::remove_dir(&path).map_err(errno)?;
            self.bury(&logical, &path)
        })
    }

    pub fn symlink(&self, target: &Path, logical: &Path) -> OpResult<()> {
        tracing::debug!("symlink({:?} -> {:?})", logical, target);
        let path = self.creation_target(logical)?;
        self.in_parent(logical, || -> OpResult<()> {
            std::os::unix::fs::symlink(target, &path).map_err(errno)?;
            self.revive(&path);
            Ok(())
        })
    }

    /// Rename `from` to `to`. Only plain renames are supported; any flag
    /// (`RENAME_NOREPLACE`, `RENAME_EXCHANGE`, ...) fails with `EINVAL` before
    /// anything is touched.
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> OpResult<()> {
        tracing::debug!("rename({:?} -> {:?}, flags={:#x})", from, to, flags);
        if flags != 0 {
            return Err(libc::EINVAL);
        }
        let from = normalize_logical(from);
        let to = normalize_logical(to);

        let src = self.physical(&from)?;
        let src_meta = fs::symlink_metadata(&src).map_err(errno)?;
        if from == to {
            return Ok(());
        }
        let dst = self.creation_target(&to)?;

        if src_meta.is_dir() {
            if to.starts_with(&from) {
                return Err(libc::EINVAL);
            }
            self.materialize_subtree(&from);
            if let Ok(dst_meta) = fs::symlink_metadata(&dst) {
                if !dst_meta.is_dir() {
                    return Err(libc::ENOTDIR);
                }
                if !is_logically_empty(&self.redirector, &to).map_err(errno)? {
                    return Err(libc::ENOTEMPTY);
                }
                Tombstone::clear_markers(&dst).map_err(errno)?;
            }
        }

        let from_parent = from.parent().unwrap_or(&from);
        let to_parent = to.parent().unwrap_or(&to);
        self.redirector.with_path_locks(&[from_parent, to_parent], || -> OpResult<()> {
            fs::rename(&src, &dst).map_err(errno)?;

            // The move has happened; marker failures are logged, not returned
            self.revive(&dst);
            let _ = self.bury(&from, &src);
            if src_meta.is_dir() && path_exists(&self.redirector.origin_path(&to)) {
                if let Err(e) = Tombstone::mark_opaque(&dst) {
                    tracing::error!("failed to mark {:?} opaque after rename: {}", to, e);
                }
            }
            Ok(())
        })
    }

    /// Copy every visible origin descendant of `logical` into the cache so a
    /// directory can move without leaving its origin children behind.
    fn materialize_subtree(&self, logical: &Path) {
        let origin = self.redirector.origin_path(logical);
        for entry in WalkDir::new(&origin).min_depth(1).follow_links(false) {
            match entry {
                Ok(entry) => {
                    if let Ok(relative) = entry.path().strip_prefix(&origin) {
                        self.redirector.resolve(&logical.join(relative));
                    }
                }
                Err(e) => tracing::warn!("rename: cannot walk {:?}: {}", origin, e),
            }
        }
    }

    pub fn link(&self, from: &Path, to: &Path) -> OpResult<()> {
        tracing::debug!("link({:?} -> {:?})", to, from);
        let src = self.physical(from)?;
        let dst = self.creation_target(to)?;
        self.in_parent(to, || -> OpResult<()> {
            fs::hard_link(&src, &dst).map_err(errno)?;
            self.revive(&dst);
            Ok(())
        })
    }

    pub fn chmod(&self, logical: &Path, mode: u32, fh: Option<u64>) -> OpResult<()> {
        tracing::debug!("chmod({:?}, mode={:#o})", logical, mode);
        let perms = Permissions::from_mode(mode & 0o7777);
        if let Some(handle) = fh.and_then(|fh| self.files.get(fh)) {
            return handle.file.set_permissions(perms).map_err(errno);
        }
        fs::set_permissions(self.physical(logical)?, perms).map_err(errno)
    }

    pub fn chown(
        &self,
        logical: &Path,
        uid: Option<u32>,
        gid: Option<u32>,
        fh: Option<u64>,
    ) -> OpResult<()> {
        tracing::debug!("chown({:?}, uid={:?}, gid={:?})", logical, uid, gid);
        if let Some(handle) = fh.and_then(|fh| self.files.get(fh)) {
            return std::os::unix::fs::fchown(&handle.file, uid, gid).map_err(errno);
        }
        std::os::unix::fs::lchown(self.physical(logical)?, uid, gid).map_err(errno)
    }

    pub fn truncate(&self, logical: &Path, size: u64, fh: Option<u64>) -> OpResult<()> {
        tracing::debug!("truncate({:?}, size={})", logical, size);
        if let Some(handle) = fh.and_then(|fh| self.files.get(fh)) {
            return handle.file.set_len(size).map_err(errno);
        }
        let path = self.physical(logical)?;
        let size = libc::off_t::try_from(size).map_err(|_| libc::EFBIG)?;
        nix::unistd::truncate(&path, size).map_err(nix_errno)
    }

    pub fn utimens(
        &self,
        logical: &Path,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        fh: Option<u64>,
    ) -> OpResult<()> {
        tracing::debug!("utimens({:?}, atime={:?}, mtime={:?})", logical, atime, mtime);
        if let Some(handle) = fh.and_then(|fh| self.files.get(fh)) {
            let mut times = FileTimes::new();
            if let Some(atime) = atime {
                times = times.set_accessed(system_time(atime));
            }
            if let Some(mtime) = mtime {
                times = times.set_modified(system_time(mtime));
            }
            return handle.file.set_times(times).map_err(errno);
        }
        let path = self.physical(logical)?;
        utimensat(
            None,
            &path,
            &time_spec(atime),
            &time_spec(mtime),
            UtimensatFlags::NoFollowSymlink,
        )
        .map_err(nix_errno)
    }

    /// Create and open a regular file. The new file always lands in the cache
    /// layer.
    pub fn create(&self, logical: &Path, mode: u32, flags: i32) -> OpResult<u64> {
        tracing::debug!("create({:?}, mode={:#o}, flags={:#x})", logical, mode, flags);
        let path = self.creation_target(logical)?;
        let mut options = open_options(flags);
        options.create(true).mode(mode & 0o7777);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        }
        if flags & libc::O_ACCMODE == libc::O_RDONLY {
            // OpenOptions refuses to create without write access
            options.write(true);
        }
        let file = self.in_parent(logical, || -> OpResult<File> {
            let file = options.open(&path).map_err(errno)?;
            self.revive(&path);
            Ok(file)
        })?;
        self.files.insert(FileHandle { file, path })
    }

    pub fn open(&self, logical: &Path, flags: i32) -> OpResult<u64> {
        tracing::debug!("open({:?}, flags={:#x})", logical, flags);
        let path = self.physical(logical)?;
        let file = open_options(flags).open(&path).map_err(errno)?;
        self.files.insert(FileHandle { file, path })
    }

    /// Read into `buf` at `offset`, filling it unless end of file comes
    /// first. Without a handle the path is opened for this call only.
    pub fn read(
        &self,
        logical: &Path,
        fh: Option<u64>,
        buf: &mut [u8],
        offset: u64,
    ) -> OpResult<usize> {
        tracing::debug!("read({:?}, fh={:?}, size={}, offset={})", logical, fh, buf.len(), offset);
        match fh {
            Some(fh) => read_full(&self.file_handle(fh)?.file, buf, offset),
            None => {
                let file = File::open(self.physical(logical)?).map_err(errno)?;
                read_full(&file, buf, offset)
            }
        }
    }

    pub fn write(
        &self,
        logical: &Path,
        fh: Option<u64>,
        data: &[u8],
        offset: u64,
    ) -> OpResult<usize> {
        tracing::debug!("write({:?}, fh={:?}, size={}, offset={})", logical, fh, data.len(), offset);
        let written = match fh {
            Some(fh) => self.file_handle(fh)?.file.write_all_at(data, offset),
            None => {
                let file = OpenOptions::new()
                    .write(true)
                    .open(self.physical(logical)?)
                    .map_err(errno)?;
                file.write_all_at(data, offset)
            }
        };
        written.map_err(errno)?;
        Ok(data.len())
    }

    pub fn statfs(&self, logical: &Path) -> OpResult<Statvfs> {
        tracing::debug!("statfs({:?})", logical);
        nix::sys::statvfs::statvfs(&self.physical(logical)?).map_err(nix_errno)
    }

    pub fn release(&self, fh: u64) -> OpResult<()> {
        tracing::debug!("release(fh={})", fh);
        self.files.remove(fh).map(|_| ()).ok_or(libc::EBADF)
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> OpResult<()> {
        tracing::debug!("fsync(fh={}, datasync={})", fh, datasync);
        let handle = self.file_handle(fh)?;
        if datasync {
            handle.file.sync_data().map_err(errno)
        } else {
            handle.file.sync_all().map_err(errno)
        }
    }

    /// Close a duplicate of the descriptor, so close-time errors (and locks
    /// owned by the caller) are reported without giving up the handle.
    pub fn flush(&self, fh: u64) -> OpResult<()> {
        tracing::debug!("flush(fh={})", fh);
        let handle = self.file_handle(fh)?;
        let dup = nix::unistd::dup(handle.file.as_raw_fd()).map_err(nix_errno)?;
        nix::unistd::close(dup).map_err(nix_errno)
    }

    pub fn lseek(&self, fh: u64, offset: i64, whence: i32) -> OpResult<i64> {
        tracing::debug!("lseek(fh={}, offset={}, whence={})", fh, offset, whence);
        let handle = self.file_handle(fh)?;
        // SAFETY: the descriptor is owned by `handle`, which outlives the call.
        let pos = unsafe { libc::lseek(handle.file.as_raw_fd(), offset as libc::off_t, whence) };
        if pos < 0 {
            return Err(errno(io::Error::last_os_error()));
        }
        Ok(pos as i64)
    }

    /// Forward an ioctl to the host file. Only regular files accept ioctls.
    ///
    /// Returns the host return value and up to `out_size` bytes of the
    /// argument buffer after the call.
    pub fn ioctl(
        &self,
        logical: &Path,
        fh: Option<u64>,
        cmd: u32,
        in_data: &[u8],
        out_size: u32,
    ) -> OpResult<(i32, Vec<u8>)> {
        tracing::debug!("ioctl({:?}, fh={:?}, cmd={:#x})", logical, fh, cmd);
        let owned;
        let handle;
        let file: &File = match fh.and_then(|fh| self.files.get(fh)) {
            Some(h) => {
                handle = h;
                &handle.file
            }
            None => {
                owned = File::open(self.physical(logical)?).map_err(errno)?;
                &owned
            }
        };
        if !file.metadata().map_err(errno)?.is_file() {
            return Err(libc::EINVAL);
        }

        let mut buf = vec![0u8; ioctl_buffer_len(cmd, in_data.len(), out_size)];
        buf[..in_data.len()].copy_from_slice(in_data);
        // SAFETY: `buf` covers the input, the declared output, the size encoded
        // in `cmd` and a page for legacy commands that encode no size. It
        // stays alive for the duration of the call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), cmd as _, buf.as_mut_ptr()) };
        if ret < 0 {
            return Err(errno(io::Error::last_os_error()));
        }
        buf.truncate(out_size as usize);
        Ok((ret, buf))
    }

    pub fn getxattr(&self, logical: &Path, name: &OsStr) -> OpResult<Vec<u8>> {
        tracing::debug!("getxattr({:?}, {:?})", logical, name);
        Err(libc::ENOTSUP)
    }

    pub fn listxattr(&self, logical: &Path) -> OpResult<Vec<u8>> {
        tracing::debug!("listxattr({:?})", logical);
        Err(libc::ENOTSUP)
    }

    pub fn setxattr(&self, logical: &Path, name: &OsStr, _value: &[u8]) -> OpResult<()> {
        tracing::debug!("setxattr({:?}, {:?})", logical, name);
        Err(libc::ENOTSUP)
    }

    pub fn removexattr(&self, logical: &Path, name: &OsStr) -> OpResult<()> {
        tracing::debug!("removexattr({:?}, {:?})", logical, name);
        Err(libc::ENOTSUP)
    }
}

/// Smallest page that any ioctl argument is assumed to fit in. Legacy
/// commands such as `FIONREAD` encode no size in their number.
const IOCTL_MIN_BUFFER: usize = 4096;

/// Size of the argument buffer handed to the host for `cmd`: at least the
/// input, the caller's declared output, the size encoded in the command
/// number (`_IOC_SIZE`) and [`IOCTL_MIN_BUFFER`].
fn ioctl_buffer_len(cmd: u32, in_len: usize, out_size: u32) -> usize {
    // _IOC_SIZEBITS is 14 on most architectures and 13 on a few; the wider
    // mask can only over-allocate
    let encoded = ((cmd >> 16) & 0x3fff) as usize;
    in_len
        .max(out_size as usize)
        .max(encoded)
        .max(IOCTL_MIN_BUFFER)
}

fn read_full(file: &File, buf: &mut [u8], offset: u64) -> OpResult<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read_at(&mut buf[filled..], offset + filled as u64) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(errno(e)),
        }
    }
    Ok(filled)
}
