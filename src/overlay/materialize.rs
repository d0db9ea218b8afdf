//! Copy-up of a single object from the origin layer into the cache layer.

use nix::sys::stat::{utimensat, UtimensatFlags};
use nix::sys::time::TimeSpec;
use std::fs::{self, DirBuilder, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Prefix of the temporary sibling a file is copied into before it is
/// renamed into place.
pub const COPY_TEMP_PREFIX: &str = ".dbfs-copy.";

#[derive(Error, Debug)]
pub enum MaterializeError {
    #[error("failed to stat origin {path}: {source}")]
    Stat { path: PathBuf, source: io::Error },

    #[error("failed to create directory {path}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to copy {from} to {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },

    #[error("failed to recreate symlink {path}: {source}")]
    Symlink { path: PathBuf, source: io::Error },

    #[error("failed to set mode on {path}: {source}")]
    Mode { path: PathBuf, source: io::Error },
}

/// What a call to [`materialize`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Materialized {
    Directory,
    File,
    Symlink,
    /// Another writer got there first; nothing was touched.
    AlreadyPresent,
    /// Devices, sockets and FIFOs are left in the origin layer.
    Skipped,
}

impl Materialized {
    pub fn copied(self) -> bool {
        matches!(
            self,
            Materialized::Directory | Materialized::File | Materialized::Symlink
        )
    }
}

/// Replicate the object at `origin` to `cache`: content (or link target),
/// mode bits and timestamps. Directories are created empty.
pub fn materialize(origin: &Path, cache: &Path) -> Result<Materialized, MaterializeError> {
    let meta = fs::symlink_metadata(origin).map_err(|source| MaterializeError::Stat {
        path: origin.to_path_buf(),
        source,
    })?;
    let file_type = meta.file_type();
    let mode = meta.mode() & 0o7777;

    let kind = if file_type.is_dir() {
        materialize_dir(cache, mode)?
    } else if file_type.is_symlink() {
        materialize_symlink(origin, cache)?
    } else if file_type.is_file() {
        materialize_file(origin, cache, mode)?
    } else {
        tracing::warn!(
            "materialize: skipping unsupported object {} (mode {:#o})",
            origin.display(),
            meta.mode()
        );
        return Ok(Materialized::Skipped);
    };

    if kind.copied() {
        if let Err(e) = copy_times(&meta, cache) {
            tracing::warn!(
                "materialize: failed to copy timestamps onto {}: {}",
                cache.display(),
                e
            );
        }
    }

    Ok(kind)
}

fn materialize_dir(cache: &Path, mode: u32) -> Result<Materialized, MaterializeError> {
    match DirBuilder::new().mode(mode).create(cache) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            return Ok(Materialized::AlreadyPresent)
        }
        Err(source) => {
            return Err(MaterializeError::CreateDir {
                path: cache.to_path_buf(),
                source,
            })
        }
    }

    // mkdir(2) applies the umask and drops special bits
    fs::set_permissions(cache, Permissions::from_mode(mode)).map_err(|source| {
        MaterializeError::Mode {
            path: cache.to_path_buf(),
            source,
        }
    })?;
    Ok(Materialized::Directory)
}

fn materialize_symlink(origin: &Path, cache: &Path) -> Result<Materialized, MaterializeError> {
    let symlink_error = |source| MaterializeError::Symlink {
        path: cache.to_path_buf(),
        source,
    };
    let target = fs::read_link(origin).map_err(symlink_error)?;
    match std::os::unix::fs::symlink(&target, cache) {
        Ok(()) => Ok(Materialized::Symlink),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(Materialized::AlreadyPresent),
        Err(e) => Err(symlink_error(e)),
    }
}

fn materialize_file(
    origin: &Path,
    cache: &Path,
    mode: u32,
) -> Result<Materialized, MaterializeError> {
    let copy_error = |source| MaterializeError::Copy {
        from: origin.to_path_buf(),
        to: cache.to_path_buf(),
        source,
    };
    let parent = cache.parent().unwrap_or_else(|| Path::new("/"));

    let temp = tempfile::Builder::new()
        .prefix(COPY_TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(copy_error)?;

    copy_file_contents(origin, temp.path()).map_err(copy_error)?;
    fs::set_permissions(temp.path(), Permissions::from_mode(mode)).map_err(|source| {
        MaterializeError::Mode {
            path: cache.to_path_buf(),
            source,
        }
    })?;

    // Publishing with a link keeps readers from ever seeing a partial copy
    // and never clobbers an object someone else put there first.
    match temp.persist_noclobber(cache) {
        Ok(_) => Ok(Materialized::File),
        Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
            Ok(Materialized::AlreadyPresent)
        }
        Err(e) => Err(copy_error(e.error)),
    }
}

/// Byte-for-byte copy; the kernel may use copy_file_range or reflinks.
pub(crate) fn copy_file_contents(src: &Path, dest: &Path) -> io::Result<()> {
    fs::copy(src, dest)?;
    Ok(())
}

/// Copy access and modification times from `meta` onto `path` without
/// following a final symlink.
pub(crate) fn copy_times(meta: &Metadata, path: &Path) -> nix::Result<()> {
    let atime = TimeSpec::new(meta.atime() as _, meta.atime_nsec() as _);
    let mtime = TimeSpec::new(meta.mtime() as _, meta.mtime_nsec() as _);
    utimensat(None, path, &atime, &mtime, UtimensatFlags::NoFollowSymlink)
}
