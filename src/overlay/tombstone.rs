//! Tombstones for objects deleted through the overlay.
//!
//! The origin layer is never written, so deleting something that also exists
//! there needs a marker in the cache layer, otherwise the next access would
//! materialize it again. We use AUFS-style markers: a tombstone for `foo` is
//! an empty file named `.wh.foo` in the cache copy of the parent directory.
//!
//! A directory that was recreated over a tombstone, or renamed onto a name the
//! origin also has, is marked opaque with `.wh..wh..opq`: none of the origin's
//! children show through it.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path};

/// The prefix used for tombstone marker files.
pub const TOMBSTONE_PREFIX: &str = ".wh.";

/// Marker file name for opaque directories.
pub const OPAQUE_MARKER: &str = ".wh..wh..opq";

pub struct Tombstone;

impl Tombstone {
    /// Create a tombstone for `name` in the cache directory `parent_dir`.
    ///
    /// # Arguments
    /// * `parent_dir` - Cache directory that will hold the marker
    /// * `name` - Entry to hide (the marker will be `.wh.<name>`)
    pub fn create(parent_dir: &Path, name: &OsStr) -> io::Result<()> {
        File::create(parent_dir.join(Self::marker_name(name)))?;
        Ok(())
    }

    /// Remove the tombstone for `name`, if any.
    pub fn remove(parent_dir: &Path, name: &OsStr) -> io::Result<()> {
        match fs::remove_file(parent_dir.join(Self::marker_name(name))) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    /// Whether the cache-layer `path` carries a tombstone in its parent.
    pub fn exists(path: &Path) -> bool {
        if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
            parent.join(Self::marker_name(name)).exists()
        } else {
            false
        }
    }

    /// For a file named `foo`, returns `.wh.foo`.
    pub fn marker_name(name: &OsStr) -> OsString {
        let mut marker = OsString::from(TOMBSTONE_PREFIX);
        marker.push(name);
        marker
    }

    /// Whether `name` is a tombstone or opaque marker rather than user data.
    pub fn is_marker(name: &OsStr) -> bool {
        name.as_bytes().starts_with(TOMBSTONE_PREFIX.as_bytes())
    }

    /// Mark the cache directory `dir` opaque, so no origin entries show
    /// through it.
    ///
    /// # Arguments
    /// * `dir` - Cache directory to mark; it must already exist
    ///
    /// # Returns
    /// The error from creating the marker file, e.g. when `dir` is not
    /// writable
    pub fn mark_opaque(dir: &Path) -> io::Result<()> {
        File::create(dir.join(OPAQUE_MARKER))?;
        Ok(())
    }

    /// Whether the cache directory `dir` hides the origin directory behind it.
    pub fn is_opaque(dir: &Path) -> bool {
        dir.join(OPAQUE_MARKER).exists()
    }

    /// Delete every marker inside `dir`, leaving user entries alone.
    pub fn clear_markers(dir: &Path) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if Self::is_marker(&entry.file_name()) {
                match fs::remove_file(entry.path()) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Whether the origin object behind `logical` is hidden from the overlay.
    ///
    /// True when any ancestor (or the path itself) is tombstoned, or when any
    /// ancestor directory in the cache is opaque. Only the cache layer is
    /// inspected.
    pub fn hides(cache_root: &Path, logical: &Path) -> bool {
        let mut current = cache_root.to_path_buf();
        for component in logical.components() {
            let Component::Normal(name) = component else {
                continue;
            };
            if Self::is_opaque(&current) || current.join(Self::marker_name(name)).exists() {
                return true;
            }
            current.push(name);
        }
        false
    }
}
