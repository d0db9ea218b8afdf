//! Logical-to-physical path helpers.
//!
//! A logical path is what the overlay's users see (`/docs/readme.txt`). It is
//! never stored on its own; it is always joined onto one of the two layer
//! roots to produce a physical path.

use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Normalize a logical path to its absolute form rooted at `/`.
///
/// Redundant separators and `.` segments are dropped, `..` pops a segment and
/// is clamped at the root.
pub fn normalize_logical(logical: &Path) -> PathBuf {
    let mut result = PathBuf::from("/");
    for component in logical.components() {
        match component {
            Component::Normal(part) => result.push(part),
            Component::ParentDir => {
                result.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    result
}

/// Join a logical path onto a layer root.
pub fn layer_path(root: &Path, logical: &Path) -> PathBuf {
    let normalized = normalize_logical(logical);
    match normalized.strip_prefix("/") {
        Ok(relative) if !relative.as_os_str().is_empty() => root.join(relative),
        _ => root.to_path_buf(),
    }
}

/// Logical path of `name` inside the logical directory `parent`.
pub fn child_logical(parent: &Path, name: &OsStr) -> PathBuf {
    normalize_logical(&parent.join(name))
}

/// Whether anything exists at `path`, without following a final symlink.
///
/// A dangling symlink exists.
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}
