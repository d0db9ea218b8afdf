//! Directory enumeration over the merged view.
//!
//! A listing yields `.` and `..`, then every entry already in the cache copy
//! of the directory, then every origin entry the cache does not have yet.
//! Origin entries are materialized one level deep right before they are
//! yielded, so after a full listing every child of the directory lives in the
//! cache layer.

use fuser::FileType;
use fxhash::FxHashSet;
use std::ffi::{OsStr, OsString};
use std::fs::{self, ReadDir};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirEntryExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::overlay::convert::{metadata_to_filetype, std_filetype_to_fuser};
use crate::overlay::materialize::COPY_TEMP_PREFIX;
use crate::overlay::paths::{child_logical, normalize_logical};
use crate::overlay::redirect::Redirector;
use crate::overlay::tombstone::Tombstone;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileType,
}

/// Names that exist in the cache layer for bookkeeping only.
pub(crate) fn is_internal_name(name: &OsStr) -> bool {
    Tombstone::is_marker(name) || name.as_bytes().starts_with(COPY_TEMP_PREFIX.as_bytes())
}

enum Phase {
    Dots(u8),
    Cache(ReadDir),
    Origin(ReadDir),
    Done,
}

/// Lazy, single-pass listing of one logical directory.
pub struct DirStream {
    redirector: Arc<Redirector>,
    logical: PathBuf,
    cache_dir: PathBuf,
    origin_dir: Option<PathBuf>,
    phase: Phase,
    seen: FxHashSet<OsString>,
}

impl DirStream {
    /// Resolve `logical` and open its cache copy for listing.
    ///
    /// Errors opening the cache directory (`ENOENT`, `ENOTDIR`, `EACCES`) are
    /// returned as-is.
    pub fn open(redirector: Arc<Redirector>, logical: &Path) -> io::Result<Self> {
        let logical = normalize_logical(logical);
        let cache_dir = redirector.resolve(&logical);
        // Fail on unreadable directories before anything is yielded
        fs::read_dir(&cache_dir)?;

        let origin_dir = Some(redirector.origin_path(&logical)).filter(|origin| {
            !Tombstone::is_opaque(&cache_dir)
                && !Tombstone::hides(&redirector.config().cache_root, &logical)
                && origin.is_dir()
        });

        Ok(DirStream {
            redirector,
            logical,
            cache_dir,
            origin_dir,
            phase: Phase::Dots(0),
            seen: FxHashSet::default(),
        })
    }

    fn dot_entry(&self, which: u8) -> DirEntry {
        let dir = if which == 0 {
            self.cache_dir.clone()
        } else {
            match self.logical.parent() {
                Some(parent) => self.redirector.cache_path(parent),
                None => self.cache_dir.clone(),
            }
        };
        let ino = fs::symlink_metadata(&dir).map(|m| m.ino()).unwrap_or(0);
        DirEntry {
            name: OsString::from(if which == 0 { "." } else { ".." }),
            ino,
            kind: FileType::Directory,
        }
    }

    fn next_cache_entry(&mut self, entry: fs::DirEntry) -> Option<DirEntry> {
        let name = entry.file_name();
        if is_internal_name(&name) {
            return None;
        }
        let kind = entry_kind(&entry);
        self.seen.insert(name.clone());
        Some(DirEntry {
            ino: entry.ino(),
            name,
            kind,
        })
    }

    fn next_origin_entry(&mut self, entry: fs::DirEntry) -> Option<DirEntry> {
        let name = entry.file_name();
        if self.seen.contains(&name) || is_internal_name(&name) {
            return None;
        }
        if self.cache_dir.join(Tombstone::marker_name(&name)).exists() {
            return None;
        }

        // Unsupported types come back as skipped and stay origin-only
        self.redirector
            .materialize_child(&child_logical(&self.logical, &name));

        let kind = entry_kind(&entry);
        let ino = fs::symlink_metadata(self.cache_dir.join(&name))
            .map(|m| m.ino())
            .unwrap_or_else(|_| entry.ino());
        Some(DirEntry { name, ino, kind })
    }
}

fn entry_kind(entry: &fs::DirEntry) -> FileType {
    match entry.file_type() {
        Ok(ft) if ft.is_file() || ft.is_dir() || ft.is_symlink() => std_filetype_to_fuser(ft),
        _ => entry
            .metadata()
            .map(|m| metadata_to_filetype(&m))
            .unwrap_or(FileType::RegularFile),
    }
}

impl Iterator for DirStream {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            match &mut self.phase {
                Phase::Dots(n) if *n < 2 => {
                    let which = *n;
                    *n += 1;
                    return Some(self.dot_entry(which));
                }
                Phase::Dots(_) => {
                    self.phase = match fs::read_dir(&self.cache_dir) {
                        Ok(iter) => Phase::Cache(iter),
                        Err(e) => {
                            tracing::warn!("readdir: cannot list {:?}: {}", self.cache_dir, e);
                            Phase::Done
                        }
                    };
                }
                Phase::Cache(iter) => match iter.next() {
                    Some(Ok(entry)) => {
                        if let Some(entry) = self.next_cache_entry(entry) {
                            return Some(entry);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("readdir: error reading {:?}: {}", self.cache_dir, e);
                    }
                    None => {
                        let origin = self.origin_dir.as_ref().and_then(|dir| {
                            fs::read_dir(dir)
                                .map_err(|e| {
                                    tracing::warn!("readdir: cannot list origin {:?}: {}", dir, e)
                                })
                                .ok()
                        });
                        self.phase = origin.map_or(Phase::Done, Phase::Origin);
                    }
                },
                Phase::Origin(iter) => match iter.next() {
                    Some(Ok(entry)) => {
                        if let Some(entry) = self.next_origin_entry(entry) {
                            return Some(entry);
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!("readdir: error reading origin of {:?}: {}", self.logical, e);
                    }
                    None => self.phase = Phase::Done,
                },
                Phase::Done => return None,
            }
        }
    }
}

/// Whether `logical` has no visible children in either layer.
///
/// A directory whose cache copy is empty can still have origin children that
/// have not been listed yet.
pub fn is_logically_empty(redirector: &Redirector, logical: &Path) -> io::Result<bool> {
    let logical = normalize_logical(logical);
    let cache_dir = redirector.cache_path(&logical);

    let mut cache_names = FxHashSet::default();
    for entry in fs::read_dir(&cache_dir)? {
        let name = entry?.file_name();
        if !is_internal_name(&name) {
            return Ok(false);
        }
        cache_names.insert(name);
    }

    if Tombstone::is_opaque(&cache_dir)
        || Tombstone::hides(&redirector.config().cache_root, &logical)
    {
        return Ok(true);
    }

    let origin_dir = redirector.origin_path(&logical);
    let entries = match fs::read_dir(&origin_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => return Ok(true),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let name = entry?.file_name();
        if !cache_names.contains(&Tombstone::marker_name(&name)) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerConfig;
    use std::os::unix::fs::symlink;

    fn setup() -> (tempfile::TempDir, Arc<Redirector>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let lower = temp_dir.path().join("lower");
        let upper = temp_dir.path().join("upper");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&upper).unwrap();
        let config = LayerConfig::new(&lower, &upper, None).unwrap();
        (temp_dir, Arc::new(Redirector::new(Arc::new(config))))
    }

    fn names(stream: DirStream) -> Vec<String> {
        let mut names: Vec<_> = stream
            .map(|e| e.name.to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_listing_merges_and_materializes() {
        let (_temp, redirector) = setup();
        let origin = redirector.config().origin_root.clone();
        let cache = redirector.config().cache_root.clone();
        fs::write(origin.join("a.txt"), "a").unwrap();
        fs::create_dir(origin.join("sub")).unwrap();
        fs::write(origin.join("sub/deep.txt"), "deep").unwrap();
        symlink("a.txt", origin.join("link")).unwrap();
        fs::write(cache.join("new.txt"), "new").unwrap();

        let stream = DirStream::open(redirector.clone(), Path::new("/")).unwrap();

        assert_eq!(
            names(stream),
            vec![".", "..", "a.txt", "link", "new.txt", "sub"]
        );
        assert_eq!(fs::read_to_string(cache.join("a.txt")).unwrap(), "a");
        assert!(cache.join("sub").is_dir());
        assert_eq!(fs::read_link(cache.join("link")).unwrap(), PathBuf::from("a.txt"));
        // One level only
        assert!(!cache.join("sub/deep.txt").exists());
    }

    #[test]
    fn test_listing_yields_each_name_once() {
        let (_temp, redirector) = setup();
        fs::write(redirector.config().origin_root.join("both.txt"), "origin").unwrap();
        fs::write(redirector.config().cache_root.join("both.txt"), "cache").unwrap();

        let stream = DirStream::open(redirector.clone(), Path::new("/")).unwrap();

        assert_eq!(names(stream), vec![".", "..", "both.txt"]);
        assert_eq!(
            fs::read_to_string(redirector.config().cache_root.join("both.txt")).unwrap(),
            "cache"
        );
    }

    #[test]
    fn test_listing_hides_markers_and_tombstoned_names() {
        let (_temp, redirector) = setup();
        let origin = redirector.config().origin_root.clone();
        let cache = redirector.config().cache_root.clone();
        fs::write(origin.join("gone.txt"), "x").unwrap();
        fs::write(origin.join("kept.txt"), "x").unwrap();
        Tombstone::create(&cache, OsStr::new("gone.txt")).unwrap();
        fs::write(cache.join(format!("{}abc", COPY_TEMP_PREFIX)), "").unwrap();

        let stream = DirStream::open(redirector.clone(), Path::new("/")).unwrap();

        assert_eq!(names(stream), vec![".", "..", "kept.txt"]);
        assert!(!cache.join("gone.txt").exists());
    }

    #[test]
    fn test_opaque_directory_ignores_origin() {
        let (_temp, redirector) = setup();
        let origin = redirector.config().origin_root.clone();
        let cache = redirector.config().cache_root.clone();
        fs::create_dir(origin.join("dir")).unwrap();
        fs::write(origin.join("dir/old.txt"), "x").unwrap();
        fs::create_dir(cache.join("dir")).unwrap();
        Tombstone::mark_opaque(&cache.join("dir")).unwrap();

        let stream = DirStream::open(redirector.clone(), Path::new("/dir")).unwrap();

        assert_eq!(names(stream), vec![".", ".."]);
    }

    #[test]
    fn test_listing_missing_directory_fails() {
        let (_temp, redirector) = setup();
        let err = DirStream::open(redirector, Path::new("/missing")).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_listing_keeps_directory_times() {
        let (_temp, redirector) = setup();
        let origin = redirector.config().origin_root.clone();
        fs::create_dir(origin.join("dir")).unwrap();
        fs::write(origin.join("dir/a"), "a").unwrap();
        fs::write(origin.join("dir/b"), "b").unwrap();

        let stream = DirStream::open(redirector.clone(), Path::new("/dir")).unwrap();
        assert_eq!(stream.count(), 4);

        let cached = fs::metadata(redirector.config().cache_root.join("dir")).unwrap();
        let original = fs::metadata(origin.join("dir")).unwrap();
        assert_eq!(cached.mtime(), original.mtime());
        assert_eq!(cached.mtime_nsec(), original.mtime_nsec());
    }

    #[test]
    fn test_is_logically_empty() {
        let (_temp, redirector) = setup();
        let origin = redirector.config().origin_root.clone();
        let cache = redirector.config().cache_root.clone();
        fs::create_dir(origin.join("dir")).unwrap();
        fs::write(origin.join("dir/child"), "x").unwrap();
        fs::create_dir(cache.join("dir")).unwrap();

        assert!(!is_logically_empty(&redirector, Path::new("/dir")).unwrap());

        Tombstone::create(&cache.join("dir"), OsStr::new("child")).unwrap();
        assert!(is_logically_empty(&redirector, Path::new("/dir")).unwrap());

        fs::write(cache.join("dir/fresh"), "x").unwrap();
        assert!(!is_logically_empty(&redirector, Path::new("/dir")).unwrap());
    }
}
