//! Maps logical paths to the physical path every operation runs against.
//!
//! The answer is always the cache-layer candidate. When the cache copy is
//! missing but the origin has the object, it is copied up first. Copy-up
//! failures are logged and never fail the resolution; the caller's real
//! syscall then reports the natural error.

use dashmap::DashMap;
use nix::sys::time::TimeSpec;
use parking_lot::Mutex;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::LayerConfig;
use crate::overlay::materialize::{materialize, MaterializeError, Materialized};
use crate::overlay::paths::{layer_path, normalize_logical, path_exists};
use crate::overlay::tombstone::Tombstone;

/// Where a logical path currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializationState {
    /// The cache layer has it.
    Materialized,
    /// Only the origin layer has it.
    Pending,
    /// Neither layer has it (or the origin copy is tombstoned).
    Absent,
}

/// Resolves logical paths against the two layers, copying up on demand.
///
/// Shared by every handler through an `Arc`; all methods take `&self`.
pub struct Redirector {
    config: Arc<LayerConfig>,
    /// Per-logical-path locks, held by copy-up and by operations that change
    /// a directory's entries. See [`Redirector::with_path_locks`].
    path_locks: DashMap<PathBuf, Arc<Mutex<()>>>,
    materialized: AtomicU64,
}

impl Redirector {
    /// Create a redirector over the layer roots in `config`. Nothing is
    /// touched on disk until the first resolution.
    pub fn new(config: Arc<LayerConfig>) -> Self {
        Redirector {
            config,
            path_locks: DashMap::new(),
            materialized: AtomicU64::new(0),
        }
    }

    /// The layer roots this redirector was built with.
    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    /// Cache-layer candidate for `logical`. Pure path arithmetic: nothing is
    /// checked or copied.
    pub fn cache_path(&self, logical: &Path) -> PathBuf {
        layer_path(&self.config.cache_root, logical)
    }

    /// Origin-layer candidate for `logical`.
    pub fn origin_path(&self, logical: &Path) -> PathBuf {
        layer_path(&self.config.origin_root, logical)
    }

    /// Number of objects this redirector has copied into the cache layer.
    pub fn materialization_count(&self) -> u64 {
        self.materialized.load(Ordering::Relaxed)
    }

    /// Classify `logical` without copying anything.
    pub fn state(&self, logical: &Path) -> MaterializationState {
        if path_exists(&self.cache_path(logical)) {
            MaterializationState::Materialized
        } else if self.origin_visible(logical) {
            MaterializationState::Pending
        } else {
            MaterializationState::Absent
        }
    }

    /// Whether the origin has `logical` and no tombstone hides it.
    pub fn origin_visible(&self, logical: &Path) -> bool {
        path_exists(&self.origin_path(logical))
            && !Tombstone::hides(&self.config.cache_root, logical)
    }

    /// Return the physical path for `logical`, copying it up first if only the
    /// origin has it.
    pub fn resolve(&self, logical: &Path) -> PathBuf {
        let cache = self.cache_path(logical);
        if path_exists(&cache) {
            return cache;
        }

        let logical = normalize_logical(logical);
        if let Err(e) = self.copy_up(&logical, &cache) {
            tracing::warn!("resolve: copy-up of {:?} failed: {}", logical, e);
        }
        cache
    }

    fn copy_up(&self, logical: &Path, cache: &Path) -> Result<(), MaterializeError> {
        if !self.origin_visible(logical) {
            return Ok(());
        }

        if let (Some(parent), Some(cache_parent)) = (logical.parent(), cache.parent()) {
            if !path_exists(cache_parent) {
                self.resolve(parent);
            }
        }

        self.with_path_locks(&[logical], || {
            if path_exists(cache) {
                Ok(())
            } else {
                self.copy_into_parent(logical, cache).map(|_| ())
            }
        })
    }

    /// Materialize one entry of an already-materialized directory. Used by the
    /// directory enumerator's sweep.
    ///
    /// # Returns
    /// * `Some(kind)` with what was done (`AlreadyPresent` if the cache had it)
    /// * `None` if the copy failed; the failure is logged
    pub(crate) fn materialize_child(&self, logical: &Path) -> Option<Materialized> {
        let logical = normalize_logical(logical);
        let cache = self.cache_path(&logical);
        self.with_path_locks(&[logical.as_path()], || {
            if path_exists(&cache) {
                return Some(Materialized::AlreadyPresent);
            }
            match self.copy_into_parent(&logical, &cache) {
                Ok(kind) => Some(kind),
                Err(e) => {
                    tracing::warn!("readdir: copy-up of {:?} failed: {}", logical, e);
                    None
                }
            }
        })
    }

    /// Copy `logical` from the origin to `cache` and put the cache parent's
    /// timestamps back afterwards. The parent's lock is held throughout, so an
    /// entry change made through the overlay cannot land between capture and
    /// restore and have its mtime update undone.
    fn copy_into_parent(&self, logical: &Path, cache: &Path) -> Result<Materialized, MaterializeError> {
        let origin = self.origin_path(logical);
        let copy = || -> Result<Materialized, MaterializeError> {
            let parent_times = cache.parent().and_then(ParentTimes::capture);
            let kind = materialize(&origin, cache)?;
            self.record(kind, logical);
            if kind.copied() {
                if let Some(times) = parent_times {
                    times.restore();
                }
            }
            Ok(kind)
        };
        match logical.parent() {
            Some(parent) => self.with_path_locks(&[parent], copy),
            None => copy(),
        }
    }

    fn record(&self, kind: Materialized, logical: &Path) {
        if kind.copied() {
            self.materialized.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("materialized {:?} as {:?}", logical, kind);
        }
    }

    /// Run `f` while holding the lock of every logical path in `paths`.
    ///
    /// Copy-up holds a path's lock and then takes its parent's; operations
    /// that add or remove directory entries take the lock of each directory
    /// they change. Locks are always taken deepest path first, ties broken by
    /// path order, so nested acquisitions never deadlock. `f` must not call
    /// back into resolution for a path whose lock is held.
    ///
    /// # Arguments
    /// * `paths` - Logical paths to lock; duplicates are locked once
    /// * `f` - The work to run under the locks
    ///
    /// # Returns
    /// Whatever `f` returns. Locks nobody else waits on are dropped from the
    /// table afterwards.
    pub fn with_path_locks<R>(&self, paths: &[&Path], f: impl FnOnce() -> R) -> R {
        let mut keys: Vec<PathBuf> = paths.iter().map(|p| normalize_logical(p)).collect();
        keys.sort_by(|a, b| {
            b.components()
                .count()
                .cmp(&a.components().count())
                .then_with(|| a.cmp(b))
        });
        keys.dedup();

        let locks: Vec<Arc<Mutex<()>>> = keys.iter().map(|key| self.path_lock(key)).collect();
        let result = {
            let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();
            f()
        };
        drop(locks);
        for key in &keys {
            self.path_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }

    fn path_lock(&self, logical: &Path) -> Arc<Mutex<()>> {
        self.path_locks
            .entry(logical.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn path_locks_count(&self) -> usize {
        self.path_locks.len()
    }
}

/// Timestamps of a cache directory captured before copy-up writes into it,
/// so materializing a child does not show up as a modification of the parent.
struct ParentTimes {
    path: PathBuf,
    atime: TimeSpec,
    mtime: TimeSpec,
}

impl ParentTimes {
    fn capture(path: &Path) -> Option<Self> {
        let meta = fs::symlink_metadata(path).ok()?;
        Some(ParentTimes {
            path: path.to_path_buf(),
            atime: TimeSpec::new(meta.atime() as _, meta.atime_nsec() as _),
            mtime: TimeSpec::new(meta.mtime() as _, meta.mtime_nsec() as _),
        })
    }

    fn restore(&self) {
        if let Err(e) = nix::sys::stat::utimensat(
            None,
            &self.path,
            &self.atime,
            &self.mtime,
            nix::sys::stat::UtimensatFlags::NoFollowSymlink,
        ) {
            tracing::debug!(
                "failed to restore timestamps on {}: {}",
                self.path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn setup() -> (tempfile::TempDir, Redirector) {
        let temp_dir = tempfile::tempdir().unwrap();
        let lower = temp_dir.path().join("lower");
        let upper = temp_dir.path().join("upper");
        fs::create_dir(&lower).unwrap();
        fs::create_dir(&upper).unwrap();
        let config = LayerConfig::new(&lower, &upper, None).unwrap();
        (temp_dir, Redirector::new(Arc::new(config)))
    }

    #[test]
    fn test_resolve_absent_returns_cache_candidate() {
        let (_temp, redirector) = setup();
        let resolved = redirector.resolve(Path::new("/new.txt"));

        assert_eq!(resolved, redirector.config().cache_root.join("new.txt"));
        assert!(!resolved.exists());
        assert_eq!(redirector.materialization_count(), 0);
    }

    #[test]
    fn test_resolve_copies_up_pending_file_once() {
        let (_temp, redirector) = setup();
        fs::write(redirector.config().origin_root.join("a.txt"), "origin").unwrap();

        assert_eq!(
            redirector.state(Path::new("/a.txt")),
            MaterializationState::Pending
        );
        let first = redirector.resolve(Path::new("/a.txt"));
        let second = redirector.resolve(Path::new("a.txt"));

        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&first).unwrap(), "origin");
        assert_eq!(redirector.materialization_count(), 1);
        assert_eq!(
            redirector.state(Path::new("/a.txt")),
            MaterializationState::Materialized
        );
    }

    #[test]
    fn test_resolve_materializes_missing_ancestors() {
        let (_temp, redirector) = setup();
        let origin = &redirector.config().origin_root;
        fs::create_dir_all(origin.join("a/b")).unwrap();
        fs::write(origin.join("a/b/c.txt"), "deep").unwrap();

        let resolved = redirector.resolve(Path::new("/a/b/c.txt"));

        assert_eq!(fs::read_to_string(resolved).unwrap(), "deep");
        assert!(redirector.config().cache_root.join("a/b").is_dir());
        assert_eq!(redirector.materialization_count(), 3);
    }

    #[test]
    fn test_resolve_respects_tombstone() {
        let (_temp, redirector) = setup();
        fs::write(redirector.config().origin_root.join("gone.txt"), "x").unwrap();
        Tombstone::create(&redirector.config().cache_root, OsStr::new("gone.txt")).unwrap();

        let resolved = redirector.resolve(Path::new("/gone.txt"));

        assert!(!resolved.exists());
        assert_eq!(
            redirector.state(Path::new("/gone.txt")),
            MaterializationState::Absent
        );
    }

    #[test]
    fn test_path_locks_are_released() {
        let (_temp, redirector) = setup();
        fs::write(redirector.config().origin_root.join("a.txt"), "x").unwrap();

        redirector.resolve(Path::new("/a.txt"));

        assert_eq!(redirector.path_locks_count(), 0);
    }

    #[test]
    fn test_copy_up_keeps_parent_times() {
        let (_temp, redirector) = setup();
        let origin = &redirector.config().origin_root;
        fs::create_dir(origin.join("dir")).unwrap();
        fs::write(origin.join("dir/file.txt"), "x").unwrap();

        let dir = redirector.resolve(Path::new("/dir"));
        let before = fs::metadata(&dir).unwrap().mtime();
        redirector.resolve(Path::new("/dir/file.txt"));
        let after = fs::metadata(&dir).unwrap().mtime();

        assert_eq!(before, after);
        assert_eq!(after, fs::metadata(origin.join("dir")).unwrap().mtime());
    }

    #[test]
    fn test_with_path_locks_dedups_and_releases() {
        let (_temp, redirector) = setup();

        let value = redirector.with_path_locks(
            &[Path::new("/a/b"), Path::new("/a"), Path::new("a/b/")],
            || {
                assert_eq!(redirector.path_locks_count(), 2);
                7
            },
        );

        assert_eq!(value, 7);
        assert_eq!(redirector.path_locks_count(), 0);
    }

    #[test]
    fn test_copy_up_waits_for_parent_lock() {
        let (_temp, redirector) = setup();
        let origin = &redirector.config().origin_root;
        fs::create_dir(origin.join("dir")).unwrap();
        fs::write(origin.join("dir/file.txt"), "x").unwrap();
        let dir = redirector.resolve(Path::new("/dir"));

        let mtime_after_create = std::thread::scope(|scope| {
            redirector.with_path_locks(&[Path::new("/dir")], || {
                let _copier = scope.spawn(|| redirector.resolve(Path::new("/dir/file.txt")));
                std::thread::sleep(std::time::Duration::from_millis(100));
                assert!(!dir.join("file.txt").exists());

                // An entry added through the overlay while the copy is blocked
                fs::write(dir.join("created.txt"), "new").unwrap();
                let mtime = fs::metadata(&dir).unwrap().modified().unwrap();
                mtime
            })
        });

        assert!(dir.join("file.txt").is_file());
        assert_eq!(
            fs::metadata(&dir).unwrap().modified().unwrap(),
            mtime_after_create
        );
    }
}
