use fuser::FUSE_ROOT_ID;
use fxhash::FxHashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub(crate) struct InodeData {
    pub path: PathBuf,
    /// Outstanding kernel lookups; the entry goes away when this drops to 0.
    pub lookups: u64,
}

/// Two-way map between the inode numbers handed to the kernel and logical
/// paths. The engine itself only speaks paths.
///
/// Numbers are allocated per path, not per host object: two hard links to
/// one file get different inode numbers, and `st_ino` from `getattr` differs
/// from the host inode that `readdir` reports as `d_ino`. The host inode of
/// an origin object also changes when it is copied up.
#[derive(Debug)]
pub(crate) struct InodeTable {
    inodes: FxHashMap<u64, InodeData>,
    by_path: FxHashMap<PathBuf, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut table = InodeTable {
            inodes: FxHashMap::default(),
            by_path: FxHashMap::default(),
            // FUSE reserves inode 1 (FUSE_ROOT_ID) for the root directory
            next_ino: FUSE_ROOT_ID + 1,
        };
        let root = PathBuf::from("/");
        table.inodes.insert(
            FUSE_ROOT_ID,
            InodeData {
                path: root.clone(),
                lookups: 1,
            },
        );
        table.by_path.insert(root, FUSE_ROOT_ID);
        table
    }

    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inodes.get(&ino).map(|inode| inode.path.clone())
    }

    /// Return the inode for `path`, allocating one if needed, and count one
    /// kernel lookup against it.
    pub fn lookup(&mut self, path: &Path) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.lookups += 1;
            }
            return ino;
        }

        let ino = self.next_ino;
        self.next_ino = self.next_ino.wrapping_add(1);
        self.inodes.insert(
            ino,
            InodeData {
                path: path.to_path_buf(),
                lookups: 1,
            },
        );
        self.by_path.insert(path.to_path_buf(), ino);
        ino
    }

    pub fn forget(&mut self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        let Some(inode) = self.inodes.get_mut(&ino) else {
            return;
        };
        inode.lookups = inode.lookups.saturating_sub(nlookup);
        if inode.lookups == 0 {
            if let Some(inode) = self.inodes.remove(&ino) {
                if self.by_path.get(&inode.path) == Some(&ino) {
                    self.by_path.remove(&inode.path);
                }
            }
        }
    }

    /// The name at `path` is gone. The inode stays valid for open handles
    /// until the kernel forgets it, but new lookups get a fresh number.
    pub fn unlink(&mut self, path: &Path) {
        self.by_path.remove(path);
    }

    /// Move `from` (and everything below it) to `to`.
    pub fn rename(&mut self, from: &Path, to: &Path) {
        self.unlink(to);
        let moved: Vec<(PathBuf, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();

        for (old_path, ino) in moved {
            let new_path = match old_path.strip_prefix(from) {
                Ok(rest) if rest.as_os_str().is_empty() => to.to_path_buf(),
                Ok(rest) => to.join(rest),
                Err(_) => continue,
            };
            self.by_path.remove(&old_path);
            self.by_path.insert(new_path.clone(), ino);
            if let Some(inode) = self.inodes.get_mut(&ino) {
                inode.path = new_path;
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_is_preallocated() {
        let table = InodeTable::new();
        assert_eq!(table.path(FUSE_ROOT_ID), Some(PathBuf::from("/")));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_is_stable() {
        let mut table = InodeTable::new();
        let a = table.lookup(Path::new("/a"));
        let b = table.lookup(Path::new("/b"));

        assert_ne!(a, b);
        assert_ne!(a, FUSE_ROOT_ID);
        assert_eq!(table.lookup(Path::new("/a")), a);
        assert_eq!(table.path(a), Some(PathBuf::from("/a")));
    }

    #[test]
    fn test_forget_drops_entry_after_last_lookup() {
        let mut table = InodeTable::new();
        let a = table.lookup(Path::new("/a"));
        table.lookup(Path::new("/a"));

        table.forget(a, 1);
        assert!(table.path(a).is_some());

        table.forget(a, 1);
        assert!(table.path(a).is_none());
        assert_ne!(table.lookup(Path::new("/a")), a);
    }

    #[test]
    fn test_forget_never_drops_root() {
        let mut table = InodeTable::new();
        table.forget(FUSE_ROOT_ID, 100);
        assert!(table.path(FUSE_ROOT_ID).is_some());
    }

    #[test]
    fn test_unlink_keeps_inode_until_forget() {
        let mut table = InodeTable::new();
        let a = table.lookup(Path::new("/a"));

        table.unlink(Path::new("/a"));

        assert_eq!(table.path(a), Some(PathBuf::from("/a")));
        assert_ne!(table.lookup(Path::new("/a")), a);
    }

    #[test]
    fn test_rename_rekeys_descendants() {
        let mut table = InodeTable::new();
        let dir = table.lookup(Path::new("/dir"));
        let file = table.lookup(Path::new("/dir/sub/file"));
        let sibling = table.lookup(Path::new("/dirt"));

        table.rename(Path::new("/dir"), Path::new("/moved"));

        assert_eq!(table.path(dir), Some(PathBuf::from("/moved")));
        assert_eq!(table.path(file), Some(PathBuf::from("/moved/sub/file")));
        assert_eq!(table.path(sibling), Some(PathBuf::from("/dirt")));
        assert_eq!(table.lookup(Path::new("/moved/sub/file")), file);
    }

    #[test]
    fn test_hard_links_get_distinct_inodes() {
        // Paths, not host objects, are the key
        let mut table = InodeTable::new();
        let first = table.lookup(Path::new("/a"));
        let link = table.lookup(Path::new("/a-link"));
        assert_ne!(first, link);

        table.unlink(Path::new("/a"));
        assert_eq!(table.path(link), Some(PathBuf::from("/a-link")));
    }
}
