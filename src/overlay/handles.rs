use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::overlay::readdir::{DirEntry, DirStream};

thread_local! {
    pub(crate) static READ_BUFFER: RefCell<Vec<u8>> = RefCell::new(Vec::with_capacity(128 * 1024));
}

/// An open file bound to the physical path it was opened at.
#[derive(Debug)]
pub struct FileHandle {
    pub file: File,
    pub path: PathBuf,
}

/// An in-progress directory listing.
///
/// Entries pulled from the stream are kept so a listing can be resumed at any
/// offset the kernel hands back.
pub struct DirHandle {
    cursor: Mutex<DirCursor>,
}

struct DirCursor {
    stream: DirStream,
    entries: Vec<DirEntry>,
}

impl DirHandle {
    pub fn new(stream: DirStream) -> Self {
        DirHandle {
            cursor: Mutex::new(DirCursor {
                stream,
                entries: Vec::new(),
            }),
        }
    }

    /// Visit entries from `offset` on. `visit` receives each entry with the
    /// offset of the entry after it and returns true to stop.
    pub fn visit_from<F>(&self, offset: usize, mut visit: F)
    where
        F: FnMut(&DirEntry, usize) -> bool,
    {
        let mut cursor = self.cursor.lock();
        let mut idx = offset;
        loop {
            while cursor.entries.len() <= idx {
                match cursor.stream.next() {
                    Some(entry) => cursor.entries.push(entry),
                    None => return,
                }
            }
            if visit(&cursor.entries[idx], idx + 1) {
                return;
            }
            idx += 1;
        }
    }
}

/// Open handles indexed by the `u64` the kernel holds on to.
pub struct HandleTable<T> {
    handles: RwLock<FxHashMap<u64, Arc<T>>>,
    next: AtomicU64,
}

impl<T> HandleTable<T> {
    /// Create an empty table. Keys start at 1.
    pub fn new() -> Self {
        HandleTable {
            handles: RwLock::new(FxHashMap::default()),
            next: AtomicU64::new(1),
        }
    }

    /// Store `handle` and return its key, or `ENOMEM` if the table cannot grow.
    pub fn insert(&self, handle: T) -> Result<u64, libc::c_int> {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.handles.write();
        handles.try_reserve(1).map_err(|_| libc::ENOMEM)?;
        handles.insert(fh, Arc::new(handle));
        Ok(fh)
    }

    /// Look up an open handle.
    ///
    /// # Returns
    /// A shared reference that stays valid after a concurrent `remove`, or
    /// `None` if `fh` is not open
    pub fn get(&self, fh: u64) -> Option<Arc<T>> {
        self.handles.read().get(&fh).cloned()
    }

    /// Take `fh` out of the table. The handle is dropped (and its file
    /// closed) once the last outstanding `get` reference goes away.
    pub fn remove(&self, fh: u64) -> Option<Arc<T>> {
        self.handles.write().remove(&fh)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
