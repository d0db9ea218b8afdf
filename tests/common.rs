use debloated_fs::{LayerConfig, Overlay};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Path of the built binary.
#[allow(dead_code)]
pub fn get_debloated_fs_path() -> PathBuf {
    assert_cmd::cargo::cargo_bin!("debloated-fs").to_path_buf()
}

/// An origin tree, a cache tree and an engine over them, all in one
/// temporary directory. Used by various test files - #[allow(dead_code)]
/// because not all tests use all fields.
#[allow(dead_code)]
pub struct OverlayFixture {
    pub temp_dir: TempDir,
    pub origin: PathBuf,
    pub cache: PathBuf,
    pub overlay: Overlay,
}

impl Default for OverlayFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl OverlayFixture {
    pub fn new() -> Self {
        Self::with_origin(|_| {})
    }

    /// Build a fixture after letting `setup` populate the origin tree.
    pub fn with_origin<F>(setup: F) -> Self
    where
        F: FnOnce(&Path),
    {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let origin = temp_dir.path().join("lower");
        let cache = temp_dir.path().join("upper");
        fs::create_dir(&origin).unwrap();
        fs::create_dir(&cache).unwrap();
        setup(&origin);

        let config = LayerConfig::new(&origin, &cache, None).expect("Failed to build config");
        let origin = config.origin_root.clone();
        let cache = config.cache_root.clone();
        OverlayFixture {
            temp_dir,
            origin,
            cache,
            overlay: Overlay::new(Arc::new(config)),
        }
    }

    /// Names in one full listing of `logical`, sorted, without `.` and `..`.
    pub fn list(&self, logical: &str) -> Vec<String> {
        let fh = self
            .overlay
            .opendir(Path::new(logical))
            .expect("opendir failed");
        let mut names = Vec::new();
        self.overlay
            .readdir(fh, 0, |entry, _| {
                names.push(entry.name.to_string_lossy().to_string());
                false
            })
            .expect("readdir failed");
        self.overlay.releasedir(fh).expect("releasedir failed");

        names.retain(|n| n != "." && n != "..");
        names.sort();
        names
    }

    pub fn read_all(&self, logical: &str) -> Vec<u8> {
        let size = self
            .overlay
            .getattr(Path::new(logical), None)
            .expect("getattr failed")
            .len() as usize;
        let mut buf = vec![0u8; size];
        let n = self
            .overlay
            .read(Path::new(logical), None, &mut buf, 0)
            .expect("read failed");
        buf.truncate(n);
        buf
    }

    /// Every file name under the cache root, relative to it.
    pub fn cache_tree(&self) -> Vec<String> {
        let mut names: Vec<String> = walkdir::WalkDir::new(&self.cache)
            .min_depth(1)
            .into_iter()
            .map(|e| {
                e.unwrap()
                    .path()
                    .strip_prefix(&self.cache)
                    .unwrap()
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        names.sort();
        names
    }
}
