#![cfg(target_os = "linux")]

use debloated_fs::overlay::is_mounted_with_type;
use debloated_fs::overlay::mount::{spawn_overlay, MountSettings, MOUNT_TYPE};
use debloated_fs::{DebloatError, LayerConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TEST_SETUP_DELAY_MS: u64 = 300;

struct MountWorkspace {
    _temp_dir: tempfile::TempDir,
    origin: PathBuf,
    cache: PathBuf,
    mount_point: PathBuf,
}

impl MountWorkspace {
    fn new() -> Self {
        let temp_dir = tempfile::tempdir().unwrap();
        let origin = temp_dir.path().join("lower");
        let cache = temp_dir.path().join("upper");
        let mount_point = temp_dir.path().join("mnt");
        for dir in [&origin, &cache, &mount_point] {
            fs::create_dir(dir).unwrap();
        }
        fs::create_dir(origin.join("docs")).unwrap();
        fs::write(origin.join("docs/readme.txt"), "hello").unwrap();

        MountWorkspace {
            _temp_dir: temp_dir,
            origin,
            cache,
            mount_point,
        }
    }

    fn config(&self) -> Arc<LayerConfig> {
        Arc::new(LayerConfig::new(&self.origin, &self.cache, None).unwrap())
    }

    fn settings() -> MountSettings {
        MountSettings {
            allow_other: false,
            auto_unmount: false,
        }
    }

    fn mount(&self) -> Option<fuser::BackgroundSession> {
        if !Path::new("/dev/fuse").exists() {
            eprintln!("Skipping real FUSE test - /dev/fuse not available");
            return None;
        }
        match spawn_overlay(self.config(), &self.mount_point, Self::settings()) {
            Ok(session) => {
                thread::sleep(Duration::from_millis(TEST_SETUP_DELAY_MS));
                Some(session)
            }
            Err(e) => {
                eprintln!("Skipping real FUSE test - mount failed: {}", e);
                None
            }
        }
    }
}

#[test]
fn test_fuse_read_materializes_into_cache() {
    let ws = MountWorkspace::new();
    let Some(session) = ws.mount() else {
        return;
    };

    let through_mount = fs::read_to_string(ws.mount_point.join("docs/readme.txt"));
    let cached = ws.cache.join("docs/readme.txt").is_file();

    fs::write(ws.mount_point.join("docs/readme.txt"), "world").unwrap();
    let rewritten = fs::read_to_string(ws.mount_point.join("docs/readme.txt"));

    drop(session);

    assert_eq!(through_mount.unwrap(), "hello");
    assert!(cached);
    assert_eq!(rewritten.unwrap(), "world");
    assert_eq!(
        fs::read_to_string(ws.origin.join("docs/readme.txt")).unwrap(),
        "hello"
    );
    assert_eq!(
        fs::read_to_string(ws.cache.join("docs/readme.txt")).unwrap(),
        "world"
    );
}

#[test]
fn test_fuse_listing_and_new_files() {
    let ws = MountWorkspace::new();
    let Some(session) = ws.mount() else {
        return;
    };

    let mut names: Vec<String> = fs::read_dir(ws.mount_point.join("docs"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();

    fs::write(ws.mount_point.join("notes.txt"), "new").unwrap();
    fs::remove_file(ws.mount_point.join("docs/readme.txt")).unwrap();
    let after_delete = ws.mount_point.join("docs/readme.txt").exists();

    drop(session);

    assert_eq!(names, vec!["readme.txt"]);
    assert!(!after_delete);
    assert_eq!(
        fs::read_to_string(ws.cache.join("notes.txt")).unwrap(),
        "new"
    );
    assert!(!ws.origin.join("notes.txt").exists());
    assert!(ws.origin.join("docs/readme.txt").exists());
}

#[test]
fn test_fuse_second_mount_is_reported() {
    let ws = MountWorkspace::new();
    let Some(session) = ws.mount() else {
        return;
    };

    let mounts = fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    let listed = is_mounted_with_type(
        &mounts,
        &ws.mount_point.canonicalize().unwrap(),
        MOUNT_TYPE,
    );
    let second = spawn_overlay(ws.config(), &ws.mount_point, MountWorkspace::settings());

    drop(session);

    assert!(listed);
    assert!(matches!(second, Err(DebloatError::AlreadyMounted(_))));
}

#[test]
fn test_mount_point_inside_layer_is_rejected() {
    let ws = MountWorkspace::new();
    let inside = ws.cache.join("mnt");
    fs::create_dir(&inside).unwrap();

    let err = spawn_overlay(ws.config(), &inside, MountWorkspace::settings())
        .err()
        .unwrap();
    assert!(matches!(err, DebloatError::Config(_)));
}
