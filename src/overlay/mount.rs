use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};

use crate::config::LayerConfig;
use crate::error::{DebloatError, Result};
use crate::overlay::DebloatedFs;

/// Name reported as the mount source and subtype.
pub const FS_NAME: &str = "debloated_fs";

/// Filesystem type shown in the mount table.
pub const MOUNT_TYPE: &str = "fuse.debloated_fs";

const MOUNT_TABLE: &str = "/proc/self/mounts";

/// How often the mount table is checked for an external unmount.
const UNMOUNT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountSettings {
    pub allow_other: bool,
    pub auto_unmount: bool,
}

impl MountSettings {
    fn options(&self) -> Vec<fuser::MountOption> {
        let mut options = vec![
            fuser::MountOption::FSName(FS_NAME.to_string()),
            fuser::MountOption::Subtype(FS_NAME.to_string()),
        ];
        if self.allow_other {
            options.push(fuser::MountOption::AllowOther);
        }
        if self.auto_unmount {
            options.push(fuser::MountOption::AutoUnmount);
        }
        options
    }
}

/// Decode the octal escapes (`\040` for space and so on) used in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let value = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(value) = value {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Whether `mounts` (in `/proc/self/mounts` format) lists `mount_point` with
/// filesystem type `fstype`.
pub fn is_mounted_with_type(mounts: &str, mount_point: &Path, fstype: &str) -> bool {
    mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let (Some(_source), Some(target), Some(kind)) = (fields.next(), fields.next(), fields.next())
        else {
            return false;
        };
        kind == fstype && Path::new(&unescape_mount_field(target)) == mount_point
    })
}

fn is_mounted(mount_point: &Path) -> bool {
    match fs::read_to_string(MOUNT_TABLE) {
        Ok(mounts) => is_mounted_with_type(&mounts, mount_point, MOUNT_TYPE),
        Err(e) => {
            tracing::debug!("Cannot read {}: {}", MOUNT_TABLE, e);
            false
        }
    }
}

fn validate_mount_point(mount_point: &Path) -> Result<PathBuf> {
    let canonical = mount_point.canonicalize().map_err(|e| {
        DebloatError::Config(format!(
            "Invalid mount point {}: {}",
            mount_point.display(),
            e
        ))
    })?;
    if !canonical.is_dir() {
        return Err(DebloatError::Config(format!(
            "Mount point {} is not a directory",
            canonical.display()
        )));
    }
    Ok(canonical)
}

/// Mount the overlay in a background session.
///
/// Fails with [`DebloatError::AlreadyMounted`] when the mount point already
/// carries a debloated_fs mount.
pub fn spawn_overlay(
    config: Arc<LayerConfig>,
    mount_point: &Path,
    settings: MountSettings,
) -> Result<fuser::BackgroundSession> {
    let mount_point = validate_mount_point(mount_point)?;
    if mount_point.starts_with(&config.origin_root) || mount_point.starts_with(&config.cache_root) {
        return Err(DebloatError::Config(format!(
            "Mount point {} must not be inside a layer root",
            mount_point.display()
        )));
    }
    if is_mounted(&mount_point) {
        return Err(DebloatError::AlreadyMounted(mount_point));
    }

    tracing::info!(
        "Mounting {} at {} (origin={}, cache={})",
        MOUNT_TYPE,
        mount_point.display(),
        config.origin_root.display(),
        config.cache_root.display()
    );

    let fs = DebloatedFs::new(config);
    fuser::spawn_mount2(fs, &mount_point, &settings.options())
        .map_err(|e| DebloatError::Fuse(format!("FUSE mount failed: {}", e)))
}

/// Mount the overlay and serve it until SIGINT or SIGTERM arrives or the
/// filesystem is unmounted from outside.
pub async fn mount_overlay(
    config: Arc<LayerConfig>,
    mount_point: &Path,
    settings: MountSettings,
) -> Result<()> {
    let mount_point = validate_mount_point(mount_point)?;
    let session = spawn_overlay(config, &mount_point, settings)?;
    tracing::info!("Mounted at {}", mount_point.display());

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut poll = tokio::time::interval(UNMOUNT_POLL_INTERVAL);

    loop {
        tokio::select! {
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, unmounting");
                break;
            }
            _ = interrupt.recv() => {
                tracing::info!("Received SIGINT, unmounting");
                break;
            }
            _ = poll.tick() => {
                if !is_mounted(&mount_point) && Path::new(MOUNT_TABLE).exists() {
                    tracing::info!("{} was unmounted externally", mount_point.display());
                    break;
                }
            }
        }
    }

    drop(session);
    tracing::info!("FUSE filesystem unmounted");
    Ok(())
}
