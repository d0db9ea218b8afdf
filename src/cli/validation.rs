use crate::cli::Args;
use crate::config::{expand_tilde, Config, LayerConfig};
use crate::error::{DebloatError, Result};
use crate::overlay::mount::MountSettings;
use std::path::PathBuf;

/// Everything needed to mount, merged from the command line and the config
/// file. Command-line values win.
#[derive(Debug)]
pub struct MountPlan {
    pub layers: LayerConfig,
    pub mount_point: PathBuf,
    pub settings: MountSettings,
}

fn pick_root(
    flag: &Option<PathBuf>,
    configured: &Option<String>,
    flag_name: &str,
    key: &str,
) -> Result<PathBuf> {
    flag.clone()
        .or_else(|| configured.as_deref().map(expand_tilde))
        .ok_or_else(|| {
            DebloatError::Config(format!(
                "Missing {}: pass it on the command line or set {} in the config file",
                flag_name, key
            ))
        })
}

pub fn resolve_mount_plan(args: &Args, config: &Config) -> Result<MountPlan> {
    let origin = pick_root(
        &args.lowerdir,
        &config.layers.lowerdir,
        "--lowerdir",
        "layers.lowerdir",
    )?;
    let cache = pick_root(
        &args.realdir,
        &config.layers.realdir,
        "--realdir",
        "layers.realdir",
    )?;
    let optimize = args
        .optimize
        .clone()
        .or_else(|| config.layers.optimize.clone());

    let layers = LayerConfig::new(&origin, &cache, optimize)?;
    let settings = MountSettings {
        allow_other: args.allow_other || config.mount.get_allow_other(),
        auto_unmount: args
            .auto_unmount
            .unwrap_or_else(|| config.mount.get_auto_unmount()),
    };

    Ok(MountPlan {
        layers,
        mount_point: args.mountpoint.clone(),
        settings,
    })
}
