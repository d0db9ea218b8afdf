use crate::error::{DebloatError, Result};
use directories::ProjectDirs;
use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    let path = path.trim();
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

pub fn get_config_dir() -> Result<PathBuf> {
    if let Ok(config_dir) = std::env::var("DEBLOATED_FS_CONFIG_DIR") {
        return Ok(PathBuf::from(config_dir));
    }

    ProjectDirs::from("", "", "debloated-fs")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .ok_or_else(|| {
            DebloatError::Config("Could not determine configuration directory".to_string())
        })
}

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("config.toml"))
}
