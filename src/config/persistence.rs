use crate::config::paths::get_config_path;
use crate::config::schema::Config;
use crate::error::{DebloatError, Result};
use std::path::Path;

/// Load the configuration file.
///
/// An explicitly requested file must exist. The default location is optional:
/// when nothing is there the defaults apply and everything comes from the
/// command line.
pub fn load_config(explicit_path: Option<&Path>) -> Result<Config> {
    let config_path = match explicit_path {
        Some(path) => {
            if !path.is_file() {
                return Err(DebloatError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            path.to_path_buf()
        }
        None => {
            let default_path = get_config_path()?;
            if !default_path.is_file() {
                tracing::debug!("No config file at {}", default_path.display());
                return Ok(Config::default());
            }
            default_path
        }
    };

    tracing::debug!("Loading config from {}", config_path.display());
    let toml_content = std::fs::read_to_string(&config_path).map_err(|e| {
        DebloatError::Config(format!(
            "Failed to read config file {}: {}",
            config_path.display(),
            e
        ))
    })?;

    Ok(toml::from_str(&toml_content)?)
}
