use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DebloatError>;

#[derive(Error, Debug)]
pub enum DebloatError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("FUSE error: {0}")]
    Fuse(String),

    #[error("Already mounted: {0}")]
    AlreadyMounted(PathBuf),
}

impl From<toml::de::Error> for DebloatError {
    fn from(err: toml::de::Error) -> Self {
        DebloatError::Config(format!("Failed to parse config: {}", err))
    }
}
