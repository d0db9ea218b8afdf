use serde::{Deserialize, Serialize};

/// Layer roots as written in the config file. Paths may use `~/`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LayersConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lowerdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_other: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_unmount: Option<bool>,
}

impl MountConfig {
    pub fn get_allow_other(&self) -> bool {
        self.allow_other.unwrap_or_else(super::default_allow_other)
    }

    pub fn get_auto_unmount(&self) -> bool {
        self.auto_unmount.unwrap_or_else(super::default_auto_unmount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub layers: LayersConfig,
    #[serde(default)]
    pub mount: MountConfig,
}
