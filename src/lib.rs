pub mod cli;
pub mod config;
pub mod error;
pub mod overlay;

pub use config::expand_tilde;
pub use config::get_config_path;
pub use config::load_config;
pub use config::Config;
pub use config::LayerConfig;

pub use error::{DebloatError, Result};

pub use overlay::{mount_overlay, DebloatedFs, MaterializationState, Overlay, Redirector};
