use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "debloated-fs", version)]
#[command(
    about = "Mount an overlay that copies files from an origin tree into a cache tree on first access"
)]
pub struct Args {
    #[arg(help = "Directory to mount the overlay on")]
    pub mountpoint: PathBuf,

    #[arg(long, value_name = "DIR", help = "Read-only origin layer")]
    pub lowerdir: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Writable cache layer")]
    pub realdir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "HINT",
        help = "Optimization hint (reserved, currently ignored)"
    )]
    pub optimize: Option<String>,

    #[arg(long, value_name = "FILE", help = "Config file (defaults to the user config dir)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Allow other users to access the mount")]
    pub allow_other: bool,

    #[arg(
        long,
        value_name = "BOOL",
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Unmount automatically when the process exits"
    )]
    pub auto_unmount: Option<bool>,
}
