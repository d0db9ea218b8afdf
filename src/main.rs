use clap::Parser;
use std::sync::Arc;

use debloated_fs::cli::{resolve_mount_plan, Args};
use debloated_fs::{load_config, mount_overlay, DebloatError};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("DEBLOATED_FS_LOG").unwrap_or_else(|_| "info".to_string()),
        )
        .init();

    match run().await {
        Ok(()) => {}
        Err(DebloatError::AlreadyMounted(path)) => {
            tracing::info!(
                "{} is already mounted as debloated_fs, nothing to do",
                path.display()
            );
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn run() -> debloated_fs::Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;
    let plan = resolve_mount_plan(&args, &config)?;

    mount_overlay(Arc::new(plan.layers), &plan.mount_point, plan.settings).await
}
