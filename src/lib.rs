pub mod chroot;
pub mod cli;
pub mod config;
pub mod error;
pub mod executor;
pub mod snap;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

use crate::error::ChimgError;
use crate::executor::CommandExecutor;

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Loads the configuration and applies it to the given rootfs.
pub fn run_apply(opts: &cli::ApplyArgs, executor: Arc<dyn CommandExecutor>) -> Result<()> {
    let config = config::load_config(opts.common.file.as_path())
        .with_context(|| format!("failed to load config from {}", opts.common.file))?;

    if !opts.rootfs.is_dir() {
        return Err(ChimgError::Precondition(format!(
            "rootfs path is not a directory: {}",
            opts.rootfs
        ))
        .into());
    }

    let chroot = chroot::Chroot::new(&opts.rootfs, config, executor);
    chroot.apply()
}

/// Loads and validates the configuration without touching any filesystem.
pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let config = config::load_config(opts.common.file.as_path())?;
    info!("validation successful:\n{:#?}", config);
    Ok(())
}
