//! Logger installation for binaries and tests embedding the scheduler.
//!
//! Library code logs through `tracing` macros; with tracing's `log` feature
//! those records reach whichever `log` logger is installed, here `env_logger`.

use std::fs;
use std::path::PathBuf;

use eyre::{Context, Result};
use log::info;

use crate::config::LoggingConfig;

/// Default log file location: `<data_local_dir>/taskqueue/logs/taskqueue.log`
pub fn default_log_file() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(env!("CARGO_PKG_NAME"))
        .join("logs")
        .join(format!("{}.log", env!("CARGO_PKG_NAME")))
}

/// Install env_logger. RUST_LOG overrides the configured level.
pub fn setup_logging(config: &LoggingConfig) -> Result<()> {
    let env = env_logger::Env::default().default_filter_or(config.level.as_str());
    let mut builder = env_logger::Builder::from_env(env);

    if let Some(log_file) = &config.file {
        if let Some(log_dir) = log_file.parent()
            && !log_dir.as_os_str().is_empty()
        {
            fs::create_dir_all(log_dir).context("Failed to create log directory")?;
        }

        let target = Box::new(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .context("Failed to open log file")?,
        );
        builder.target(env_logger::Target::Pipe(target));
    }

    builder.try_init().context("Logger already initialized")?;

    match &config.file {
        Some(log_file) => info!("Logging initialized, writing to: {}", log_file.display()),
        None => info!("Logging initialized"),
    }
    Ok(())
}
