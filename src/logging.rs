//! Logging setup for the pipeline stages
//!
//! Each stage logs to stderr and to its own plain-text file in the working
//! directory (`ml_dataset.log`, `ml_train_fold<f>.log`, `ml_apply.log`).
//! `RUST_LOG` overrides the default level.

use crate::{Error, Result};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber
///
/// # Errors
/// Returns error if the log file cannot be created or a global subscriber is
/// already installed
pub fn init(log_file: &Path, default_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let file = File::create(log_file)?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to install logger: {e}")))
}
