//! Tracing subscriber setup

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level. Safe to call more than once; later calls are ignored.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Configuration(format!("invalid log level {:?}: {}", config.level, e)))?;

    let builder = FmtSubscriber::builder().with_env_filter(filter).with_target(false);

    let installed = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
        }
        None => builder.try_init(),
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
    Ok(())
}
