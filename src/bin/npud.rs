//! NPU daemon
//!
//! Serves the host-simulated backend: loads graphs sent by runners and
//! executes them on the reference CPU graph or, with `daemon.driver_lib`
//! set, on the NPU driver.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use jde_runner::config::Config;
use jde_runner::daemon::NpuDaemon;

#[derive(Debug, Parser)]
#[command(name = "jde-npud", version, about = "NPU daemon for the host-simulated backend")]
struct Cli {
    /// TOML config; `config.toml` or defaults when omitted.
    #[arg(long = "config", value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load(Config::default_path()).unwrap_or_else(|e| {
            eprintln!("Using default config ({})", e);
            Config::default()
        }),
    };
    jde_runner::logging::init(&config.logging)?;

    info!("Starting NPU daemon v{}", env!("CARGO_PKG_VERSION"));
    let daemon = NpuDaemon::bind(&config.daemon).await?;
    info!("Listening on {}", config.daemon.listen);

    daemon
        .serve_until(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    info!("Goodbye!");
    Ok(())
}
