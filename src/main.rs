//! JDE inference runner
//!
//! Standalone frame loop over an image directory, backed either by the NPU
//! daemon (host) or the in-process NPU driver (device).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use jde_runner::config::Config;
use jde_runner::engine::model::ModelArtifact;
use jde_runner::engine::{BackendKind, ImageSequenceSource};
use jde_runner::Pipeline;

#[derive(Debug, Parser)]
#[command(name = "jde-runner", version, about = "JDE inference runner")]
struct Cli {
    /// Defaults to `run` with default arguments.
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the frame loop over an image file or directory.
    Run(RunArgs),
    /// Wrap a converted graph and its JSON manifest into a `.jdem` artifact.
    Pack(PackArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// TOML config; `config.toml` or defaults when omitted.
    #[arg(long = "config", value_name = "PATH")]
    config: Option<PathBuf>,
    /// Image file or directory of frames.
    #[arg(long = "source", value_name = "PATH", default_value = "frames")]
    source: PathBuf,
    /// Override `runtime.backend` (host | device).
    #[arg(long = "backend", value_name = "KIND")]
    backend: Option<BackendKind>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            config: None,
            source: PathBuf::from("frames"),
            backend: None,
        }
    }
}

#[derive(Debug, Args)]
struct PackArgs {
    /// Manifest JSON describing the graph.
    #[arg(long = "manifest", value_name = "PATH")]
    manifest: PathBuf,
    /// Converted graph blob (e.g. an `.rknn` file).
    #[arg(long = "graph", value_name = "PATH")]
    graph: PathBuf,
    /// Output artifact path.
    #[arg(long = "out", value_name = "PATH")]
    out: PathBuf,
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load(Config::default_path()).unwrap_or_else(|e| {
            eprintln!("Using default config ({})", e);
            Config::default()
        }),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Pack(args) => {
            jde_runner::logging::init(&Default::default())?;
            ModelArtifact::pack(&args.manifest, &args.graph, &args.out)
                .with_context(|| format!("packing {}", args.graph.display()))?;
            Ok(())
        }
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.apply_env()?;
    if let Some(backend) = args.backend {
        config.runtime.backend = backend;
    }
    jde_runner::logging::init(&config.logging)?;

    let source = args.source;
    info!("Starting JDE runner v{}", env!("CARGO_PKG_VERSION"));
    info!("  Backend: {}", config.runtime.backend);
    info!("  Source: {}", source.display());

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current frame");
            stop_signal.store(true, Ordering::SeqCst);
        }
    });

    // the frame loop blocks on inference
    let stats = tokio::task::spawn_blocking(move || -> jde_runner::Result<_> {
        let mut pipeline = Pipeline::from_config(&config)?;
        let mut frames = ImageSequenceSource::open(&source)?;
        pipeline.run(&mut frames, &stop)
    })
    .await??;

    info!(
        "Done: {} frames, {} processed, {} skipped, {} detections, {:.1} fps",
        stats.frames,
        stats.processed,
        stats.skipped,
        stats.detections,
        stats.fps()
    );
    Ok(())
}
