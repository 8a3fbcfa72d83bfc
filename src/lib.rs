//! JDE inference runner
//!
//! Runs a joint detection and embedding model either against an NPU
//! daemon over a socket (host-simulated) or on the NPU driver loaded
//! in-process (device-native).

pub mod config;
pub mod daemon;
pub mod embedded;
pub mod engine;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod utils;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, RunStats};
