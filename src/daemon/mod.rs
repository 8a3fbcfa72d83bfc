//! NPU daemon: wire protocol and server

pub mod protocol;
pub mod server;

pub use server::NpuDaemon;
