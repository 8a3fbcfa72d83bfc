//! Runner configuration
//!
//! Loaded from a TOML file, then overridden by `JDE_*` environment variables.
//! The backend is chosen here at process start; both backends are always
//! compiled in.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::engine::backend::{BackendKind, TargetVariant};
use crate::engine::model::latest_checkpoint;
use crate::engine::preprocess::InputSize;
use crate::error::{Error, Result};

/// Artifact used when neither `model.path` nor `model.workspace` is set
pub const DEFAULT_MODEL_PATH: &str = "models/jde.jdem";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub runtime: RuntimeConfig,
    pub model: ModelConfig,
    pub input: InputConfig,
    pub host: HostConfig,
    pub device: DeviceConfig,
    pub daemon: DaemonConfig,
    pub output: OutputConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub backend: BackendKind,
    pub target: TargetVariant,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Explicit artifact path; takes precedence over `workspace`
    pub path: Option<PathBuf>,
    /// Training workspace holding `checkpoint/{savename}-ckpt-NNN.jdem`
    pub workspace: Option<PathBuf>,
    pub savename: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Network input size `[width, height]`; defaults to the model's first size
    pub in_size: Option<[u32; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `host:port` or `unix:/path/to/socket`
    pub daemon_addr: String,
    pub connect_timeout_ms: u64,
    /// 0 disables the socket timeout (inference blocks until the daemon answers)
    pub io_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub driver_lib: PathBuf,
    /// Vision runtime library preloaded for the RC target
    pub vision_lib: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen: String,
    /// When set, the daemon also serves `rknn` graphs through the native driver
    pub driver_lib: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub conf_threshold: f32,
    /// NMS only runs when a threshold is configured
    pub nms_threshold: Option<f32>,
    pub render_dir: Option<PathBuf>,
    pub json_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_consecutive_failures: usize,
    pub print_interval: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            workspace: None,
            savename: "jde".to_string(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            daemon_addr: "127.0.0.1:50551".to_string(),
            connect_timeout_ms: 2000,
            io_timeout_ms: 0,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            driver_lib: PathBuf::from("/usr/lib/librknnmrt.so"),
            vision_lib: None,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:50551".to_string(),
            driver_lib: None,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            conf_threshold: 0.5,
            nms_threshold: None,
            render_dir: None,
            json_path: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 30,
            print_interval: 40,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn default_path() -> &'static str {
        "config.toml"
    }

    /// Apply `JDE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("JDE_BACKEND") {
            self.runtime.backend = v.parse()?;
        }
        if let Some(v) = lookup("JDE_TARGET") {
            self.runtime.target = v.parse()?;
        }
        if let Some(v) = lookup("JDE_MODEL") {
            self.model.path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("JDE_DAEMON_ADDR") {
            self.host.daemon_addr = v;
        }
        if let Some(v) = lookup("JDE_DRIVER_LIB") {
            self.device.driver_lib = PathBuf::from(v);
        }
        if let Some(v) = lookup("JDE_VISION_LIB") {
            self.device.vision_lib = Some(PathBuf::from(v));
        }
        Ok(())
    }

    /// Check the settings that can be verified before touching any backend.
    pub fn validate(&self) -> Result<()> {
        if self.model.path.is_none() && self.model.workspace.is_some() && self.model.savename.is_empty() {
            return Err(Error::Configuration("model.savename is empty".into()));
        }

        match self.runtime.backend {
            BackendKind::Host => {
                if self.host.daemon_addr.trim().is_empty() {
                    return Err(Error::Configuration("host.daemon_addr is empty".into()));
                }
            }
            BackendKind::Device => {
                if self.device.driver_lib.as_os_str().is_empty() {
                    return Err(Error::Configuration("device.driver_lib is empty".into()));
                }
                if self.runtime.target == TargetVariant::Rc && self.device.vision_lib.is_none() {
                    return Err(Error::Configuration(
                        "target \"rc\" requires device.vision_lib".into(),
                    ));
                }
            }
        }

        if let Some([w, h]) = self.input.in_size {
            if w == 0 || h == 0 {
                return Err(Error::Configuration(format!("invalid input.in_size {}x{}", w, h)));
            }
        }
        if !(0.0..=1.0).contains(&self.output.conf_threshold) {
            return Err(Error::Configuration(format!(
                "output.conf_threshold {} outside [0, 1]",
                self.output.conf_threshold
            )));
        }
        if let Some(nms) = self.output.nms_threshold {
            if !(nms > 0.0 && nms <= 1.0) {
                return Err(Error::Configuration(format!(
                    "output.nms_threshold {} outside (0, 1]",
                    nms
                )));
            }
        }
        if self.pipeline.max_consecutive_failures == 0 {
            return Err(Error::Configuration(
                "pipeline.max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Model artifact to load: the explicit path, else the newest checkpoint
    /// in the workspace, else [`DEFAULT_MODEL_PATH`].
    pub fn resolve_model_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.model.path {
            return Ok(path.clone());
        }
        match &self.model.workspace {
            Some(workspace) => latest_checkpoint(workspace, &self.model.savename),
            None => Ok(PathBuf::from(DEFAULT_MODEL_PATH)),
        }
    }

    pub fn in_size(&self) -> Option<InputSize> {
        self.input.in_size.map(|[w, h]| InputSize::new(w, h))
    }
}
