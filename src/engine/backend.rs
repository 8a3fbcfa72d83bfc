//! Inference engine abstraction
//!
//! [`InferenceEngine`] owns one [`Backend`], injected at process start. A
//! backend loads a model artifact into a [`LoadedModel`], which the engine
//! wraps in a [`ModelHandle`]. Handles release their backend resources on
//! [`InferenceEngine::shutdown`] or on drop, whichever comes first.
//!
//! Both backends return the tensors described by the artifact's
//! [`OutputSchema`], so the output stage never needs to know which one ran.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::device::DeviceBackend;
use super::host::HostBackend;
use super::model::{ModelArtifact, ModelManifest, OutputSchema};
use super::preprocess::{InputSize, PreparedTensor, ResizeInfo};
use crate::config::Config;
use crate::error::{Error, Result};

/// Which inference path a process uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Requests proxied to the NPU daemon
    #[default]
    Host,
    /// Vendor NPU driver loaded in-process
    Device,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Host => "host",
            BackendKind::Device => "device",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(BackendKind::Host),
            "device" => Ok(BackendKind::Device),
            other => Err(Error::Configuration(format!("unknown backend {:?}", other))),
        }
    }
}

/// Board variant. `Rc` additionally preloads the vision runtime library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetVariant {
    Rc,
    #[default]
    Generic,
}

impl FromStr for TargetVariant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rc" => Ok(TargetVariant::Rc),
            "generic" | "other" => Ok(TargetVariant::Generic),
            other => Err(Error::Configuration(format!("unknown target {:?}", other))),
        }
    }
}

/// One raw output tensor, always an owned copy
#[derive(Debug, Clone, PartialEq)]
pub struct OutputTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl OutputTensor {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }
}

/// Raw outputs of one forward pass, tied to the tensor that produced them
#[derive(Debug, Clone)]
pub struct InferenceResult {
    pub tensors: Vec<OutputTensor>,
    pub input_size: InputSize,
    pub resize: ResizeInfo,
    pub frame_index: u64,
}

impl InferenceResult {
    pub fn tensor(&self, name: &str) -> Option<&OutputTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }
}

/// A backend able to load model artifacts
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Load `artifact`. Unreachable daemons/drivers are resource errors,
    /// unusable artifacts are load errors.
    fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>>;
}

/// A model resident in a backend
pub trait LoadedModel: Send {
    /// Run one forward pass. Blocks until the daemon or driver answers.
    fn run(&mut self, input: &PreparedTensor) -> Result<Vec<OutputTensor>>;

    /// Input sizes the loaded graph actually accepts, a subset of the
    /// manifest's. A compiled NPU graph has exactly one.
    fn input_sizes(&self) -> Vec<InputSize>;

    /// Free backend resources. Must tolerate repeated calls.
    fn release(&mut self);
}

enum HandleState {
    Uninitialized,
    Ready(Box<dyn LoadedModel>),
    Released,
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Exclusive owner of a loaded model
pub struct ModelHandle {
    id: u64,
    backend: Option<BackendKind>,
    manifest: Option<ModelManifest>,
    input_sizes: Vec<InputSize>,
    state: HandleState,
}

impl ModelHandle {
    /// A handle that was never initialized; every `infer` on it is rejected.
    pub fn uninitialized() -> Self {
        Self {
            id: 0,
            backend: None,
            manifest: None,
            input_sizes: Vec::new(),
            state: HandleState::Uninitialized,
        }
    }

    fn ready(backend: BackendKind, manifest: ModelManifest, model: Box<dyn LoadedModel>) -> Self {
        let declared = manifest.input_sizes();
        let input_sizes = model
            .input_sizes()
            .into_iter()
            .filter(|s| declared.contains(s))
            .collect();
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            backend: Some(backend),
            manifest: Some(manifest),
            input_sizes,
            state: HandleState::Ready(model),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, HandleState::Ready(_))
    }

    pub fn backend(&self) -> Option<BackendKind> {
        self.backend
    }

    pub fn manifest(&self) -> Option<&ModelManifest> {
        self.manifest.as_ref()
    }

    /// Sizes the loaded model runs; empty unless the handle is ready.
    pub fn input_sizes(&self) -> Vec<InputSize> {
        self.input_sizes.clone()
    }

    pub fn schema(&self) -> Option<OutputSchema> {
        self.manifest.as_ref().map(|m| m.schema())
    }

    fn release(&mut self) -> bool {
        match std::mem::replace(&mut self.state, HandleState::Released) {
            HandleState::Ready(mut model) => {
                model.release();
                true
            }
            HandleState::Uninitialized => {
                self.state = HandleState::Uninitialized;
                false
            }
            HandleState::Released => false,
        }
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            HandleState::Uninitialized => "uninitialized",
            HandleState::Ready(_) => "ready",
            HandleState::Released => "released",
        };
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("state", &state)
            .finish()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        if self.release() {
            debug!("Model handle {} released on drop", self.id);
        }
    }
}

/// Backend-agnostic inference entry point
pub struct InferenceEngine {
    backend: Box<dyn Backend>,
}

impl InferenceEngine {
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Build the backend named by the configuration. There is no fallback.
    pub fn from_config(config: &Config) -> Result<Self> {
        let backend: Box<dyn Backend> = match config.runtime.backend {
            BackendKind::Host => Box::new(HostBackend::new(config.host.clone())),
            BackendKind::Device => Box::new(DeviceBackend::new(
                config.device.clone(),
                config.runtime.target,
            )),
        };
        info!("Inference backend: {}", backend.kind());
        Ok(Self::new(backend))
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Load and validate the artifact at `model_path`.
    pub fn initialize(&self, model_path: impl AsRef<std::path::Path>) -> Result<ModelHandle> {
        let start = Instant::now();
        let artifact = ModelArtifact::load(model_path)?;
        let model = self.backend.load(&artifact)?;

        let handle = ModelHandle::ready(self.backend.kind(), artifact.manifest, model);
        if handle.input_sizes.is_empty() {
            return Err(Error::load(
                &artifact.path,
                "loaded graph accepts none of the manifest's input sizes",
            ));
        }
        info!(
            "Model handle {} ready on {} backend in {:?}",
            handle.id,
            self.backend.kind(),
            start.elapsed()
        );
        Ok(handle)
    }

    /// Run one forward pass. The handle is borrowed mutably, so only one
    /// request can be in flight per handle.
    pub fn infer(&self, handle: &mut ModelHandle, input: &PreparedTensor) -> Result<InferenceResult> {
        let supported = handle.input_sizes();
        let model = match &mut handle.state {
            HandleState::Ready(model) => model,
            HandleState::Uninitialized => {
                return Err(Error::Resource("model handle was never initialized".into()))
            }
            HandleState::Released => {
                return Err(Error::Resource(format!("model handle {} already released", handle.id)))
            }
        };

        if input.shape() != input.size.tensor_shape() || !supported.contains(&input.size) {
            return Err(Error::Size {
                requested: input.size,
                supported,
            });
        }

        let start = Instant::now();
        let tensors = model.run(input)?;
        debug!(
            "Frame {} inferred at {} in {:?}",
            input.frame_index,
            input.size,
            start.elapsed()
        );

        Ok(InferenceResult {
            tensors,
            input_size: input.size,
            resize: input.resize,
            frame_index: input.frame_index,
        })
    }

    /// Release the handle's resources. Repeated calls are no-ops.
    pub fn shutdown(&self, handle: &mut ModelHandle) {
        if handle.release() {
            info!("Model handle {} shut down", handle.id);
        } else {
            warn!("Model handle {} has nothing to release", handle.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::frame::{PixelFormat, RawFrame};
    use crate::engine::model::tests::manifest;
    use crate::engine::model::GraphFormat;
    use crate::engine::preprocess::InputEngine;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct CountingBackend {
        releases: Arc<AtomicUsize>,
    }

    struct CountingModel {
        releases: Arc<AtomicUsize>,
        released: bool,
    }

    impl Backend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Host
        }

        fn load(&self, _artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>> {
            Ok(Box::new(CountingModel {
                releases: self.releases.clone(),
                released: false,
            }))
        }
    }

    impl LoadedModel for CountingModel {
        fn run(&mut self, input: &PreparedTensor) -> Result<Vec<OutputTensor>> {
            let sum: f32 = input.as_slice().iter().sum();
            Ok(vec![OutputTensor::new("sum", vec![1], vec![sum])])
        }

        fn input_sizes(&self) -> Vec<InputSize> {
            vec![InputSize::new(64, 32)]
        }

        fn release(&mut self) {
            if !self.released {
                self.released = true;
                self.releases.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn write_model(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("m.jdem");
        ModelArtifact::new(manifest(GraphFormat::Reference), vec![0; 4])
            .save(&path)
            .unwrap();
        path
    }

    fn tensor(size: InputSize) -> PreparedTensor {
        let frame = RawFrame::new(640, 480, PixelFormat::Rgb8, vec![90; 640 * 480 * 3]);
        InputEngine::new(vec![size]).prepare(&frame, size).unwrap()
    }

    #[test]
    fn test_uninitialized_handle_is_resource_error() {
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::new(Box::new(CountingBackend { releases }));
        let mut handle = ModelHandle::uninitialized();

        let input = tensor(InputSize::new(576, 320));
        assert_eq!(input.shape(), &[3, 320, 576]);
        let err = engine.infer(&mut handle, &input).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_missing_model_is_load_error() {
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::new(Box::new(CountingBackend { releases }));
        let result = engine.initialize("/definitely/not/here.jdem");
        assert!(matches!(result, Err(Error::Load { .. })));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::new(Box::new(CountingBackend {
            releases: releases.clone(),
        }));

        let mut handle = engine.initialize(write_model(dir.path())).unwrap();
        assert!(handle.is_ready());

        engine.shutdown(&mut handle);
        engine.shutdown(&mut handle);
        drop(handle);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_released_handle_rejects_infer() {
        let dir = tempfile::tempdir().unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::new(Box::new(CountingBackend { releases }));

        let mut handle = engine.initialize(write_model(dir.path())).unwrap();
        engine.shutdown(&mut handle);

        let err = engine.infer(&mut handle, &tensor(InputSize::new(64, 32))).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_drop_releases_handle() {
        let dir = tempfile::tempdir().unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::new(Box::new(CountingBackend {
            releases: releases.clone(),
        }));

        {
            let _handle = engine.initialize(write_model(dir.path())).unwrap();
        }
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_input_size_is_size_error() {
        let dir = tempfile::tempdir().unwrap();
        let releases = Arc::new(AtomicUsize::new(0));
        let engine = InferenceEngine::new(Box::new(CountingBackend { releases }));
        let mut handle = engine.initialize(write_model(dir.path())).unwrap();

        let err = engine.infer(&mut handle, &tensor(InputSize::new(128, 64))).unwrap_err();
        assert!(matches!(err, Error::Size { .. }));

        let ok = engine.infer(&mut handle, &tensor(InputSize::new(64, 32))).unwrap();
        assert_eq!(ok.input_size, InputSize::new(64, 32));
    }

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("Host".parse::<BackendKind>().unwrap(), BackendKind::Host);
        assert_eq!("device".parse::<BackendKind>().unwrap(), BackendKind::Device);
        assert!("cpu".parse::<BackendKind>().is_err());
        assert_eq!("RC".parse::<TargetVariant>().unwrap(), TargetVariant::Rc);
        assert_eq!("other".parse::<TargetVariant>().unwrap(), TargetVariant::Generic);
    }
}
