//! Device-native backend
//!
//! Loads the vendor NPU runtime with `libloading`, initialises the graph
//! from the artifact, binds zero-copy buffers and converts the native
//! outputs into the shared output schema.

mod driver;
mod ffi;
pub mod layout;
mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use self::driver::{Context, Driver};
use self::layout::NativeOutput;
use self::memory::ZeroCopyMem;
use super::backend::{Backend, BackendKind, LoadedModel, OutputTensor, TargetVariant};
use super::model::{GraphFormat, ModelArtifact, OutputSchema};
use super::preprocess::{InputSize, PreparedTensor};
use crate::config::DeviceConfig;
use crate::error::{Error, Result};

/// Driver libraries, loaded on first use and kept for the process lifetime
struct Libraries {
    /// Held only to keep the vision runtime's symbols resident
    _vision: Option<libloading::Library>,
    driver: Arc<Driver>,
}

pub struct DeviceBackend {
    config: DeviceConfig,
    target: TargetVariant,
    libs: Mutex<Option<Libraries>>,
}

impl DeviceBackend {
    pub fn new(config: DeviceConfig, target: TargetVariant) -> Self {
        Self {
            config,
            target,
            libs: Mutex::new(None),
        }
    }

    fn driver(&self) -> Result<Arc<Driver>> {
        let mut libs = self.libs.lock();
        if let Some(libs) = libs.as_ref() {
            return Ok(libs.driver.clone());
        }

        let vision = match (self.target, &self.config.vision_lib) {
            (TargetVariant::Rc, Some(path)) => Some(driver::preload_global(path)?),
            (TargetVariant::Rc, None) => {
                return Err(Error::Configuration(
                    "target \"rc\" requires device.vision_lib".into(),
                ))
            }
            (TargetVariant::Generic, _) => None,
        };
        let driver = Driver::open(&self.config.driver_lib)?;

        *libs = Some(Libraries {
            _vision: vision,
            driver: driver.clone(),
        });
        Ok(driver)
    }
}

impl Backend for DeviceBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Device
    }

    fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>> {
        if artifact.manifest.graph_format != GraphFormat::Rknn {
            return Err(Error::load(
                &artifact.path,
                format!(
                    "device backend runs rknn graphs, artifact holds a {} graph",
                    artifact.manifest.graph_format
                ),
            ));
        }

        let driver = self.driver()?;
        let model = DeviceModel::load(driver, artifact)?;
        Ok(Box::new(model))
    }
}

/// A graph resident on the NPU
pub struct DeviceModel {
    // buffers before the context: fields drop in declaration order
    outputs: Vec<(ZeroCopyMem, NativeOutput)>,
    input: Option<ZeroCopyMem>,
    ctx: Option<Context>,
    input_size: InputSize,
    schema: OutputSchema,
    path: PathBuf,
}

// SAFETY: the raw buffers are only touched through `&mut self`, and the
// driver allows a context to be used from any single thread at a time.
unsafe impl Send for DeviceModel {}

impl DeviceModel {
    fn load(driver: Arc<Driver>, artifact: &ModelArtifact) -> Result<Self> {
        let path = artifact.path.clone();
        let ctx = Context::init(driver, &artifact.graph).map_err(|reason| Error::load(&path, reason))?;

        let (n_input, n_output) = ctx.io_num()?;
        if n_input != 1 {
            return Err(Error::load(&path, format!("graph has {} inputs, expected 1", n_input)));
        }

        let input_attr = ctx.input_attr_nhwc(0)?;
        let input_size = match input_attr.shape() {
            &[1, h, w, 3] => InputSize::new(w, h),
            other => {
                return Err(Error::load(
                    &path,
                    format!("graph input shape {:?} is not NHWC RGB", other),
                ))
            }
        };
        if !artifact.manifest.input_sizes().contains(&input_size) {
            return Err(Error::load(
                &path,
                format!("graph input {} is not declared in the manifest", input_size),
            ));
        }

        let schema = artifact.manifest.schema();
        let expected = schema.tensor_shapes(input_size);
        if n_output as usize != expected.len() {
            return Err(Error::load(
                &path,
                format!("graph has {} outputs, schema has {}", n_output, expected.len()),
            ));
        }

        let mut native = Vec::with_capacity(expected.len());
        for (i, (name, shape)) in expected.iter().enumerate() {
            let attr = ctx.output_attr_native(i as u32)?;
            let out = NativeOutput::from_attr(&attr).map_err(|reason| Error::load(&path, reason))?;
            if (out.spatial, out.channels) != (shape[0], shape[1]) {
                return Err(Error::load(
                    &path,
                    format!(
                        "output {} ({:?}) has {} x {} values, schema expects {:?} for {}",
                        i, out.name, out.spatial, out.channels, shape, name
                    ),
                ));
            }
            debug!("Output {} {:?} -> {} {:?} ({:?})", i, out.name, name, shape, out.layout);
            native.push((attr, out));
        }

        let input = ZeroCopyMem::bind(&ctx, input_attr)?;
        let mut outputs = Vec::with_capacity(native.len());
        for (attr, out) in native {
            outputs.push((ZeroCopyMem::bind(&ctx, attr)?, out));
        }

        info!("NPU graph ready: input {}, {} outputs", input_size, outputs.len());
        Ok(Self {
            outputs,
            input: Some(input),
            ctx: Some(ctx),
            input_size,
            schema,
            path,
        })
    }
}

impl LoadedModel for DeviceModel {
    fn run(&mut self, tensor: &PreparedTensor) -> Result<Vec<OutputTensor>> {
        let (ctx, input) = match (self.ctx.as_ref(), self.input.as_mut()) {
            (Some(ctx), Some(input)) => (ctx, input),
            _ => {
                return Err(Error::Resource(format!(
                    "NPU graph {} released",
                    self.path.display()
                )))
            }
        };
        if tensor.size != self.input_size {
            return Err(Error::Size {
                requested: tensor.size,
                supported: vec![self.input_size],
            });
        }

        input.write(&tensor.to_nhwc_u8());
        ctx.run()?;

        let shapes = self.schema.tensor_shapes(self.input_size);
        let mut tensors = Vec::with_capacity(shapes.len());
        for ((mem, native), (name, shape)) in self.outputs.iter().zip(shapes) {
            mem.sync_from_device(ctx)?;
            let data = native.to_rows(mem.bytes()).map_err(Error::Decode)?;
            tensors.push(OutputTensor::new(name, shape, data));
        }
        Ok(tensors)
    }

    fn input_sizes(&self) -> Vec<InputSize> {
        vec![self.input_size]
    }

    fn release(&mut self) {
        if self.ctx.is_none() {
            return;
        }
        // buffers first, the context must outlive them
        self.outputs.clear();
        self.input = None;
        self.ctx = None;
        debug!("NPU graph {} released", self.path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::model::tests::manifest;

    fn config(driver_lib: &str) -> DeviceConfig {
        DeviceConfig {
            driver_lib: PathBuf::from(driver_lib),
            vision_lib: None,
        }
    }

    #[test]
    fn test_missing_driver_is_resource_error() {
        let backend = DeviceBackend::new(config("/nonexistent/librknnmrt.so"), TargetVariant::Generic);
        let artifact = ModelArtifact::new(manifest(GraphFormat::Rknn), vec![1, 2, 3]);
        let err = backend.load(&artifact).err().unwrap();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_reference_graph_is_load_error() {
        let backend = DeviceBackend::new(config("/nonexistent/librknnmrt.so"), TargetVariant::Generic);
        let artifact = ModelArtifact::new(manifest(GraphFormat::Reference), vec![0; 4]);
        let err = backend.load(&artifact).err().unwrap();
        assert!(matches!(err, Error::Load { .. }));
    }

    #[test]
    fn test_rc_without_vision_lib_is_configuration_error() {
        let backend = DeviceBackend::new(config("/nonexistent/librknnmrt.so"), TargetVariant::Rc);
        let artifact = ModelArtifact::new(manifest(GraphFormat::Rknn), vec![1]);
        let err = backend.load(&artifact).err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_rc_preload_failure_is_resource_error() {
        let mut cfg = config("/nonexistent/librknnmrt.so");
        cfg.vision_lib = Some(PathBuf::from("/nonexistent/librga.so"));
        let backend = DeviceBackend::new(cfg, TargetVariant::Rc);
        let artifact = ModelArtifact::new(manifest(GraphFormat::Rknn), vec![1]);
        let err = backend.load(&artifact).err().unwrap();
        assert!(matches!(err, Error::Resource(_)));
    }
}
