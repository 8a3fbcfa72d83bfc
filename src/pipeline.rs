//! Standalone orchestrator
//!
//! Pulls frames from a [`FrameSource`] and runs each one through
//! input, inference and output, one frame at a time.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::{Config, PipelineConfig};
use crate::engine::backend::{InferenceEngine, ModelHandle};
use crate::engine::frame::{FrameSource, RawFrame};
use crate::engine::postprocess::{render, FrameDetections, JsonLinesSink, OutputEngine, OutputOptions};
use crate::engine::preprocess::{InputEngine, InputSize};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub frames: usize,
    pub processed: usize,
    pub skipped: usize,
    pub detections: usize,
    pub elapsed: Duration,
}

impl RunStats {
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

pub struct Pipeline {
    engine: InferenceEngine,
    handle: ModelHandle,
    input: InputEngine,
    output: OutputEngine,
    in_size: InputSize,
    settings: PipelineConfig,
    render_dir: Option<PathBuf>,
    sink: Option<JsonLinesSink<BufWriter<File>>>,
}

impl Pipeline {
    /// Build the configured backend and load the model.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let engine = InferenceEngine::from_config(config)?;
        let handle = engine.initialize(config.resolve_model_path()?)?;
        Self::new(engine, handle, config)
    }

    /// Wire the stages around an initialized handle.
    pub fn new(engine: InferenceEngine, handle: ModelHandle, config: &Config) -> Result<Self> {
        let supported = handle.input_sizes();
        let schema = handle
            .schema()
            .ok_or_else(|| Error::Resource("model handle was never initialized".into()))?;

        let in_size = match config.in_size() {
            Some(size) if supported.contains(&size) => size,
            Some(size) => {
                return Err(Error::Size {
                    requested: size,
                    supported,
                })
            }
            None => *supported
                .first()
                .ok_or_else(|| Error::Configuration("model declares no input sizes".into()))?,
        };

        if let Some(dir) = &config.output.render_dir {
            std::fs::create_dir_all(dir)?;
        }
        let sink = match &config.output.json_path {
            Some(path) => Some(JsonLinesSink::create(path)?),
            None => None,
        };

        info!("Pipeline ready: {} backend, input {}", engine.kind(), in_size);
        Ok(Self {
            engine,
            handle,
            input: InputEngine::new(supported),
            output: OutputEngine::new(
                schema,
                OutputOptions {
                    conf_threshold: config.output.conf_threshold,
                    nms_threshold: config.output.nms_threshold,
                },
            ),
            in_size,
            settings: config.pipeline.clone(),
            render_dir: config.output.render_dir.clone(),
            sink,
        })
    }

    pub fn in_size(&self) -> InputSize {
        self.in_size
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Input, inference and output for one frame.
    pub fn process_frame(&mut self, frame: &RawFrame) -> Result<FrameDetections> {
        let tensor = self.input.prepare(frame, self.in_size)?;
        let result = self.engine.infer(&mut self.handle, &tensor)?;
        self.output.decode(&result)
    }

    fn emit(&mut self, frame: &RawFrame, detections: &FrameDetections) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.write(detections)?;
        }
        if let Some(dir) = &self.render_dir {
            let path = dir.join(format!("{:05}.png", frame.index));
            render(frame, detections)?
                .save(&path)
                .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        }
        Ok(())
    }

    /// Process frames until the source is exhausted or `stop` is set.
    pub fn run(&mut self, source: &mut dyn FrameSource, stop: &AtomicBool) -> Result<RunStats> {
        let start = Instant::now();
        let mut stats = RunStats::default();
        let mut consecutive_failures = 0usize;
        let mut window = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            let Some(next) = source.next_frame() else {
                break;
            };
            stats.frames += 1;

            // outer error: input or inference; inner error: writing outputs
            let outcome = next.and_then(|frame| {
                let detections = self.process_frame(&frame)?;
                Ok(self.emit(&frame, &detections).map(|_| detections))
            });
            let (outcome, output_failed) = match outcome {
                Ok(Ok(detections)) => (Ok(detections), false),
                Ok(Err(e)) => (Err(e), true),
                Err(e) => (Err(e), false),
            };

            match outcome {
                Ok(detections) => {
                    consecutive_failures = 0;
                    stats.processed += 1;
                    stats.detections += detections.len();
                    debug!("Frame {}: {} detections", detections.frame_index, detections.len());
                }
                Err(e) if output_failed || e.is_frame_local() => {
                    consecutive_failures += 1;
                    stats.skipped += 1;
                    warn!("Skipping frame {}: {}", stats.frames - 1, e);
                    if consecutive_failures >= self.settings.max_consecutive_failures {
                        error!("{} consecutive frames failed, aborting", consecutive_failures);
                        self.finish()?;
                        return Err(e);
                    }
                }
                Err(e) => {
                    error!("Fatal error at frame {}: {}", stats.frames - 1, e);
                    self.finish()?;
                    return Err(e);
                }
            }

            if self.settings.print_interval > 0 && stats.frames % self.settings.print_interval == 0 {
                let secs = window.elapsed().as_secs_f64();
                info!(
                    "Processed {} frames ({} skipped), {:.1} fps",
                    stats.frames,
                    stats.skipped,
                    self.settings.print_interval as f64 / secs.max(1e-9)
                );
                window = Instant::now();
            }
        }

        if stop.load(Ordering::Relaxed) {
            info!("Stop requested");
        }
        self.finish()?;
        stats.elapsed = start.elapsed();
        info!(
            "Run finished: {} frames, {} processed, {} skipped, {} detections, {:.1} fps",
            stats.frames,
            stats.processed,
            stats.skipped,
            stats.detections,
            stats.fps()
        );
        Ok(stats)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        Ok(())
    }

    /// Release the model. Also happens on drop.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Flushing detections failed: {}", e);
        }
        self.engine.shutdown(&mut self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::backend::{Backend, BackendKind, LoadedModel, OutputTensor};
    use crate::engine::frame::{MemorySource, PixelFormat};
    use crate::engine::model::tests::manifest;
    use crate::engine::model::{GraphFormat, ModelArtifact};
    use crate::engine::preprocess::PreparedTensor;
    use crate::engine::reference::{ReferenceGraph, ReferenceModel};

    /// Runs reference graphs in-process
    struct InProcess;

    impl Backend for InProcess {
        fn kind(&self) -> BackendKind {
            BackendKind::Host
        }

        fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>> {
            let graph = ReferenceGraph::from_blob(&artifact.manifest, &artifact.graph)
                .map_err(|r| Error::load(&artifact.path, r))?;
            Ok(Box::new(ReferenceModel::new(graph)))
        }
    }

    /// Fails every run with a resource error
    struct Broken;
    struct BrokenModel;

    impl Backend for Broken {
        fn kind(&self) -> BackendKind {
            BackendKind::Host
        }

        fn load(&self, _artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>> {
            Ok(Box::new(BrokenModel))
        }
    }

    impl LoadedModel for BrokenModel {
        fn run(&mut self, _input: &PreparedTensor) -> Result<Vec<OutputTensor>> {
            Err(Error::Resource("daemon went away".into()))
        }

        fn input_sizes(&self) -> Vec<InputSize> {
            vec![InputSize::new(64, 32)]
        }

        fn release(&mut self) {}
    }

    /// Reference graph compiled for a single input size, as an NPU graph is
    struct SingleSize(InputSize);

    struct SingleSizeModel {
        inner: ReferenceModel,
        size: InputSize,
    }

    impl Backend for SingleSize {
        fn kind(&self) -> BackendKind {
            BackendKind::Device
        }

        fn load(&self, artifact: &ModelArtifact) -> Result<Box<dyn LoadedModel>> {
            let graph = ReferenceGraph::from_blob(&artifact.manifest, &artifact.graph)
                .map_err(|r| Error::load(&artifact.path, r))?;
            Ok(Box::new(SingleSizeModel {
                inner: ReferenceModel::new(graph),
                size: self.0,
            }))
        }
    }

    impl LoadedModel for SingleSizeModel {
        fn run(&mut self, input: &PreparedTensor) -> Result<Vec<OutputTensor>> {
            if input.size != self.size {
                return Err(Error::Size {
                    requested: input.size,
                    supported: vec![self.size],
                });
            }
            self.inner.run(input)
        }

        fn input_sizes(&self) -> Vec<InputSize> {
            vec![self.size]
        }

        fn release(&mut self) {}
    }

    fn pipeline(dir: &std::path::Path, backend: Box<dyn Backend>, config: &Config) -> Pipeline {
        let m = manifest(GraphFormat::Reference);
        let blob = ReferenceGraph::synthetic_blob(&m, 11);
        let path = dir.join("m.jdem");
        ModelArtifact::new(m, blob).save(&path).unwrap();

        let engine = InferenceEngine::new(backend);
        let handle = engine.initialize(&path).unwrap();
        Pipeline::new(engine, handle, config).unwrap()
    }

    fn good(index: u64) -> RawFrame {
        RawFrame::new(40, 20, PixelFormat::Rgb8, vec![(index * 20) as u8; 40 * 20 * 3]).with_index(index)
    }

    fn bad(index: u64) -> RawFrame {
        RawFrame::new(40, 20, PixelFormat::Nv12, vec![0; 40 * 20 * 3 / 2]).with_index(index)
    }

    #[test]
    fn test_run_skips_bad_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output.conf_threshold = 0.0;
        config.output.json_path = Some(dir.path().join("out/detections.jsonl"));
        let mut p = pipeline(dir.path(), Box::new(InProcess), &config);

        let mut source = MemorySource::new(vec![good(0), bad(1), good(2)]);
        let stats = p.run(&mut source, &AtomicBool::new(false)).unwrap();

        assert_eq!(stats.frames, 3);
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.skipped, 1);
        // threshold 0 keeps every row
        assert_eq!(stats.detections, 2 * 84);

        let text = std::fs::read_to_string(dir.path().join("out/detections.jsonl")).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_run_aborts_after_consecutive_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.pipeline.max_consecutive_failures = 2;
        let mut p = pipeline(dir.path(), Box::new(InProcess), &config);

        let mut source = MemorySource::new(vec![bad(0), good(1), bad(2), bad(3), good(4)]);
        let err = p.run(&mut source, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        // frame 4 was never pulled
        assert_eq!(source.remaining(), 1);
    }

    #[test]
    fn test_inference_errors_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), Box::new(Broken), &Config::default());
        let mut source = MemorySource::new(vec![good(0), good(1)]);
        let err = p.run(&mut source, &AtomicBool::new(false)).unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
    }

    #[test]
    fn test_stop_flag_ends_run() {
        let dir = tempfile::tempdir().unwrap();
        let mut p = pipeline(dir.path(), Box::new(InProcess), &Config::default());
        let mut source = MemorySource::new(vec![good(0), good(1)]);
        let stats = p.run(&mut source, &AtomicBool::new(true)).unwrap();
        assert_eq!(stats.frames, 0);
    }

    #[test]
    fn test_unsupported_in_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(GraphFormat::Reference);
        let path = dir.path().join("m.jdem");
        ModelArtifact::new(m.clone(), ReferenceGraph::synthetic_blob(&m, 1))
            .save(&path)
            .unwrap();
        let engine = InferenceEngine::new(Box::new(InProcess));
        let handle = engine.initialize(&path).unwrap();

        let mut config = Config::default();
        config.input.in_size = Some([576, 320]);
        assert!(matches!(
            Pipeline::new(engine, handle, &config).err().unwrap(),
            Error::Size { .. }
        ));
    }

    #[test]
    fn test_default_size_follows_loaded_graph() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(GraphFormat::Reference);
        m.input_sizes = vec![[64, 32], [128, 64]];
        let path = dir.path().join("m.jdem");
        ModelArtifact::new(m.clone(), ReferenceGraph::synthetic_blob(&m, 5))
            .save(&path)
            .unwrap();

        let engine = InferenceEngine::new(Box::new(SingleSize(InputSize::new(128, 64))));
        let handle = engine.initialize(&path).unwrap();
        assert_eq!(handle.input_sizes(), vec![InputSize::new(128, 64)]);

        let mut p = Pipeline::new(engine, handle, &Config::default()).unwrap();
        assert_eq!(p.in_size(), InputSize::new(128, 64));

        let mut source = MemorySource::new(vec![good(0), good(1)]);
        let stats = p.run(&mut source, &AtomicBool::new(false)).unwrap();
        assert_eq!(stats.processed, 2);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn test_manifest_size_the_graph_lacks_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = manifest(GraphFormat::Reference);
        m.input_sizes = vec![[64, 32], [128, 64]];
        let path = dir.path().join("m.jdem");
        ModelArtifact::new(m.clone(), ReferenceGraph::synthetic_blob(&m, 5))
            .save(&path)
            .unwrap();

        let engine = InferenceEngine::new(Box::new(SingleSize(InputSize::new(128, 64))));
        let handle = engine.initialize(&path).unwrap();
        let mut config = Config::default();
        config.input.in_size = Some([64, 32]);
        assert!(matches!(
            Pipeline::new(engine, handle, &config).err().unwrap(),
            Error::Size { .. }
        ));
    }

    #[test]
    fn test_graph_outside_manifest_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let m = manifest(GraphFormat::Reference);
        let path = dir.path().join("m.jdem");
        ModelArtifact::new(m.clone(), ReferenceGraph::synthetic_blob(&m, 5))
            .save(&path)
            .unwrap();

        let engine = InferenceEngine::new(Box::new(SingleSize(InputSize::new(96, 64))));
        assert!(matches!(engine.initialize(&path).unwrap_err(), Error::Load { .. }));
    }

    #[test]
    fn test_output_write_failure_skips_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output.render_dir = Some(dir.path().join("render"));
        config.pipeline.max_consecutive_failures = 5;
        let mut p = pipeline(dir.path(), Box::new(InProcess), &config);

        // a directory where the image should go makes the save fail
        std::fs::create_dir_all(dir.path().join("render/00000.png")).unwrap();
        let mut source = MemorySource::new(vec![good(0), good(1)]);
        let stats = p.run(&mut source, &AtomicBool::new(false)).unwrap();

        assert_eq!(stats.frames, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.processed, 1);
        assert!(dir.path().join("render/00001.png").is_file());
    }

    #[test]
    fn test_render_dir_receives_images() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.output.render_dir = Some(dir.path().join("render"));
        let mut p = pipeline(dir.path(), Box::new(InProcess), &config);

        // memory sources number frames from zero
        let mut source = MemorySource::new(vec![good(7)]);
        p.run(&mut source, &AtomicBool::new(false)).unwrap();
        assert!(dir.path().join("render/00000.png").exists());

        p.shutdown();
        assert!(!p.handle().is_ready());
    }
}
