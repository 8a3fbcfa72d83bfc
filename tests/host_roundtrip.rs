//! Host backend against a live NPU daemon on loopback

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tokio::runtime::Runtime;

use jde_runner::config::{Config, DaemonConfig, HostConfig};
use jde_runner::daemon::NpuDaemon;
use jde_runner::engine::backend::LoadedModel;
use jde_runner::engine::host::HostBackend;
use jde_runner::engine::model::{GraphFormat, ModelArtifact, ModelManifest};
use jde_runner::engine::reference::{ReferenceGraph, ReferenceModel};
use jde_runner::engine::{
    BackendKind, InferenceEngine, InputEngine, InputSize, MemorySource, ModelHandle, PixelFormat,
    RawFrame,
};
use jde_runner::{Error, Pipeline};

const SIZE: InputSize = InputSize::new(64, 32);

/// Daemon served on a background runtime; dropped with the runtime.
struct Daemon {
    _rt: Runtime,
    addr: String,
}

fn start_daemon() -> Daemon {
    let rt = Runtime::new().unwrap();
    let config = DaemonConfig {
        listen: "127.0.0.1:0".to_string(),
        driver_lib: None,
    };
    let daemon = rt.block_on(NpuDaemon::bind(&config)).unwrap();
    let addr = daemon.local_addr().unwrap().to_string();
    rt.spawn(daemon.serve());
    Daemon { _rt: rt, addr }
}

fn host_config(addr: &str) -> HostConfig {
    HostConfig {
        daemon_addr: addr.to_string(),
        connect_timeout_ms: 1000,
        io_timeout_ms: 5000,
    }
}

fn manifest() -> ModelManifest {
    serde_json::from_str(
        r#"{
            "name": "jde-it",
            "graph_format": "reference",
            "input_sizes": [[64, 32]],
            "num_classes": 1,
            "embedding_dim": 8,
            "strides": [8, 16, 32],
            "anchors_per_cell": 2
        }"#,
    )
    .unwrap()
}

fn write_model(dir: &Path) -> PathBuf {
    let m = manifest();
    let path = dir.join("jde-it.jdem");
    ModelArtifact::new(m.clone(), ReferenceGraph::synthetic_blob(&m, 42))
        .save(&path)
        .unwrap();
    path
}

fn frame(index: u64) -> RawFrame {
    let data: Vec<u8> = (0..80 * 40 * 3).map(|i| ((i as u64 * 7 + index) % 251) as u8).collect();
    RawFrame::new(80, 40, PixelFormat::Rgb8, data).with_index(index)
}

#[test]
fn test_daemon_results_are_bit_identical() {
    let daemon = start_daemon();
    let dir = tempfile::tempdir().unwrap();
    let model = write_model(dir.path());

    let engine = InferenceEngine::new(Box::new(HostBackend::new(host_config(&daemon.addr))));
    assert_eq!(engine.kind(), BackendKind::Host);
    let mut handle = engine.initialize(&model).unwrap();
    // sizes come from the daemon's view of the loaded graph
    assert_eq!(handle.input_sizes(), vec![SIZE]);

    let input = InputEngine::new(vec![SIZE]).prepare(&frame(3), SIZE).unwrap();
    let first = engine.infer(&mut handle, &input).unwrap();
    let second = engine.infer(&mut handle, &input).unwrap();
    assert_eq!(first.tensors, second.tensors);

    // same graph executed locally
    let artifact = ModelArtifact::load(&model).unwrap();
    let graph = ReferenceGraph::from_blob(&artifact.manifest, &artifact.graph).unwrap();
    let local = ReferenceModel::new(graph).run(&input).unwrap();
    assert_eq!(first.tensors, local);

    // shapes follow the schema shared with the device backend
    let schema = handle.schema().unwrap();
    let shapes: Vec<(String, Vec<usize>)> = first
        .tensors
        .iter()
        .map(|t| (t.name.clone(), t.shape.clone()))
        .collect();
    let expected: Vec<(String, Vec<usize>)> = schema
        .tensor_shapes(SIZE)
        .into_iter()
        .map(|(n, s)| (n.to_string(), s))
        .collect();
    assert_eq!(shapes, expected);

    engine.shutdown(&mut handle);
    assert!(!handle.is_ready());
    assert!(matches!(
        engine.infer(&mut handle, &input).unwrap_err(),
        Error::Resource(_)
    ));
}

#[test]
fn test_unreachable_daemon_is_resource_error() {
    // bind then drop to get a port nobody listens on
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .to_string();
    let dir = tempfile::tempdir().unwrap();
    let model = write_model(dir.path());

    let engine = InferenceEngine::new(Box::new(HostBackend::new(host_config(&addr))));
    assert!(matches!(engine.initialize(&model).unwrap_err(), Error::Resource(_)));
}

#[test]
fn test_missing_model_is_load_error() {
    let daemon = start_daemon();
    let engine = InferenceEngine::new(Box::new(HostBackend::new(host_config(&daemon.addr))));
    let err = engine.initialize("/nonexistent/jde.jdem").unwrap_err();
    assert!(matches!(err, Error::Load { .. }));

    let mut handle = ModelHandle::uninitialized();
    let input = InputEngine::new(vec![SIZE]).prepare(&frame(0), SIZE).unwrap();
    assert!(matches!(
        engine.infer(&mut handle, &input).unwrap_err(),
        Error::Resource(_)
    ));
}

#[test]
fn test_daemon_rejects_rknn_without_driver() {
    let daemon = start_daemon();
    let dir = tempfile::tempdir().unwrap();
    let mut m = manifest();
    m.graph_format = GraphFormat::Rknn;
    let path = dir.path().join("npu.jdem");
    ModelArtifact::new(m, vec![0; 16]).save(&path).unwrap();

    let engine = InferenceEngine::new(Box::new(HostBackend::new(host_config(&daemon.addr))));
    assert!(matches!(engine.initialize(&path).unwrap_err(), Error::Load { .. }));
}

#[test]
fn test_pipeline_over_host_backend() {
    let daemon = start_daemon();
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.runtime.backend = BackendKind::Host;
    config.host = host_config(&daemon.addr);
    config.model.path = Some(write_model(dir.path()));
    config.output.conf_threshold = 0.0;
    config.output.nms_threshold = Some(0.5);
    config.output.json_path = Some(dir.path().join("detections.jsonl"));

    let mut pipeline = Pipeline::from_config(&config).unwrap();
    assert_eq!(pipeline.in_size(), SIZE);

    let mut source = MemorySource::new(vec![frame(0), frame(1), frame(2)]);
    let stats = pipeline.run(&mut source, &AtomicBool::new(false)).unwrap();
    assert_eq!(stats.frames, 3);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.skipped, 0);

    let text = std::fs::read_to_string(dir.path().join("detections.jsonl")).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[2]["frame_index"], 2);

    pipeline.shutdown();
    assert!(!pipeline.handle().is_ready());
}
