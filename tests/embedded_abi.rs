//! C ABI create/process/destroy against a live NPU daemon on loopback

use std::ffi::{CStr, CString};
use std::path::Path;

use tokio::runtime::Runtime;

use jde_runner::config::DaemonConfig;
use jde_runner::daemon::NpuDaemon;
use jde_runner::embedded::{
    jde_engine_create, jde_engine_destroy, jde_engine_embedding_dim, jde_engine_process_frame,
    jde_last_error_message, JdeDetection, JDE_OK,
};
use jde_runner::engine::model::{ModelArtifact, ModelManifest};
use jde_runner::engine::reference::ReferenceGraph;

const EMBEDDING_DIM: usize = 8;
/// 8x4 + 4x2 + 2x1 cells, two anchors each
const ROWS: usize = 84;

fn start_daemon() -> (Runtime, String) {
    let rt = Runtime::new().unwrap();
    let config = DaemonConfig {
        listen: "127.0.0.1:0".to_string(),
        driver_lib: None,
    };
    let daemon = rt.block_on(NpuDaemon::bind(&config)).unwrap();
    let addr = daemon.local_addr().unwrap().to_string();
    rt.spawn(daemon.serve());
    (rt, addr)
}

fn write_config(dir: &Path, addr: &str) -> CString {
    let manifest: ModelManifest = serde_json::from_str(
        r#"{
            "name": "jde-abi",
            "graph_format": "reference",
            "input_sizes": [[64, 32]],
            "num_classes": 1,
            "embedding_dim": 8,
            "strides": [8, 16, 32],
            "anchors_per_cell": 2
        }"#,
    )
    .unwrap();
    let model = dir.join("jde-abi.jdem");
    ModelArtifact::new(manifest.clone(), ReferenceGraph::synthetic_blob(&manifest, 7))
        .save(&model)
        .unwrap();

    let config = dir.join("config.toml");
    let text = format!(
        "[runtime]\nbackend = \"host\"\n\n\
         [host]\ndaemon_addr = {:?}\nconnect_timeout_ms = 1000\nio_timeout_ms = 5000\n\n\
         [model]\npath = {:?}\n\n\
         [output]\nconf_threshold = 0.0\n",
        addr,
        model.to_str().unwrap()
    );
    std::fs::write(&config, text).unwrap();
    CString::new(config.to_str().unwrap()).unwrap()
}

#[test]
fn test_create_process_destroy() {
    let (_rt, addr) = start_daemon();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &addr);

    let engine = unsafe { jde_engine_create(config.as_ptr()) };
    if engine.is_null() {
        let message = unsafe { CStr::from_ptr(jde_last_error_message()) };
        panic!("create failed: {}", message.to_string_lossy());
    }
    assert_eq!(unsafe { jde_engine_embedding_dim(engine) }, EMBEDDING_DIM as i32);

    let (width, height) = (80u32, 40u32);
    let pixels: Vec<u8> = (0..width * height * 3).map(|i| (i * 13 % 251) as u8).collect();

    const CAPACITY: usize = 4;
    let mut out = [JdeDetection::default(); CAPACITY];
    let mut embeddings = vec![f32::NAN; CAPACITY * EMBEDDING_DIM];
    // sentinel past the requested capacity
    embeddings.push(-1.0);
    let mut count = 0usize;

    for _ in 0..2 {
        let rc = unsafe {
            jde_engine_process_frame(
                engine,
                pixels.as_ptr(),
                pixels.len(),
                width,
                height,
                0,
                out.as_mut_ptr(),
                CAPACITY,
                embeddings.as_mut_ptr(),
                &mut count,
            )
        };
        assert_eq!(rc, JDE_OK);
        // total is reported even past the caller's capacity
        assert_eq!(count, ROWS);
        assert!(count > CAPACITY);
    }

    for det in &out {
        assert!(det.x2 >= det.x1 && det.y2 >= det.y1);
        assert!(det.x1 >= 0.0 && det.x2 <= width as f32);
        assert!(det.y1 >= 0.0 && det.y2 <= height as f32);
        assert!(det.confidence > 0.0 && det.confidence <= 1.0);
        assert_eq!(det.class_id, 0);
    }
    for embedding in embeddings[..CAPACITY * EMBEDDING_DIM].chunks(EMBEDDING_DIM) {
        assert!(embedding.iter().all(|v| v.is_finite()));
        let norm = embedding.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "norm {}", norm);
    }
    assert_eq!(embeddings[CAPACITY * EMBEDDING_DIM], -1.0);

    unsafe { jde_engine_destroy(engine) };
}

#[test]
fn test_bad_frame_leaves_engine_usable() {
    let (_rt, addr) = start_daemon();
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path(), &addr);

    let engine = unsafe { jde_engine_create(config.as_ptr()) };
    assert!(!engine.is_null());

    let mut count = 0usize;
    let mut out = [JdeDetection::default(); 1];
    // buffer too short for 80x40 rgb8
    let short = vec![0u8; 16];
    let rc = unsafe {
        jde_engine_process_frame(
            engine,
            short.as_ptr(),
            short.len(),
            80,
            40,
            0,
            out.as_mut_ptr(),
            1,
            std::ptr::null_mut(),
            &mut count,
        )
    };
    assert!(rc < 0);
    assert!(!jde_last_error_message().is_null());

    let pixels = vec![90u8; 80 * 40 * 3];
    let rc = unsafe {
        jde_engine_process_frame(
            engine,
            pixels.as_ptr(),
            pixels.len(),
            80,
            40,
            0,
            out.as_mut_ptr(),
            1,
            std::ptr::null_mut(),
            &mut count,
        )
    };
    assert_eq!(rc, JDE_OK);
    assert_eq!(count, ROWS);

    unsafe { jde_engine_destroy(engine) };
}
