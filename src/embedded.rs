//! C ABI for embedding the runner in a host application
//!
//! The caller owns the frame loop and hands over one frame per call:
//!
//! ```c
//! JdeEngine *engine = jde_engine_create("config.toml");
//! size_t n = 0;
//! JdeDetection dets[64];
//! int rc = jde_engine_process_frame(engine, pixels, len, w, h, 0 /* rgb8 */,
//!                                   dets, 64, NULL, &n);
//! jde_engine_destroy(engine);
//! ```
//!
//! Pixel format codes: 0 rgb8, 1 bgr8, 2 rgba8, 3 bgra8, 4 gray8, 5 nv12.
//! Every function returns 0 (or a non-null pointer) on success; failures
//! leave a message for [`jde_last_error_message`] on the calling thread.

use std::cell::RefCell;
use std::ffi::{c_char, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;

use tracing::{error, info};

use crate::config::Config;
use crate::engine::frame::{PixelFormat, RawFrame};
use crate::error::{Error, Result};
use crate::pipeline::Pipeline;

pub const JDE_OK: i32 = 0;
pub const JDE_ERR_INVALID_ARGUMENT: i32 = -8;
const JDE_ERR_PANIC: i32 = -9;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(message: String) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn report(err: &Error) -> i32 {
    error!("{}", err);
    set_last_error(err.to_string());
    err.code()
}

fn invalid(message: &str) -> i32 {
    set_last_error(message.to_string());
    JDE_ERR_INVALID_ARGUMENT
}

/// One detection as seen from C
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct JdeDetection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
    /// Row of the raw model output
    pub row: u32,
}

/// Opaque engine handle
pub struct JdeEngine {
    pipeline: Pipeline,
    next_index: u64,
    embedding_dim: usize,
}

impl JdeEngine {
    fn create(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        config.apply_env()?;
        crate::logging::init(&config.logging)?;

        let pipeline = Pipeline::from_config(&config)?;
        let embedding_dim = pipeline
            .handle()
            .schema()
            .map(|s| s.embedding_dim)
            .unwrap_or(0);
        info!("Embedded engine ready ({} input)", pipeline.in_size());
        Ok(Self {
            pipeline,
            next_index: 0,
            embedding_dim,
        })
    }
}

/// Create an engine from a TOML config file, or from defaults and
/// `JDE_*` environment variables when `config_path` is null.
///
/// # Safety
///
/// `config_path` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn jde_engine_create(config_path: *const c_char) -> *mut JdeEngine {
    let path = if config_path.is_null() {
        None
    } else {
        match CStr::from_ptr(config_path).to_str() {
            Ok(s) => Some(s.to_string()),
            Err(_) => {
                invalid("config path is not valid UTF-8");
                return std::ptr::null_mut();
            }
        }
    };

    let created = catch_unwind(|| JdeEngine::create(path.as_deref().map(Path::new)));
    match created {
        Ok(Ok(engine)) => Box::into_raw(Box::new(engine)),
        Ok(Err(e)) => {
            report(&e);
            std::ptr::null_mut()
        }
        Err(_) => {
            set_last_error("engine creation panicked".into());
            std::ptr::null_mut()
        }
    }
}

/// Embedding length per detection, or a negative code for a null engine.
///
/// # Safety
///
/// `engine` must be null or a pointer returned by [`jde_engine_create`].
#[no_mangle]
pub unsafe extern "C" fn jde_engine_embedding_dim(engine: *const JdeEngine) -> i32 {
    match engine.as_ref() {
        Some(engine) => engine.embedding_dim as i32,
        None => invalid("engine is null"),
    }
}

/// Run one frame through the pipeline.
///
/// Up to `capacity` detections are written to `out`; when `embeddings` is
/// non-null it receives `capacity * embedding_dim` floats in the same order.
/// `count` always receives the total number of detections, which may
/// exceed `capacity`.
///
/// # Safety
///
/// `engine` must come from [`jde_engine_create`]; `data` must point at `len`
/// readable bytes; `out` (and `embeddings`, when non-null) must be writable
/// for `capacity` entries; `count` must be writable.
#[no_mangle]
pub unsafe extern "C" fn jde_engine_process_frame(
    engine: *mut JdeEngine,
    data: *const u8,
    len: usize,
    width: u32,
    height: u32,
    format: u32,
    out: *mut JdeDetection,
    capacity: usize,
    embeddings: *mut f32,
    count: *mut usize,
) -> i32 {
    let Some(engine) = engine.as_mut() else {
        return invalid("engine is null");
    };
    if data.is_null() || count.is_null() || (out.is_null() && capacity > 0) {
        return invalid("null buffer");
    }
    let Some(format) = PixelFormat::from_code(format) else {
        return invalid("unknown pixel format code");
    };

    let pixels = std::slice::from_raw_parts(data, len).to_vec();
    let frame = RawFrame::new(width, height, format, pixels).with_index(engine.next_index);
    engine.next_index += 1;

    let processed = catch_unwind(AssertUnwindSafe(|| engine.pipeline.process_frame(&frame)));
    let detections = match processed {
        Ok(Ok(detections)) => detections,
        Ok(Err(e)) => return report(&e),
        Err(_) => {
            set_last_error("frame processing panicked".into());
            return JDE_ERR_PANIC;
        }
    };

    *count = detections.len();
    let dim = engine.embedding_dim;
    for (i, det) in detections.detections.iter().take(capacity).enumerate() {
        *out.add(i) = JdeDetection {
            x1: det.x1,
            y1: det.y1,
            x2: det.x2,
            y2: det.y2,
            confidence: det.confidence,
            class_id: det.class_id as u32,
            row: det.row as u32,
        };
        if !embeddings.is_null() {
            let dst = std::slice::from_raw_parts_mut(embeddings.add(i * dim), dim);
            dst.copy_from_slice(&det.embedding[..dim]);
        }
    }
    JDE_OK
}

/// Release the model and free the engine. Null is ignored.
///
/// # Safety
///
/// `engine` must be null or a pointer from [`jde_engine_create`] that has
/// not been destroyed yet.
#[no_mangle]
pub unsafe extern "C" fn jde_engine_destroy(engine: *mut JdeEngine) {
    if engine.is_null() {
        return;
    }
    let mut engine = Box::from_raw(engine);
    engine.pipeline.shutdown();
}

/// Message of the last failure on this thread, or null. Valid until the
/// next failing call on the same thread.
#[no_mangle]
pub extern "C" fn jde_last_error_message() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(std::ptr::null(), |message| message.as_ptr())
    })
}
