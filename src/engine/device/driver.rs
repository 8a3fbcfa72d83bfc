//! Runtime library loading and NPU context lifetime

use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use super::ffi::*;
use crate::error::{Error, Result};

/// Resolved driver entry points. Keeps the library mapped.
pub struct Driver {
    pub(super) init: FnInit,
    pub(super) query: FnQuery,
    pub(super) run: FnRun,
    pub(super) destroy: FnDestroy,
    pub(super) create_mem: FnCreateMem,
    pub(super) destroy_mem: FnDestroyMem,
    pub(super) set_io_mem: FnSetIoMem,
    pub(super) mem_sync: FnMemSync,
    _lib: libloading::Library,
}

fn symbol<T: Copy>(lib: &libloading::Library, name: &str) -> Result<T> {
    // SAFETY: the caller names the matching C signature in `T`
    unsafe {
        lib.get::<T>(name.as_bytes())
            .map(|s| *s)
            .map_err(|e| Error::Resource(format!("driver symbol {} missing: {}", name, e)))
    }
}

impl Driver {
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        // SAFETY: loading the vendor runtime runs its initialisers
        let lib = unsafe { libloading::Library::new(path) }.map_err(|e| {
            Error::Resource(format!("NPU driver {} unavailable: {}", path.display(), e))
        })?;

        let driver = Self {
            init: symbol(&lib, "rknn_init")?,
            query: symbol(&lib, "rknn_query")?,
            run: symbol(&lib, "rknn_run")?,
            destroy: symbol(&lib, "rknn_destroy")?,
            create_mem: symbol(&lib, "rknn_create_mem")?,
            destroy_mem: symbol(&lib, "rknn_destroy_mem")?,
            set_io_mem: symbol(&lib, "rknn_set_io_mem")?,
            mem_sync: symbol(&lib, "rknn_mem_sync")?,
            _lib: lib,
        };
        info!("Loaded NPU driver {}", path.display());
        Ok(Arc::new(driver))
    }
}

/// Load a library with globally visible symbols, so the driver loaded
/// afterwards can bind against it.
#[cfg(unix)]
pub fn preload_global(path: &Path) -> Result<libloading::Library> {
    use libloading::os::unix::{Library, RTLD_GLOBAL, RTLD_NOW};

    // SAFETY: as for the driver itself
    let lib = unsafe { Library::open(Some(path), RTLD_NOW | RTLD_GLOBAL) }.map_err(|e| {
        Error::Resource(format!("vision runtime {} unavailable: {}", path.display(), e))
    })?;
    info!("Preloaded vision runtime {}", path.display());
    Ok(lib.into())
}

#[cfg(not(unix))]
pub fn preload_global(path: &Path) -> Result<libloading::Library> {
    Err(Error::Resource(format!(
        "cannot preload {} with global symbols on this platform",
        path.display()
    )))
}

/// An initialised graph. Destroyed on drop.
pub struct Context {
    pub(super) raw: RawContext,
    pub(super) driver: Arc<Driver>,
}

impl Context {
    pub fn init(driver: Arc<Driver>, graph: &[u8]) -> std::result::Result<Self, String> {
        if graph.is_empty() {
            return Err("empty graph".into());
        }
        let mut raw: RawContext = 0;
        // SAFETY: graph outlives the call; the driver copies it
        let ret = unsafe {
            (driver.init)(
                &mut raw,
                graph.as_ptr() as *const c_void,
                graph.len() as u32,
                0,
                std::ptr::null(),
            )
        };
        if ret != 0 {
            return Err(format!("driver rejected graph (rknn_init code {})", ret));
        }
        debug!("NPU context {} created", raw);
        Ok(Self { raw, driver })
    }

    fn query<T>(&self, cmd: u32, out: &mut T) -> Result<()> {
        // SAFETY: `out` is the repr(C) struct the command fills
        let ret = unsafe {
            (self.driver.query)(
                self.raw,
                cmd,
                out as *mut T as *mut c_void,
                std::mem::size_of::<T>() as u32,
            )
        };
        if ret != 0 {
            return Err(Error::Resource(format!("rknn_query({}) failed with code {}", cmd, ret)));
        }
        Ok(())
    }

    pub fn io_num(&self) -> Result<(u32, u32)> {
        let mut num = InputOutputNum {
            n_input: 0,
            n_output: 0,
        };
        self.query(QUERY_IN_OUT_NUM, &mut num)?;
        Ok((num.n_input, num.n_output))
    }

    pub fn input_attr_nhwc(&self, index: u32) -> Result<TensorAttr> {
        let mut attr = TensorAttr::with_index(index);
        self.query(QUERY_NATIVE_NHWC_INPUT_ATTR, &mut attr)?;
        Ok(attr)
    }

    pub fn output_attr_native(&self, index: u32) -> Result<TensorAttr> {
        let mut attr = TensorAttr::with_index(index);
        self.query(QUERY_NATIVE_OUTPUT_ATTR, &mut attr)?;
        Ok(attr)
    }

    pub fn run(&self) -> Result<()> {
        // SAFETY: all io memory is bound before the first run
        let ret = unsafe { (self.driver.run)(self.raw, std::ptr::null()) };
        if ret != 0 {
            return Err(Error::Resource(format!("rknn_run failed with code {}", ret)));
        }
        Ok(())
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // SAFETY: every buffer bound to this context is dropped first
        unsafe {
            (self.driver.destroy)(self.raw);
        }
        debug!("NPU context {} destroyed", self.raw);
    }
}
